//! Platform layer module.

#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod device_node;
pub mod mock;
pub mod traits;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub use device_node::DeviceNodePlatform;
pub use mock::{CloseCounts, MockPlatform};
pub use traits::{
    AccessoryPlatform, AccessoryStreams, Closeable, InputStream, OutputStream, PlatformError,
    PlatformNotifier,
};
