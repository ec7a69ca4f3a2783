//! AOA-Core: Android Open Accessory connection management in Rust.
//!
//! This crate manages the device side of one USB accessory attachment:
//! discovery, identity validation, permission request, stream open,
//! background read loop, writes and teardown.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Identity**: Expected accessory strings and discovered descriptors
//! - **Platform**: Host USB subsystem abstraction (device node, mock)
//! - **State**: Lifecycle state machine and transition handlers
//! - **Worker**: Single-threaded job queue running the read loop
//! - **Events**: Event sink for application code
//! - **Connection**: High-level orchestrator
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use aoa_core::{AccessoryConnection, AccessoryIdentity, ConnectionConfig, DeviceNodePlatform};
//!
//! let identity = AccessoryIdentity::new("Acme", "Widget", "1.0").unwrap();
//! let config = ConnectionConfig::new(identity);
//! let platform = Arc::new(DeviceNodePlatform::new(&config.device_node));
//!
//! let connection = AccessoryConnection::new(platform, &config).unwrap();
//! connection.start().unwrap();
//! connection.write(b"hello").unwrap();
//! connection.stop();
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod identity;
pub mod platform;
pub mod state;
pub mod worker;

// Re-exports for convenience
pub use config::{ConnectionConfig, DeviceNodeConfig};
pub use connection::AccessoryConnection;
pub use error::ConnectionError;
pub use events::{ChannelSink, EventSink, InboundEvent, NullSink, TracingSink};
pub use identity::{AccessoryDescriptor, AccessoryIdentity, IdentityField};
#[cfg(any(target_os = "linux", target_os = "android"))]
pub use platform::DeviceNodePlatform;
pub use platform::{
    AccessoryPlatform, AccessoryStreams, MockPlatform, PlatformError, PlatformNotifier,
};
pub use state::ConnectionState;
