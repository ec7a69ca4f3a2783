//! Host platform abstraction.
//!
//! Defines the `AccessoryPlatform` trait for accessory enumeration,
//! permission handling and opening, plus the stream handles an opened
//! accessory yields. Implementations: `MockPlatform`, `DeviceNodePlatform`.

use std::io;
use std::sync::{Arc, Weak};

use thiserror::Error;

use crate::identity::AccessoryDescriptor;

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Accessory discovery failed: {0}")]
    DiscoveryFailed(String),

    #[error("Failed to open accessory: {0}")]
    OpenFailed(String),

    #[error("Permission request failed: {0}")]
    PermissionRequestFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Abstract accessory platform.
///
/// Notifications (permission results, detach) are delivered through the
/// `PlatformNotifier` handed to `register`. They may be delivered from any
/// thread, including from inside `request_permission`.
pub trait AccessoryPlatform: Send + Sync {
    /// Start delivering notifications to `notifier`.
    fn register(&self, notifier: PlatformNotifier);

    /// Stop delivering notifications.
    fn unregister(&self);

    /// Find the attached accessory, if any. At most one can be attached.
    fn discover(&self) -> Result<Option<AccessoryDescriptor>, PlatformError>;

    /// Whether the caller may open the accessory.
    fn has_permission(&self, accessory: &AccessoryDescriptor) -> bool;

    /// Ask for access. The answer arrives via `PlatformNotifier::permission_result`.
    fn request_permission(&self, accessory: &AccessoryDescriptor) -> Result<(), PlatformError>;

    /// Open the accessory.
    fn open(&self, accessory: &AccessoryDescriptor) -> Result<AccessoryStreams, PlatformError>;
}

/// A handle that can be closed from any thread.
pub trait Closeable: Send + Sync {
    /// Close the handle. Closing twice must not fail.
    fn close(&self) -> io::Result<()>;
}

/// Readable side of an opened accessory.
pub trait InputStream: Closeable {
    /// Read into `buf`, returning the number of bytes read. 0 is an empty packet.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Writable side of an opened accessory.
pub trait OutputStream: Closeable {
    /// Write from `data`, returning the number of bytes accepted.
    fn write(&self, data: &[u8]) -> io::Result<usize>;

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    fn write_all(&self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            match self.write(data) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => data = &data[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Handles of an opened accessory, all backed by the same descriptor.
pub struct AccessoryStreams {
    pub file: Box<dyn Closeable>,
    pub input: Arc<dyn InputStream>,
    pub output: Arc<dyn OutputStream>,
}

impl AccessoryStreams {
    /// Close every handle once. Failures are logged and do not stop the
    /// remaining handles from being closed.
    pub fn release(self) {
        log_close("file", self.file.close());
        log_close("input", self.input.close());
        log_close("output", self.output.close());
    }
}

fn log_close(handle: &str, result: io::Result<()>) {
    if let Err(e) = result {
        tracing::warn!(handle = handle, error = %e, "Failed to close accessory handle");
    }
}

/// Receiver side of platform notifications, implemented by the connection.
pub(crate) trait NotificationTarget: Send + Sync {
    fn permission_result(&self, granted: bool);
    fn detached(&self);
}

/// Handle the platform uses to notify a connection.
///
/// Holds a weak reference: notifications for a dropped connection are ignored.
#[derive(Clone)]
pub struct PlatformNotifier {
    target: Weak<dyn NotificationTarget>,
}

impl PlatformNotifier {
    pub(crate) fn new(target: Weak<dyn NotificationTarget>) -> Self {
        Self { target }
    }

    /// Permission prompt resolved.
    pub fn permission_result(&self, granted: bool) {
        match self.target.upgrade() {
            Some(target) => target.permission_result(granted),
            None => tracing::debug!(granted, "Permission result for dropped connection"),
        }
    }

    /// Accessory detached.
    pub fn detached(&self) {
        match self.target.upgrade() {
            Some(target) => target.detached(),
            None => tracing::debug!("Detach for dropped connection"),
        }
    }
}

impl std::fmt::Debug for PlatformNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformNotifier")
            .field("alive", &(self.target.strong_count() > 0))
            .finish()
    }
}
