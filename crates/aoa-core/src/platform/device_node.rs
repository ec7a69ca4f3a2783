//! Accessory platform backed by the kernel accessory gadget node.
//!
//! The `f_accessory` function driver exposes the attached accessory as a
//! character device (`/dev/usb_accessory`). Identification strings are read
//! with the driver's `ACCESSORY_GET_STRING_*` ioctls. There is no permission
//! prompt for a device node: access is whatever the file mode allows.
//!
//! Reads park in `poll(2)` on the node and a wake pipe, so closing the input
//! interrupts a read still waiting for the host. A read failing with `ENODEV`
//! or `ESHUTDOWN` means the gadget was unplugged and is reported through the
//! registered notifier as a detach.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, instrument};

use super::traits::{
    AccessoryPlatform, AccessoryStreams, Closeable, InputStream, OutputStream, PlatformError,
    PlatformNotifier,
};
use crate::config::DeviceNodeConfig;
use crate::identity::AccessoryDescriptor;

/// Size of each string buffer the driver fills in.
const ACCESSORY_STRING_LENGTH: usize = 256;

/// `_IOW('M', nr, char[256])`
const fn accessory_ioctl(nr: u64) -> u64 {
    (1 << 30) | ((ACCESSORY_STRING_LENGTH as u64) << 16) | ((b'M' as u64) << 8) | nr
}

const ACCESSORY_GET_STRING_MANUFACTURER: u64 = accessory_ioctl(1);
const ACCESSORY_GET_STRING_MODEL: u64 = accessory_ioctl(2);
const ACCESSORY_GET_STRING_DESCRIPTION: u64 = accessory_ioctl(3);
const ACCESSORY_GET_STRING_VERSION: u64 = accessory_ioctl(4);
const ACCESSORY_GET_STRING_URI: u64 = accessory_ioctl(5);
const ACCESSORY_GET_STRING_SERIAL: u64 = accessory_ioctl(6);

type NotifierSlot = Arc<Mutex<Option<PlatformNotifier>>>;

/// Device node accessory platform.
pub struct DeviceNodePlatform {
    path: PathBuf,
    /// Shared with open input streams so a read can report a detach.
    notifier: NotifierSlot,
}

impl DeviceNodePlatform {
    pub fn new(config: &DeviceNodeConfig) -> Self {
        Self {
            path: config.path.clone(),
            notifier: Arc::new(Mutex::new(None)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_node(&self) -> io::Result<File> {
        OpenOptions::new().read(true).write(true).open(&self.path)
    }

    fn read_descriptor(&self, node: &File) -> io::Result<AccessoryDescriptor> {
        Ok(AccessoryDescriptor {
            manufacturer: read_string(node, ACCESSORY_GET_STRING_MANUFACTURER)?.unwrap_or_default(),
            model: read_string(node, ACCESSORY_GET_STRING_MODEL)?.unwrap_or_default(),
            version: read_string(node, ACCESSORY_GET_STRING_VERSION)?.unwrap_or_default(),
            description: read_string(node, ACCESSORY_GET_STRING_DESCRIPTION)?,
            uri: read_string(node, ACCESSORY_GET_STRING_URI)?,
            serial: read_string(node, ACCESSORY_GET_STRING_SERIAL)?,
        })
    }
}

fn read_string(node: &File, request: u64) -> io::Result<Option<String>> {
    let mut buf = [0u8; ACCESSORY_STRING_LENGTH];
    // SAFETY: the driver copies at most ACCESSORY_STRING_LENGTH bytes into `buf`,
    // which outlives the call.
    let ret = unsafe { libc::ioctl(node.as_raw_fd(), request as _, buf.as_mut_ptr()) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    if len == 0 {
        return Ok(None);
    }
    Ok(Some(String::from_utf8_lossy(&buf[..len]).into_owned()))
}

impl AccessoryPlatform for DeviceNodePlatform {
    fn register(&self, notifier: PlatformNotifier) {
        *self.notifier.lock().unwrap_or_else(PoisonError::into_inner) = Some(notifier);
    }

    fn unregister(&self) {
        self.notifier
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    #[instrument(skip(self), fields(path = %self.path.display()))]
    fn discover(&self) -> Result<Option<AccessoryDescriptor>, PlatformError> {
        if !self.path.exists() {
            debug!("Accessory node not present");
            return Ok(None);
        }
        let node = File::open(&self.path).map_err(|e| {
            PlatformError::DiscoveryFailed(format!("{}: {}", self.path.display(), e))
        })?;
        let descriptor = self.read_descriptor(&node).map_err(|e| {
            PlatformError::DiscoveryFailed(format!("{}: {}", self.path.display(), e))
        })?;
        info!(accessory = %descriptor, "Found accessory");
        Ok(Some(descriptor))
    }

    fn has_permission(&self, _accessory: &AccessoryDescriptor) -> bool {
        self.open_node().is_ok()
    }

    fn request_permission(&self, accessory: &AccessoryDescriptor) -> Result<(), PlatformError> {
        let granted = self.has_permission(accessory);
        debug!(granted, "Device node permission resolved without prompt");
        let notifier = self
            .notifier
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match notifier {
            Some(notifier) => {
                notifier.permission_result(granted);
                Ok(())
            }
            None => Err(PlatformError::PermissionRequestFailed(
                "no notifier registered".into(),
            )),
        }
    }

    #[instrument(skip(self, accessory), fields(path = %self.path.display()))]
    fn open(&self, accessory: &AccessoryDescriptor) -> Result<AccessoryStreams, PlatformError> {
        let node = self.open_node().map_err(|e| {
            PlatformError::OpenFailed(format!("{}: {}", self.path.display(), e))
        })?;
        let input = node.try_clone()?;
        let output = node.try_clone()?;

        let input = NodeInput::new(input, Arc::clone(&self.notifier))?;

        info!(accessory = %accessory, "Accessory node opened");
        Ok(AccessoryStreams {
            file: Box::new(NodeHandle::new(node)),
            input: Arc::new(input),
            output: Arc::new(NodeHandle::new(output)),
        })
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "handle closed")
}

/// Errors the gadget driver returns once the host side is gone.
fn is_detach_error(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::ENODEV) | Some(libc::ESHUTDOWN))
}

/// Self-pipe that interrupts a read parked in `poll`.
struct WakePipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl WakePipe {
    fn new() -> io::Result<Self> {
        let mut fds: [libc::c_int; 2] = [-1; 2];
        // SAFETY: `fds` has room for the two descriptors pipe2 fills in.
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) } < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: pipe2 succeeded, so both descriptors are open and owned by nobody else.
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        Ok(Self { read, write })
    }

    /// Make the read end readable. Never drained, so it stays signalled.
    fn wake(&self) -> io::Result<()> {
        let byte = 1u8;
        // SAFETY: writes one byte from a live local.
        let ret = unsafe { libc::write(self.write.as_raw_fd(), (&byte as *const u8).cast(), 1) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // A full pipe is already signalled.
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Block until `fd` is readable. Returns `false` once woken.
    fn wait_readable(&self, fd: RawFd) -> io::Result<bool> {
        let mut fds = [
            libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: self.read.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        loop {
            // SAFETY: `fds` is a valid array of two pollfd for the whole call.
            let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if fds[1].revents != 0 {
                return Ok(false);
            }
            if fds[0].revents != 0 {
                return Ok(true);
            }
        }
    }
}

/// One duplicated descriptor of the node. Closing drops this handle's
/// reference.
struct NodeHandle {
    file: Mutex<Option<Arc<File>>>,
}

impl NodeHandle {
    fn new(file: File) -> Self {
        Self {
            file: Mutex::new(Some(Arc::new(file))),
        }
    }

    fn current(&self) -> io::Result<Arc<File>> {
        self.file
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(closed_error)
    }

    fn take(&self) -> Option<Arc<File>> {
        self.file.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

impl Closeable for NodeHandle {
    fn close(&self) -> io::Result<()> {
        self.take();
        Ok(())
    }
}

/// Input descriptor of the node. A parked read holds its own reference to
/// the file and drops it as soon as `close` wakes it.
struct NodeInput {
    handle: NodeHandle,
    wake: WakePipe,
    notifier: NotifierSlot,
}

impl NodeInput {
    fn new(file: File, notifier: NotifierSlot) -> io::Result<Self> {
        Ok(Self {
            handle: NodeHandle::new(file),
            wake: WakePipe::new()?,
            notifier,
        })
    }

    fn notify_if_detached(&self, err: &io::Error) {
        if !is_detach_error(err) {
            return;
        }
        let notifier = self
            .notifier
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match notifier {
            Some(notifier) => {
                info!(error = %err, "Accessory gone, reporting detach");
                notifier.detached();
            }
            None => debug!(error = %err, "Accessory gone with no notifier registered"),
        }
    }
}

impl Closeable for NodeInput {
    fn close(&self) -> io::Result<()> {
        self.handle.take();
        self.wake.wake()
    }
}

impl InputStream for NodeInput {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let file = self.handle.current()?;
        if !self.wake.wait_readable(file.as_raw_fd())? {
            return Err(closed_error());
        }
        let result = (&*file).read(buf);
        // The detach path releases the streams, so this reference goes first.
        drop(file);
        if let Err(e) = &result {
            self.notify_if_detached(e);
        }
        result
    }
}

impl OutputStream for NodeHandle {
    fn write(&self, data: &[u8]) -> io::Result<usize> {
        let file = self.current()?;
        (&*file).write(data)
    }

    fn flush(&self) -> io::Result<()> {
        let file = self.current()?;
        (&*file).flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::traits::NotificationTarget;
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;
    use std::sync::Weak;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        results: Mutex<Vec<bool>>,
        detaches: AtomicUsize,
    }

    impl NotificationTarget for Recorder {
        fn permission_result(&self, granted: bool) {
            self.results.lock().unwrap().push(granted);
        }

        fn detached(&self) {
            self.detaches.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn register(platform: &DeviceNodePlatform, recorder: &Arc<Recorder>) -> Arc<dyn NotificationTarget> {
        let target: Arc<dyn NotificationTarget> = recorder.clone();
        let weak: Weak<dyn NotificationTarget> = Arc::downgrade(&target);
        platform.register(PlatformNotifier::new(weak));
        target
    }

    fn make_fifo(dir: &Path) -> PathBuf {
        let path = dir.join("usb_accessory");
        let c_path = CString::new(path.as_os_str().as_bytes()).unwrap();
        assert_eq!(unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) }, 0);
        path
    }

    /// Descriptors of this process that refer to `path`.
    fn open_fds_on(path: &Path) -> usize {
        std::fs::read_dir("/proc/self/fd")
            .unwrap()
            .filter_map(|entry| std::fs::read_link(entry.ok()?.path()).ok())
            .filter(|target| target == path)
            .count()
    }

    fn platform_for(path: &Path) -> DeviceNodePlatform {
        DeviceNodePlatform::new(&DeviceNodeConfig {
            path: path.to_path_buf(),
        })
    }

    fn widget() -> AccessoryDescriptor {
        AccessoryDescriptor::new("Acme", "Widget", "1.0")
    }

    #[test]
    fn test_ioctl_request_codes() {
        assert_eq!(ACCESSORY_GET_STRING_MANUFACTURER, 0x4100_4D01);
        assert_eq!(ACCESSORY_GET_STRING_SERIAL, 0x4100_4D06);
    }

    #[test]
    fn test_missing_node_is_not_connected() {
        let dir = tempfile::tempdir().unwrap();
        let platform = platform_for(&dir.path().join("usb_accessory"));
        assert!(platform.discover().unwrap().is_none());
        assert!(!platform.has_permission(&widget()));
    }

    #[test]
    fn test_regular_file_is_not_an_accessory() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let platform = platform_for(file.path());
        assert!(matches!(
            platform.discover(),
            Err(PlatformError::DiscoveryFailed(_))
        ));
    }

    #[test]
    fn test_open_reads_and_writes_node() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello").unwrap();
        let platform = platform_for(file.path());

        let streams = platform.open(&widget()).unwrap();
        let mut buf = [0u8; 16];
        let n = streams.input.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");

        streams.output.write_all(b" world").unwrap();
        streams.output.flush().unwrap();

        let input = Arc::clone(&streams.input);
        streams.release();
        assert_eq!(
            input.read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::NotConnected
        );
        // Second close is harmless.
        input.close().unwrap();

        assert_eq!(std::fs::read(file.path()).unwrap(), b"hello world");
    }

    #[test]
    fn test_permission_request_resolves_immediately() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let platform = platform_for(file.path());
        assert!(platform.request_permission(&widget()).is_err());

        let recorder = Arc::new(Recorder::default());
        let _target = register(&platform, &recorder);

        platform.request_permission(&widget()).unwrap();
        assert_eq!(*recorder.results.lock().unwrap(), vec![true]);

        platform.unregister();
        assert!(platform.request_permission(&widget()).is_err());
    }

    #[test]
    fn test_release_wakes_parked_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = make_fifo(&dir.path().canonicalize().unwrap());
        let platform = platform_for(&path);

        let streams = platform.open(&widget()).unwrap();
        assert_eq!(open_fds_on(&path), 3);

        // The FIFO loops writes back to the input.
        streams.output.write_all(b"ping").unwrap();
        let mut buf = [0u8; 16];
        let n = streams.input.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");

        let input = Arc::clone(&streams.input);
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let mut buf = [0u8; 16];
            let _ = tx.send(input.read(&mut buf).map_err(|e| e.kind()));
        });
        std::thread::sleep(Duration::from_millis(50));
        streams.release();

        let result = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("read still blocked after release");
        assert_eq!(result, Err(io::ErrorKind::NotConnected));
        assert_eq!(open_fds_on(&path), 0);
    }

    #[test]
    fn test_detach_errors_are_reported() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let platform = platform_for(file.path());
        let recorder = Arc::new(Recorder::default());
        let _target = register(&platform, &recorder);

        let input = NodeInput::new(
            File::open(file.path()).unwrap(),
            Arc::clone(&platform.notifier),
        )
        .unwrap();

        input.notify_if_detached(&io::Error::from_raw_os_error(libc::ENODEV));
        input.notify_if_detached(&io::Error::from_raw_os_error(libc::ESHUTDOWN));
        input.notify_if_detached(&io::Error::from_raw_os_error(libc::EPIPE));
        input.notify_if_detached(&io::Error::new(io::ErrorKind::Other, "other"));
        assert_eq!(recorder.detaches.load(Ordering::SeqCst), 2);

        platform.unregister();
        input.notify_if_detached(&io::Error::from_raw_os_error(libc::ENODEV));
        assert_eq!(recorder.detaches.load(Ordering::SeqCst), 2);
    }
}
