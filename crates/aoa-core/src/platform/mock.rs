//! Mock accessory platform for testing.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use super::traits::{
    AccessoryPlatform, AccessoryStreams, Closeable, InputStream, OutputStream, PlatformError,
    PlatformNotifier,
};
use crate::identity::AccessoryDescriptor;

/// How many times each handle of the opened accessory was closed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CloseCounts {
    pub file: usize,
    pub input: usize,
    pub output: usize,
}

/// Scripted result of one read.
enum MockRead {
    Data(Vec<u8>),
    Error(io::ErrorKind),
    /// The accessory disappears while the read is in flight.
    Unplug,
}

#[derive(Default)]
struct ReadQueue {
    reads: VecDeque<MockRead>,
    input_closed: bool,
    read_calls: usize,
}

/// State shared by the mock streams and the platform that created them.
#[derive(Default)]
struct MockStream {
    queue: Mutex<ReadQueue>,
    ready: Condvar,
    writes: Mutex<Vec<Vec<u8>>>,
    write_error: Mutex<Option<io::ErrorKind>>,
    flushes: AtomicUsize,
    closes: Mutex<CloseCounts>,
    notifier: Mutex<Option<PlatformNotifier>>,
}

impl MockStream {
    fn notifier(&self) -> Option<PlatformNotifier> {
        self.notifier.lock().unwrap().clone()
    }
}

/// Mock platform for unit testing the connection lifecycle.
///
/// Reads block until a result is queued or the input is closed, so a read
/// loop over an empty script parks instead of spinning.
pub struct MockPlatform {
    accessory: Mutex<Option<AccessoryDescriptor>>,
    permitted: AtomicBool,
    fail_open: AtomicBool,
    permission_requests: AtomicUsize,
    opens: AtomicUsize,
    stream: Arc<MockStream>,
}

impl MockPlatform {
    /// No accessory attached, no permission.
    pub fn new() -> Self {
        Self {
            accessory: Mutex::new(None),
            permitted: AtomicBool::new(false),
            fail_open: AtomicBool::new(false),
            permission_requests: AtomicUsize::new(0),
            opens: AtomicUsize::new(0),
            stream: Arc::new(MockStream::default()),
        }
    }

    pub fn with_accessory(self, accessory: AccessoryDescriptor) -> Self {
        self.set_accessory(Some(accessory));
        self
    }

    pub fn with_permission(self, permitted: bool) -> Self {
        self.set_permission(permitted);
        self
    }

    pub fn set_accessory(&self, accessory: Option<AccessoryDescriptor>) {
        *self.accessory.lock().unwrap() = accessory;
    }

    pub fn set_permission(&self, permitted: bool) {
        self.permitted.store(permitted, Ordering::SeqCst);
    }

    /// Make the next `open` calls fail.
    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Resolve a pending permission prompt.
    pub fn resolve_permission(&self, granted: bool) {
        if granted {
            self.set_permission(true);
        }
        if let Some(notifier) = self.stream.notifier() {
            notifier.permission_result(granted);
        }
    }

    /// Simulate unplugging the accessory.
    pub fn detach(&self) {
        self.set_accessory(None);
        if let Some(notifier) = self.stream.notifier() {
            notifier.detached();
        }
    }

    /// Queue bytes to be returned by the next read.
    pub fn queue_read(&self, data: &[u8]) {
        self.push_read(MockRead::Data(data.to_vec()));
    }

    /// Queue an error to be returned by the next read.
    pub fn queue_read_error(&self, kind: io::ErrorKind) {
        self.push_read(MockRead::Error(kind));
    }

    /// Queue a zero-length read.
    pub fn queue_empty_read(&self) {
        self.push_read(MockRead::Data(Vec::new()));
    }

    /// Queue a read that reports a detach and then fails, the way a gadget
    /// node behaves when the host goes away mid-read.
    pub fn queue_unplug(&self) {
        self.push_read(MockRead::Unplug);
    }

    fn push_read(&self, read: MockRead) {
        self.stream.queue.lock().unwrap().reads.push_back(read);
        self.stream.ready.notify_all();
    }

    /// Make every write fail with `kind`.
    pub fn fail_writes(&self, kind: io::ErrorKind) {
        *self.stream.write_error.lock().unwrap() = Some(kind);
    }

    pub fn permission_requests(&self) -> usize {
        self.permission_requests.load(Ordering::SeqCst)
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn is_registered(&self) -> bool {
        self.stream.notifier.lock().unwrap().is_some()
    }

    /// Number of reads performed so far.
    pub fn read_calls(&self) -> usize {
        self.stream.queue.lock().unwrap().read_calls
    }

    /// Get all captured writes.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.stream.writes.lock().unwrap().clone()
    }

    pub fn flush_count(&self) -> usize {
        self.stream.flushes.load(Ordering::SeqCst)
    }

    pub fn close_counts(&self) -> CloseCounts {
        *self.stream.closes.lock().unwrap()
    }
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl AccessoryPlatform for MockPlatform {
    fn register(&self, notifier: PlatformNotifier) {
        *self.stream.notifier.lock().unwrap() = Some(notifier);
    }

    fn unregister(&self) {
        self.stream.notifier.lock().unwrap().take();
    }

    fn discover(&self) -> Result<Option<AccessoryDescriptor>, PlatformError> {
        Ok(self.accessory.lock().unwrap().clone())
    }

    fn has_permission(&self, _accessory: &AccessoryDescriptor) -> bool {
        self.permitted.load(Ordering::SeqCst)
    }

    fn request_permission(&self, _accessory: &AccessoryDescriptor) -> Result<(), PlatformError> {
        self.permission_requests.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn open(&self, _accessory: &AccessoryDescriptor) -> Result<AccessoryStreams, PlatformError> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(PlatformError::OpenFailed("mock open failure".into()));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.stream.queue.lock().unwrap().input_closed = false;

        Ok(AccessoryStreams {
            file: Box::new(MockFile(Arc::clone(&self.stream))),
            input: Arc::new(MockInput(Arc::clone(&self.stream))),
            output: Arc::new(MockOutput(Arc::clone(&self.stream))),
        })
    }
}

struct MockFile(Arc<MockStream>);

impl Closeable for MockFile {
    fn close(&self) -> io::Result<()> {
        self.0.closes.lock().unwrap().file += 1;
        Ok(())
    }
}

struct MockInput(Arc<MockStream>);

impl Closeable for MockInput {
    fn close(&self) -> io::Result<()> {
        self.0.closes.lock().unwrap().input += 1;
        self.0.queue.lock().unwrap().input_closed = true;
        self.0.ready.notify_all();
        Ok(())
    }
}

impl InputStream for MockInput {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut queue = self.0.queue.lock().unwrap();
        queue.read_calls += 1;
        loop {
            if queue.input_closed {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "input closed"));
            }
            match queue.reads.pop_front() {
                Some(MockRead::Data(data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    return Ok(n);
                }
                Some(MockRead::Error(kind)) => {
                    return Err(io::Error::new(kind, "mock read failure"));
                }
                Some(MockRead::Unplug) => {
                    // Closing the input takes the queue lock.
                    drop(queue);
                    if let Some(notifier) = self.0.notifier() {
                        notifier.detached();
                    }
                    return Err(io::Error::new(io::ErrorKind::NotConnected, "accessory gone"));
                }
                None => queue = self.0.ready.wait(queue).unwrap(),
            }
        }
    }
}

struct MockOutput(Arc<MockStream>);

impl Closeable for MockOutput {
    fn close(&self) -> io::Result<()> {
        self.0.closes.lock().unwrap().output += 1;
        Ok(())
    }
}

impl OutputStream for MockOutput {
    fn write(&self, data: &[u8]) -> io::Result<usize> {
        if let Some(kind) = *self.0.write_error.lock().unwrap() {
            return Err(io::Error::new(kind, "mock write failure"));
        }
        self.0.writes.lock().unwrap().push(data.to_vec());
        Ok(data.len())
    }

    fn flush(&self) -> io::Result<()> {
        self.0.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn widget() -> AccessoryDescriptor {
        AccessoryDescriptor::new("Acme", "Widget", "1.0")
    }

    #[test]
    fn test_mock_read_script() {
        let mock = MockPlatform::new().with_accessory(widget());
        let streams = mock.open(&widget()).unwrap();
        mock.queue_read(b"Hello");
        mock.queue_read_error(io::ErrorKind::TimedOut);

        let mut buf = [0u8; 16];
        assert_eq!(streams.input.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"Hello");
        assert_eq!(
            streams.input.read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::TimedOut
        );
        assert_eq!(mock.read_calls(), 2);
    }

    #[test]
    fn test_mock_close_wakes_blocked_read() {
        let mock = MockPlatform::new();
        let streams = mock.open(&widget()).unwrap();
        let input = Arc::clone(&streams.input);

        let reader = std::thread::spawn(move || {
            let mut buf = [0u8; 4];
            input.read(&mut buf)
        });
        streams.release();

        let result = reader.join().unwrap();
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(
            mock.close_counts(),
            CloseCounts {
                file: 1,
                input: 1,
                output: 1
            }
        );
    }

    #[test]
    fn test_mock_write_capture() {
        let mock = MockPlatform::new();
        let streams = mock.open(&widget()).unwrap();
        streams.output.write_all(b"Hello").unwrap();
        streams.output.write(b"World").unwrap();

        let writes = mock.writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0], b"Hello");
        assert_eq!(writes[1], b"World");

        mock.fail_writes(io::ErrorKind::BrokenPipe);
        assert!(streams.output.write(b"test").is_err());
    }

    #[test]
    fn test_mock_open_failure() {
        let mock = MockPlatform::new();
        mock.set_fail_open(true);
        assert!(matches!(
            mock.open(&widget()),
            Err(PlatformError::OpenFailed(_))
        ));
        assert_eq!(mock.open_count(), 0);
    }
}
