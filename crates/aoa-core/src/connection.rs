//! Accessory connection - lifecycle orchestrator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, info, instrument, warn};

use crate::config::ConnectionConfig;
use crate::error::{ConnectionError, checked_range};
use crate::events::{EventSink, InboundEvent, TracingSink};
use crate::identity::{AccessoryDescriptor, AccessoryIdentity};
use crate::platform::traits::NotificationTarget;
use crate::platform::{AccessoryPlatform, PlatformError, PlatformNotifier};
use crate::state::ConnectionState;
use crate::state::handlers::{
    DetachAction, PermissionAction, StartAction, handle_detached, handle_discovery,
    handle_permission_result, handle_read_failure, handle_request_failed, handle_stop,
};
use crate::state::machine::{LinkContext, OpenSession, Phase};
use crate::worker::{Worker, WorkerHandle};

/// Connection to one USB accessory.
///
/// `start` and `stop` are meant to be driven by the host's foreground and
/// background transitions. Events reach the sink on a background worker
/// that also runs the read loop.
pub struct AccessoryConnection<P: AccessoryPlatform + 'static, S: EventSink + 'static> {
    shared: Arc<Shared<P, S>>,
    // Dropped after `shared` is torn down in `Drop`.
    _worker: Worker,
}

struct Shared<P: AccessoryPlatform + 'static, S: EventSink + 'static> {
    me: Weak<Shared<P, S>>,
    identity: AccessoryIdentity,
    buffer_size: usize,
    platform: Arc<P>,
    sink: Arc<S>,
    worker: WorkerHandle,
    ctx: Mutex<LinkContext>,
    /// Only touched by the read loop on the worker thread.
    buffer: Mutex<Box<[u8]>>,
    registered: AtomicBool,
}

impl<P: AccessoryPlatform + 'static> AccessoryConnection<P, TracingSink> {
    /// Create a connection that reports events with the default tracing sink.
    pub fn new(platform: Arc<P>, config: &ConnectionConfig) -> Result<Self, ConnectionError> {
        Self::with_sink(platform, Arc::new(TracingSink), config)
    }
}

impl<P: AccessoryPlatform + 'static, S: EventSink + 'static> AccessoryConnection<P, S> {
    /// Create a connection with a custom event sink.
    pub fn with_sink(
        platform: Arc<P>,
        sink: Arc<S>,
        config: &ConnectionConfig,
    ) -> Result<Self, ConnectionError> {
        config.validate()?;
        let worker = Worker::spawn("aoa-worker").map_err(PlatformError::from)?;
        let handle = worker.handle();
        let buffer = vec![0u8; config.buffer_size].into_boxed_slice();

        let shared = Arc::new_cyclic(|me| Shared {
            me: me.clone(),
            identity: config.identity.clone(),
            buffer_size: config.buffer_size,
            platform,
            sink,
            worker: handle,
            ctx: Mutex::new(LinkContext::new()),
            buffer: Mutex::new(buffer),
            registered: AtomicBool::new(false),
        });

        Ok(Self {
            shared,
            _worker: worker,
        })
    }

    /// Find the accessory and open it, asking for permission if needed.
    ///
    /// Outcomes other than opening are reported as events. Fails only on a
    /// closed connection or a platform failure.
    #[instrument(skip(self), fields(identity = %self.shared.identity))]
    pub fn start(&self) -> Result<(), ConnectionError> {
        self.shared.start()
    }

    /// Close the accessory and stop listening to the platform. Idempotent.
    #[instrument(skip(self))]
    pub fn stop(&self) {
        self.shared.shutdown();
    }

    /// Write all of `data` and flush. No-op unless open; I/O errors are logged.
    pub fn write(&self, data: &[u8]) -> Result<(), ConnectionError> {
        self.write_range(data, 0, data.len())
    }

    /// Write `data[offset..offset + count]` and flush.
    pub fn write_range(
        &self,
        data: &[u8],
        offset: usize,
        count: usize,
    ) -> Result<(), ConnectionError> {
        let bytes = checked_range(data, offset, count)?;
        let Some(output) = self.shared.lock().output() else {
            debug!(len = bytes.len(), "Write while not open ignored");
            return Ok(());
        };

        match output.write_all(bytes).and_then(|()| output.flush()) {
            Ok(()) => debug!(bytes_written = bytes.len(), "Write complete"),
            Err(e) => warn!(error = %e, len = bytes.len(), "Write failed"),
        }
        Ok(())
    }

    /// Single blocking write of `data[offset..offset + count]`, no flush.
    /// No-op unless open; I/O errors are logged.
    pub fn direct_write(
        &self,
        data: &[u8],
        offset: usize,
        count: usize,
    ) -> Result<(), ConnectionError> {
        let bytes = checked_range(data, offset, count)?;
        let Some(output) = self.shared.lock().output() else {
            debug!(len = bytes.len(), "Direct write while not open ignored");
            return Ok(());
        };

        match output.write(bytes) {
            Ok(n) => debug!(bytes_written = n, requested = bytes.len(), "Direct write complete"),
            Err(e) => warn!(error = %e, len = bytes.len(), "Direct write failed"),
        }
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state()
    }

    /// Whether the accessory streams are open and being read.
    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    /// Accessory currently pending or open.
    pub fn accessory(&self) -> Option<AccessoryDescriptor> {
        self.shared.lock().accessory().cloned()
    }

    pub fn identity(&self) -> &AccessoryIdentity {
        &self.shared.identity
    }

    pub fn buffer_size(&self) -> usize {
        self.shared.buffer_size
    }

    /// Handle for delivering platform notifications by hand, for hosts whose
    /// notifications do not come through `AccessoryPlatform::register`.
    pub fn notifier(&self) -> PlatformNotifier {
        self.shared.notifier()
    }
}

impl<P: AccessoryPlatform + 'static, S: EventSink + 'static> Drop for AccessoryConnection<P, S> {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

impl<P: AccessoryPlatform + 'static, S: EventSink + 'static> Shared<P, S> {
    fn lock(&self) -> MutexGuard<'_, LinkContext> {
        self.ctx.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notifier(&self) -> PlatformNotifier {
        let target: Weak<dyn NotificationTarget> = self.me.clone();
        PlatformNotifier::new(target)
    }

    /// Queue an event for the sink on the worker thread.
    fn dispatch(&self, event: InboundEvent) {
        debug!(code = event.code(), event = %event, "Dispatching event");
        let sink = Arc::clone(&self.sink);
        if !self.worker.post(move || sink.accept(event)) {
            warn!("Worker stopped, event dropped");
        }
    }

    fn start(&self) -> Result<(), ConnectionError> {
        if self.lock().state().is_terminal() {
            return Err(ConnectionError::Closed);
        }
        if !self.registered.swap(true, Ordering::SeqCst) {
            self.platform.register(self.notifier());
        }

        let request = {
            let mut ctx = self.lock();
            match ctx.state() {
                ConnectionState::Closed => return Err(ConnectionError::Closed),
                ConnectionState::Open => {
                    debug!("Already open");
                    return Ok(());
                }
                ConnectionState::Idle | ConnectionState::PermissionPending => {}
            }

            let found = self.platform.discover()?;
            let action = handle_discovery(&mut ctx, &self.identity, found, |accessory| {
                self.platform.has_permission(accessory)
            });
            match action {
                StartAction::Emit(event) => {
                    self.dispatch(event);
                    None
                }
                StartAction::Open(accessory) => {
                    self.open(&mut ctx, accessory);
                    None
                }
                StartAction::RequestPermission(accessory) => Some(accessory),
                StartAction::AwaitPermission => None,
            }
        };

        // The platform may answer from inside this call, so the lock is released.
        if let Some(accessory) = request {
            info!(accessory = %accessory, "Requesting accessory permission");
            if let Err(e) = self.platform.request_permission(&accessory) {
                handle_request_failed(&mut self.lock());
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Open the accessory and start reading. On failure the connection goes
    /// back to `Idle` and reports `IoFailure`.
    fn open(&self, ctx: &mut LinkContext, accessory: AccessoryDescriptor) {
        match self.platform.open(&accessory) {
            Ok(streams) => {
                info!(accessory = %accessory, "Accessory opened");
                let epoch = ctx.enter_open(accessory, streams);
                self.schedule_read(epoch);
            }
            Err(e) => {
                warn!(error = %e, "Failed to open accessory");
                ctx.goto(Phase::Idle);
                self.dispatch(InboundEvent::IoFailure(e.to_string()));
            }
        }
    }

    fn schedule_read(&self, epoch: u64) {
        let Some(shared) = self.me.upgrade() else {
            return;
        };
        self.worker.post(move || shared.read_once(epoch));
    }

    /// One read loop iteration. Re-posts itself while the session is open.
    fn read_once(&self, epoch: u64) {
        let Some(input) = self.lock().input_for(epoch) else {
            return;
        };

        let outcome = {
            let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
            match input.read(&mut buffer) {
                Ok(n) => Ok(buffer[..n].to_vec()),
                Err(e) => Err(e.to_string()),
            }
        };

        let mut ctx = self.lock();
        match outcome {
            Ok(data) => {
                if ctx.is_open_epoch(epoch) {
                    if data.is_empty() {
                        // Zero-length packet from the host.
                        debug!("Empty read");
                    } else {
                        debug!(bytes_read = data.len(), "Read complete");
                        self.dispatch(InboundEvent::RawData(data));
                    }
                    self.schedule_read(epoch);
                }
            }
            Err(reason) => {
                let Some(session) = handle_read_failure(&mut ctx, epoch) else {
                    debug!(reason = %reason, "Read ended after close");
                    return;
                };
                drop(ctx);
                warn!(reason = %reason, "Read failed, closing accessory");
                session.streams.release();
                self.dispatch(InboundEvent::IoFailure(reason));
            }
        }
    }

    /// Release a session after cancelling whatever it still has queued.
    fn close_session(&self, session: Option<OpenSession>) {
        self.worker.clear();
        if let Some(session) = session {
            session.streams.release();
            info!(accessory = %session.accessory, "Accessory closed");
        }
    }

    fn shutdown(&self) {
        if self.registered.swap(false, Ordering::SeqCst) {
            self.platform.unregister();
        }
        let mut ctx = self.lock();
        if ctx.state().is_terminal() {
            return;
        }
        let session = handle_stop(&mut ctx);
        self.close_session(session);
    }
}

impl<P: AccessoryPlatform + 'static, S: EventSink + 'static> NotificationTarget for Shared<P, S> {
    fn permission_result(&self, granted: bool) {
        let mut ctx = self.lock();
        match handle_permission_result(&mut ctx, granted) {
            PermissionAction::Ignore => {}
            PermissionAction::Open(accessory) => self.open(&mut ctx, accessory),
            PermissionAction::Emit(event) => {
                info!("Accessory permission denied");
                self.dispatch(event);
            }
        }
    }

    fn detached(&self) {
        let mut ctx = self.lock();
        match handle_detached(&mut ctx) {
            DetachAction::Ignore => {}
            DetachAction::Close(session) => {
                self.close_session(session);
                self.dispatch(InboundEvent::Detached);
            }
        }
    }
}
