//! Single-threaded cooperative job queue.
//!
//! Jobs run one at a time in posting order. `clear` discards everything
//! posted before the call without touching jobs posted afterwards.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread;

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run { generation: u64, job: Job },
    Shutdown,
}

/// Cloneable handle for posting to a worker.
#[derive(Clone)]
pub struct WorkerHandle {
    sender: mpsc::Sender<Message>,
    generation: Arc<AtomicU64>,
}

impl WorkerHandle {
    /// Queue `job`. Returns false if the worker has shut down.
    pub fn post(&self, job: impl FnOnce() + Send + 'static) -> bool {
        let generation = self.generation.load(Ordering::SeqCst);
        self.sender
            .send(Message::Run {
                generation,
                job: Box::new(job),
            })
            .is_ok()
    }

    /// Drop every job posted so far that has not started yet.
    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

/// Owner of the worker thread. Dropping it stops the thread once the jobs
/// already queued have run.
pub struct Worker {
    handle: WorkerHandle,
    thread: Option<thread::JoinHandle<()>>,
}

impl Worker {
    pub fn spawn(name: &str) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::channel();
        let generation = Arc::new(AtomicU64::new(0));
        let current = Arc::clone(&generation);

        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Ok(message) = receiver.recv() {
                    match message {
                        Message::Run { generation, job } => {
                            if generation == current.load(Ordering::SeqCst) {
                                job();
                            }
                        }
                        Message::Shutdown => break,
                    }
                }
                tracing::trace!("Worker stopped");
            })?;

        Ok(Self {
            handle: WorkerHandle { sender, generation },
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let _ = self.handle.sender.send(Message::Shutdown);
        // A job may be parked in a blocking read that only unblocks later, so
        // the thread is detached rather than joined.
        self.thread.take();
    }
}
