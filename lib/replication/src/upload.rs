use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::{ReplicationError, ReplicationResult};
use crate::types::CopyState;

/// One-shot completion cell resolved once a refresh's copy state is durable
/// in the remote store (or the cycle failed before reaching it).
///
/// Clones share the cell: the refresh driver keeps one in its watcher batch,
/// the caller keeps another to await. The first `set_done` wins.
#[derive(Clone)]
pub struct RefreshUploadFuture {
    inner: Arc<UploadFutureInner>,
}

struct UploadFutureInner {
    result: OnceLock<ReplicationResult<()>>,
    done: watch::Sender<bool>,
}

impl Default for UploadFutureInner {
    fn default() -> Self {
        Self {
            result: OnceLock::new(),
            done: watch::Sender::new(false),
        }
    }
}

impl RefreshUploadFuture {
    pub fn new() -> Self {
        Self {
            inner: Arc::default(),
        }
    }

    /// Completes the future. Returns false if it was already completed; the
    /// first outcome wins.
    pub fn set_done(&self, result: ReplicationResult<()>) -> bool {
        let set = self.inner.result.set(result).is_ok();
        if set {
            self.inner.done.send_replace(true);
        }
        set
    }

    pub fn is_done(&self) -> bool {
        self.inner.result.get().is_some()
    }

    /// Waits for the outcome.
    pub async fn wait(&self) -> ReplicationResult<()> {
        let mut done = self.inner.done.subscribe();
        while self.inner.result.get().is_none() {
            // The sender lives in the shared inner and cannot go away first.
            if done.changed().await.is_err() {
                break;
            }
        }
        match self.inner.result.get() {
            Some(result) => result.clone(),
            None => Err(ReplicationError::service_error(
                "refresh upload future was abandoned",
            )),
        }
    }
}

impl Default for RefreshUploadFuture {
    fn default() -> Self {
        Self::new()
    }
}

/// Sink for refresh outputs awaiting durable upload.
#[async_trait]
pub trait DurableUploadQueue: Send + Sync {
    /// Queues one copy state for upload. Non-blocking; the queue eventually
    /// completes every watcher exactly once with the upload outcome.
    fn enqueue_upload(
        &self,
        copy_state: CopyState,
        watchers: Vec<RefreshUploadFuture>,
    ) -> ReplicationResult<()>;

    /// Drains queued uploads and stops; later enqueues are rejected.
    async fn close(&self) -> ReplicationResult<()>;
}

/// Client of the remote backing store that holds durable copy states.
#[async_trait]
pub trait CopyStateUploader: Send + Sync {
    async fn upload(&self, copy_state: &CopyState) -> ReplicationResult<()>;
}

enum UploadSignal {
    Upload {
        copy_state: CopyState,
        watchers: Vec<RefreshUploadFuture>,
    },
    Stop,
}

/// [`DurableUploadQueue`] backed by a single background worker that uploads
/// copy states in enqueue order and completes the watchers of each.
pub struct StateUploadQueue {
    sender: mpsc::UnboundedSender<UploadSignal>,
    worker: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl StateUploadQueue {
    /// Spawns the upload worker on the current runtime.
    pub fn spawn(uploader: Arc<dyn CopyStateUploader>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = tokio::spawn(Self::upload_worker_fn(receiver, uploader));
        Self {
            sender,
            worker: Mutex::new(Some(worker)),
            closed: AtomicBool::new(false),
        }
    }

    async fn upload_worker_fn(
        mut receiver: mpsc::UnboundedReceiver<UploadSignal>,
        uploader: Arc<dyn CopyStateUploader>,
    ) {
        while let Some(signal) = receiver.recv().await {
            match signal {
                UploadSignal::Upload {
                    copy_state,
                    watchers,
                } => {
                    let result = uploader.upload(&copy_state).await;
                    if let Err(err) = &result {
                        log::error!(
                            "Failed to upload copy state at version {}: {err}",
                            copy_state.version,
                        );
                    }
                    for watcher in watchers {
                        watcher.set_done(result.clone());
                    }
                }
                // Keep draining whatever was enqueued before the stop; the
                // channel then runs out and the loop ends.
                UploadSignal::Stop => receiver.close(),
            }
        }
    }
}

#[async_trait]
impl DurableUploadQueue for StateUploadQueue {
    fn enqueue_upload(
        &self,
        copy_state: CopyState,
        watchers: Vec<RefreshUploadFuture>,
    ) -> ReplicationResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ReplicationError::cancelled("upload queue is closed"));
        }
        let signal = UploadSignal::Upload {
            copy_state,
            watchers,
        };
        if let Err(mpsc::error::SendError(signal)) = self.sender.send(signal) {
            let err = ReplicationError::service_error("upload worker is not running");
            if let UploadSignal::Upload { watchers, .. } = signal {
                for watcher in watchers {
                    watcher.set_done(Err(err.clone()));
                }
            }
            return Err(err);
        }
        Ok(())
    }

    async fn close(&self) -> ReplicationResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // The worker may already be gone if the runtime is shutting down.
        let _ = self.sender.send(UploadSignal::Stop);
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.await.map_err(|err| {
                ReplicationError::service_error(format!(
                    "upload worker terminated abnormally: {err}"
                ))
            })?;
        }
        Ok(())
    }
}
