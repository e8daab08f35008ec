use std::mem;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::ReplicationResult;
use crate::index::NrtSearcher;
use crate::primary::PrimaryNode;
use crate::upload::RefreshUploadFuture;

/// Searcher reference manager of the primary.
///
/// Owns the current searcher reference and serializes refreshes. A refresh
/// flushes the writer and, when anything became visible, publishes the new
/// NRT point to all replicas before swapping in a searcher over the new
/// reader. Callers wanting durability of the next refresh register through
/// [`next_refresh_durable`](Self::next_refresh_durable).
pub struct PrimaryRefreshManager {
    primary: Arc<PrimaryNode>,
    current: Mutex<Arc<dyn NrtSearcher>>,
    refresh_lock: tokio::sync::Mutex<()>,
    next_refresh_watchers: Mutex<Vec<RefreshUploadFuture>>,
}

impl PrimaryRefreshManager {
    pub fn new(primary: Arc<PrimaryNode>) -> ReplicationResult<Self> {
        let current = primary.acquire_searcher()?;
        Ok(Self {
            primary,
            current: Mutex::new(current),
            refresh_lock: tokio::sync::Mutex::new(()),
            next_refresh_watchers: Mutex::new(Vec::new()),
        })
    }

    pub fn primary(&self) -> &Arc<PrimaryNode> {
        &self.primary
    }

    /// Takes a reference on the current searcher. Callers hand it back with
    /// [`release`](Self::release).
    pub fn acquire(&self) -> Arc<dyn NrtSearcher> {
        loop {
            let searcher = self.current.lock().clone();
            if searcher.try_inc_ref() {
                return searcher;
            }
            // Lost the race against a concurrent swap; the fresh reference is
            // installed before the old one is released, so retrying succeeds.
        }
    }

    pub fn release(&self, searcher: &Arc<dyn NrtSearcher>) {
        searcher.dec_ref();
    }

    /// Future completed once the next refresh is durable in the remote store.
    pub fn next_refresh_durable(&self) -> RefreshUploadFuture {
        let future = RefreshUploadFuture::new();
        self.next_refresh_watchers.lock().push(future.clone());
        future
    }

    /// Flushes and, when anything became visible, publishes the new NRT point
    /// and swaps in a searcher over the new reader. Returns whether a swap
    /// happened. Refreshes are serialized; concurrent callers queue up.
    pub async fn maybe_refresh(&self) -> ReplicationResult<bool> {
        let _refresh_guard = self.refresh_lock.lock().await;
        match self.refresh_if_needed().await? {
            Some(new_searcher) => {
                let old = mem::replace(&mut *self.current.lock(), new_searcher);
                old.dec_ref();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn refresh_if_needed(&self) -> ReplicationResult<Option<Arc<dyn NrtSearcher>>> {
        let watchers = mem::take(&mut *self.next_refresh_watchers.lock());

        let mut upload_queued = false;
        let result = self.refresh_and_publish(&watchers, &mut upload_queued).await;
        if let Err(err) = &result {
            // The cycle failed before reaching the queue, nothing else will
            // ever complete these watchers.
            if !upload_queued {
                for watcher in &watchers {
                    watcher.set_done(Err(err.clone()));
                }
            }
        }
        result
    }

    async fn refresh_and_publish(
        &self,
        watchers: &[RefreshUploadFuture],
        upload_queued: &mut bool,
    ) -> ReplicationResult<Option<Arc<dyn NrtSearcher>>> {
        if self.primary.flush_and_refresh()? {
            if !watchers.is_empty() {
                self.queue_index_upload(watchers)?;
                *upload_queued = true;
            }
            self.primary.send_new_nrt_point_to_replicas().await;
            Ok(Some(self.primary.acquire_searcher()?))
        } else {
            if !watchers.is_empty() {
                // Even if the flush was a noop the data still has to be made
                // durable for the waiting callers.
                self.queue_index_upload(watchers)?;
                *upload_queued = true;
            }
            Ok(None)
        }
    }

    fn queue_index_upload(&self, watchers: &[RefreshUploadFuture]) -> ReplicationResult<()> {
        let copy_state = self.primary.copy_state()?;
        self.primary
            .upload_queue()
            .enqueue_upload(copy_state, watchers.to_vec())
    }
}

/// Drives [`PrimaryRefreshManager::maybe_refresh`] on a fixed interval until
/// the stop channel fires or the primary closes.
pub fn spawn_refresh_task(
    manager: Arc<PrimaryRefreshManager>,
    interval: Duration,
) -> (JoinHandle<()>, oneshot::Sender<()>) {
    let (stop_sender, mut stop_receiver) = oneshot::channel();
    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = &mut stop_receiver => {
                    log::debug!("Stopping refresh task");
                    break;
                }
            }
            if manager.primary().is_closed() {
                break;
            }
            if let Err(err) = manager.maybe_refresh().await {
                log::error!("Periodic refresh failed: {err}");
            }
        }
    });
    (handle, stop_sender)
}
