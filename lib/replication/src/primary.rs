use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use itertools::Itertools;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tonic::Code;

use crate::client::{ReplicationClient, TransferStatusStream};
use crate::config::ReplicationConfig;
use crate::error::ReplicationResult;
use crate::index::{IndexWriterHandle, NrtSearcher};
use crate::metrics::ReplicationMetrics;
use crate::precopy::MergePreCopy;
use crate::registry::{ReplicaHandle, ReplicaRegistry};
use crate::types::{CopyState, FilesMetadata, HostPort, PrimaryGen, ReplicaId};
use crate::upload::DurableUploadQueue;

/// Poll interval of the pre-copy drain loop.
const PRECOPY_POLL_INTERVAL: Duration = Duration::from_millis(10);
/// How often the drain loop warns about still-warming replicas.
const PRECOPY_WARN_INTERVAL: Duration = Duration::from_secs(1);

/// Replication coordinator of one NRT primary.
///
/// Owns the writer handle and the replica registry, hosts the merge pre-copy
/// lifecycle and the NRT point broadcast. Refreshes are driven externally
/// through [`PrimaryRefreshManager`](crate::refresh::PrimaryRefreshManager);
/// merge completions call into
/// [`pre_copy_merged_segment_files`](Self::pre_copy_merged_segment_files)
/// from the writer's merge threads.
pub struct PrimaryNode {
    index_name: String,
    index_id: String,
    primary_gen: PrimaryGen,
    host_port: HostPort,
    writer: Arc<dyn IndexWriterHandle>,
    replicas: ReplicaRegistry,
    /// In-flight merge pre-copies. The mutex is the monitor for structural
    /// changes and for the create-and-publish / admit-to-all composites; it
    /// is never held across the drain loop.
    warming_segments: Mutex<Vec<Arc<MergePreCopy>>>,
    upload_queue: Arc<dyn DurableUploadQueue>,
    config: Arc<RwLock<ReplicationConfig>>,
    metrics: Arc<ReplicationMetrics>,
    closed: AtomicBool,
}

impl PrimaryNode {
    pub fn new(
        index_name: impl Into<String>,
        index_id: impl Into<String>,
        primary_gen: PrimaryGen,
        host_port: HostPort,
        writer: Arc<dyn IndexWriterHandle>,
        upload_queue: Arc<dyn DurableUploadQueue>,
        config: Arc<RwLock<ReplicationConfig>>,
    ) -> Self {
        Self {
            index_name: index_name.into(),
            index_id: index_id.into(),
            primary_gen,
            host_port,
            writer,
            replicas: ReplicaRegistry::default(),
            warming_segments: Mutex::new(Vec::new()),
            upload_queue,
            config,
            metrics: Arc::new(ReplicationMetrics::default()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    pub fn primary_gen(&self) -> PrimaryGen {
        self.primary_gen
    }

    pub fn metrics(&self) -> &Arc<ReplicationMetrics> {
        &self.metrics
    }

    pub fn upload_queue(&self) -> &Arc<dyn DurableUploadQueue> {
        &self.upload_queue
    }

    /// Currently registered replicas.
    pub fn nodes_info(&self) -> Vec<ReplicaHandle> {
        self.replicas.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn flush_and_refresh(&self) -> ReplicationResult<bool> {
        self.writer.flush_and_refresh()
    }

    pub fn copy_state(&self) -> ReplicationResult<CopyState> {
        self.writer.copy_state()
    }

    pub fn acquire_searcher(&self) -> ReplicationResult<Arc<dyn NrtSearcher>> {
        self.writer.acquire_searcher()
    }

    pub fn set_ram_buffer_size_mb(&self, mb: f64) {
        self.writer.set_ram_buffer_size_mb(mb)
    }

    pub async fn warming_segment_count(&self) -> usize {
        self.warming_segments.lock().await.len()
    }

    fn max_merge_precopy_duration(&self) -> Option<Duration> {
        self.config.read().max_merge_precopy_duration()
    }

    /// Registers a replica (idempotent by `(replica_id, host_port)`) and
    /// opportunistically admits it into every in-flight merge pre-copy.
    pub async fn add_replica(&self, replica_id: ReplicaId, client: Arc<dyn ReplicationClient>) {
        let handle = ReplicaHandle::new(replica_id, client);
        self.replicas.add(handle.clone());

        let warming = self.warming_segments.lock().await;
        log::info!(
            "Add replica {handle}, {} segments currently warming",
            warming.len(),
        );
        for pre_copy in warming.iter() {
            if pre_copy.contains(&handle) {
                // The replica may have joined this merge before its
                // registration reached us.
                log::info!("Replica {handle} is already warming this segment");
                continue;
            }
            if pre_copy
                .try_add_connection(&handle, &self.index_name, &self.index_id, self.primary_gen)
                .await
            {
                log::info!("Start precopying merged segment files to new replica {handle}");
            } else {
                // Too late, the other replicas just finished this segment.
                // It reaches the replica with the next NRT point instead.
                log::info!("Merge precopy already completed, unable to add new replica {handle}");
            }
        }
    }

    /// Broadcasts the latest flushed version to every registered replica.
    ///
    /// Replicas answering `Unavailable` or `FailedPrecondition` are lost to
    /// this primary: their channel is closed and the registry entry dropped.
    /// Any other failure is transient, the replica stays registered and the
    /// next point retries implicitly.
    pub async fn send_new_nrt_point_to_replicas(&self) {
        let version = self.writer.copy_state_version();
        let replicas = self.replicas.snapshot();
        log::info!(
            "Send flushed version {version} of index {} to {} replicas",
            self.index_name,
            replicas.len(),
        );
        self.metrics.on_nrt_point_sent(version);

        for handle in replicas {
            match handle
                .client
                .new_nrt_point(&self.index_name, &self.index_id, self.primary_gen, version)
                .await
            {
                Ok(()) => {}
                Err(status)
                    if matches!(status.code(), Code::Unavailable | Code::FailedPrecondition) =>
                {
                    log::warn!(
                        "Replica {handle} cannot process NRT point ({status}), closing connection",
                    );
                    handle.client.close();
                    self.replicas.remove(&handle);
                }
                Err(status) => {
                    log::warn!("Failed to send NRT point to replica {handle}, skipping: {status}");
                }
            }
        }
    }

    /// Warms a newly merged segment: starts a file transfer to every current
    /// replica and returns once all of them finished ingesting, the deadline
    /// passed, or the primary is closing. Invoked by the writer after each
    /// merge, concurrently for concurrent merges. Replicas registering while
    /// the transfer runs are admitted through
    /// [`add_replica`](Self::add_replica).
    pub async fn pre_copy_merged_segment_files(&self, segment: &str, files: FilesMetadata) {
        let start = Instant::now();
        if self.replicas.is_empty() {
            log::info!(
                "No replicas, skip warming segment {segment} of index {}",
                self.index_name,
            );
            return;
        }
        self.metrics.on_merge_precopy_start();

        let deadline = self
            .max_merge_precopy_duration()
            .map(|limit| Instant::now() + limit);
        let pre_copy = {
            let mut warming = self.warming_segments.lock().await;
            log::info!(
                "Start merge precopy of segment {segment} to {} replicas, local address {}, files: [{}]",
                self.replicas.len(),
                self.host_port,
                files.keys().join(", "),
            );
            let transfers = self.start_merge_transfers(&files, deadline).await;
            let pre_copy = Arc::new(MergePreCopy::new(files, transfers, deadline));
            warming.push(pre_copy.clone());
            pre_copy
        };

        let mut abandoned = false;
        let mut last_warn = start;
        while !pre_copy.try_finish() {
            sleep(PRECOPY_POLL_INTERVAL).await;

            if self.is_closed() {
                // Connections are torn down by the close path.
                log::info!("Primary is closing, cancel merge precopy of segment {segment}");
                abandoned = true;
                break;
            }

            if last_warn.elapsed() >= PRECOPY_WARN_INTERVAL {
                log::warn!(
                    "Still warming segment {segment} on {} replicas after {:.1}s",
                    pre_copy.connection_count(),
                    start.elapsed().as_secs_f64(),
                );
                last_warn = Instant::now();
            }

            for (handle, stream) in pre_copy.take_pending_transfers() {
                self.drain_transfer(&pre_copy, segment, &handle, stream).await;
            }
        }

        if !abandoned {
            log::info!("Done merge precopy of segment {segment}");
        }

        self.warming_segments
            .lock()
            .await
            .retain(|warming| !Arc::ptr_eq(warming, &pre_copy));
        self.metrics.on_merge_precopy_end(start.elapsed(), !abandoned);
    }

    /// Initial fan-out of a merge pre-copy. A replica whose call fails is
    /// left out of this pre-copy and gets the files with the next NRT point.
    async fn start_merge_transfers(
        &self,
        files: &FilesMetadata,
        deadline: Option<Instant>,
    ) -> Vec<(ReplicaHandle, TransferStatusStream)> {
        let mut transfers = Vec::new();
        for handle in self.replicas.snapshot() {
            match handle
                .client
                .copy_files(
                    &self.index_name,
                    &self.index_id,
                    self.primary_gen,
                    files.clone(),
                    deadline,
                )
                .await
            {
                Ok(stream) => {
                    log::info!("Start precopying merged segment files to replica {handle}");
                    transfers.push((handle, stream));
                }
                Err(status) => {
                    log::warn!("Ignore merge precopy failure for replica {handle}: {status}");
                }
            }
        }
        transfers
    }

    /// Consumes one replica's transfer stream to the end, then drops the
    /// replica from the active set. A failing stream only affects its own
    /// replica.
    async fn drain_transfer(
        &self,
        pre_copy: &MergePreCopy,
        segment: &str,
        handle: &ReplicaHandle,
        mut stream: TransferStatusStream,
    ) {
        while let Some(item) = stream.next().await {
            match item {
                Ok(status) => log::debug!(
                    "Transfer status from replica {handle} for segment {segment}: {:?}: {}",
                    status.code,
                    status.message,
                ),
                Err(status) => {
                    log::warn!(
                        "Ignore transfer failure during merge precopy of segment {segment} to replica {handle}: {status}",
                    );
                    break;
                }
            }
        }
        pre_copy.remove_connection(handle);
    }

    /// Terminal shutdown: drops every replica, closes the upload queue and
    /// the writer. In-flight pre-copies notice through
    /// [`is_closed`](Self::is_closed) and abandon; queue and writer close
    /// errors propagate to the caller.
    pub async fn close(&self) -> ReplicationResult<()> {
        log::info!("Close NRT primary of index {}", self.index_name);
        self.closed.store(true, Ordering::SeqCst);
        for handle in self.replicas.drain() {
            log::info!("Closing replica channel {handle}");
            handle.client.close();
        }
        self.upload_queue.close().await?;
        self.writer.close()
    }
}
