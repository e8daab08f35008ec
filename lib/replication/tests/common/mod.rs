#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::time::Instant;
use tonic::{Code, Status};

use replication::client::{ReplicationClient, TransferStatusStream};
use replication::config::ReplicationConfig;
use replication::error::{ReplicationError, ReplicationResult};
use replication::index::{IndexWriterHandle, NrtSearcher};
use replication::primary::PrimaryNode;
use replication::refresh::PrimaryRefreshManager;
use replication::types::{
    CopyState, FileMetadata, FilesMetadata, HostPort, PrimaryGen, SearcherVersion, TransferCode,
    TransferStatus,
};
use replication::upload::{CopyStateUploader, StateUploadQueue};

pub const PRIMARY_GEN: PrimaryGen = 7;

pub fn segment_files(names: &[&str]) -> FilesMetadata {
    names
        .iter()
        .map(|name| {
            (
                name.to_string(),
                FileMetadata {
                    length: 1024,
                    checksum: 0xfeed,
                    header: vec![0, 1],
                    footer: vec![2, 3],
                },
            )
        })
        .collect()
}

pub fn done_status() -> TransferStatus {
    TransferStatus {
        code: TransferCode::Done,
        message: "done".to_string(),
    }
}

/// How a mock transfer stream behaves after its scripted statuses ran out.
#[derive(Clone)]
pub enum TransferTail {
    Complete,
    Never,
    Error(Code),
}

/// Scripted behavior of one `copy_files` stream: statuses with gaps before
/// each, then the tail.
#[derive(Clone)]
pub struct TransferPlan {
    pub statuses: Vec<(Duration, TransferStatus)>,
    pub tail: TransferTail,
}

impl TransferPlan {
    pub fn immediate() -> Self {
        Self {
            statuses: vec![(Duration::ZERO, done_status())],
            tail: TransferTail::Complete,
        }
    }

    pub fn staged(chunks: usize, gap: Duration) -> Self {
        let statuses = (1..=chunks)
            .map(|chunk| {
                let code = if chunk == chunks {
                    TransferCode::Done
                } else {
                    TransferCode::Ongoing
                };
                (
                    gap,
                    TransferStatus {
                        code,
                        message: format!("chunk {chunk}"),
                    },
                )
            })
            .collect();
        Self {
            statuses,
            tail: TransferTail::Complete,
        }
    }

    pub fn delayed_complete(delay: Duration) -> Self {
        Self {
            statuses: vec![(delay, done_status())],
            tail: TransferTail::Complete,
        }
    }

    pub fn never() -> Self {
        Self {
            statuses: Vec::new(),
            tail: TransferTail::Never,
        }
    }

    pub fn failing(code: Code) -> Self {
        Self {
            statuses: Vec::new(),
            tail: TransferTail::Error(code),
        }
    }
}

/// Materializes a plan as the stream a tonic call would yield: statuses on
/// schedule, truncated by the deadline with `DeadlineExceeded` like a real
/// call, endless streams terminated when the owning client closes.
pub fn build_transfer_stream(
    plan: TransferPlan,
    deadline: Option<Instant>,
    closed: watch::Receiver<bool>,
) -> TransferStatusStream {
    let mut events: Vec<(Instant, Result<TransferStatus, Status>)> = Vec::new();
    let mut at = Instant::now();
    let mut expired = false;
    for (gap, status) in plan.statuses {
        at += gap;
        if let Some(deadline) = deadline {
            if at > deadline {
                events.push((
                    deadline,
                    Err(Status::deadline_exceeded("transfer deadline exceeded")),
                ));
                expired = true;
                break;
            }
        }
        events.push((at, Ok(status)));
    }

    let mut endless = false;
    if !expired {
        match plan.tail {
            TransferTail::Complete => {}
            TransferTail::Error(code) => {
                events.push((at, Err(Status::new(code, "injected transfer failure"))));
            }
            TransferTail::Never => match deadline {
                Some(deadline) => events.push((
                    deadline,
                    Err(Status::deadline_exceeded("transfer deadline exceeded")),
                )),
                None => endless = true,
            },
        }
    }

    let timed = stream::iter(events).then(|(when, item)| async move {
        tokio::time::sleep_until(when).await;
        item
    });
    if endless {
        let mut closed = closed;
        let client_gone = async move {
            let _ = closed.wait_for(|closed| *closed).await;
        };
        timed
            .chain(stream::pending())
            .take_until(client_gone)
            .boxed()
    } else {
        timed.boxed()
    }
}

pub struct CopyFilesCall {
    pub files: FilesMetadata,
    pub deadline: Option<Instant>,
}

/// Mock replica client recording everything the coordinator does to it.
pub struct MockReplica {
    host_port: HostPort,
    plan: Mutex<TransferPlan>,
    closed: watch::Sender<bool>,
    pub nrt_points: Mutex<Vec<(PrimaryGen, SearcherVersion)>>,
    pub nrt_failure: Mutex<Option<Code>>,
    pub copy_files_calls: Mutex<Vec<CopyFilesCall>>,
    close_calls: AtomicUsize,
}

impl MockReplica {
    pub fn new(host: &str, port: u16) -> Arc<Self> {
        Self::with_plan(host, port, TransferPlan::immediate())
    }

    pub fn with_plan(host: &str, port: u16, plan: TransferPlan) -> Arc<Self> {
        Arc::new(Self {
            host_port: HostPort::new(host, port),
            plan: Mutex::new(plan),
            closed: watch::Sender::new(false),
            nrt_points: Mutex::new(Vec::new()),
            nrt_failure: Mutex::new(None),
            copy_files_calls: Mutex::new(Vec::new()),
            close_calls: AtomicUsize::new(0),
        })
    }

    pub fn observed_versions(&self) -> Vec<SearcherVersion> {
        self.nrt_points
            .lock()
            .iter()
            .map(|(_, version)| *version)
            .collect()
    }

    pub fn fail_nrt_points_with(&self, code: Code) {
        *self.nrt_failure.lock() = Some(code);
    }

    pub fn close_count(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReplicationClient for MockReplica {
    fn host_port(&self) -> HostPort {
        self.host_port.clone()
    }

    async fn new_nrt_point(
        &self,
        _index_name: &str,
        _index_id: &str,
        primary_gen: PrimaryGen,
        version: SearcherVersion,
    ) -> Result<(), Status> {
        if let Some(code) = *self.nrt_failure.lock() {
            return Err(Status::new(code, "injected nrt point failure"));
        }
        self.nrt_points.lock().push((primary_gen, version));
        Ok(())
    }

    async fn copy_files(
        &self,
        _index_name: &str,
        _index_id: &str,
        _primary_gen: PrimaryGen,
        files: FilesMetadata,
        deadline: Option<Instant>,
    ) -> Result<TransferStatusStream, Status> {
        self.copy_files_calls.lock().push(CopyFilesCall {
            files: files.clone(),
            deadline,
        });
        Ok(build_transfer_stream(
            self.plan.lock().clone(),
            deadline,
            self.closed.subscribe(),
        ))
    }

    fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.send_replace(true);
    }
}

pub struct MockSearcher {
    version: SearcherVersion,
    refs: AtomicUsize,
}

impl MockSearcher {
    pub fn new(version: SearcherVersion) -> Self {
        Self {
            version,
            refs: AtomicUsize::new(1),
        }
    }
}

impl NrtSearcher for MockSearcher {
    fn version(&self) -> SearcherVersion {
        self.version
    }

    fn try_inc_ref(&self) -> bool {
        self.refs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |refs| {
                (refs > 0).then_some(refs + 1)
            })
            .is_ok()
    }

    fn dec_ref(&self) {
        self.refs.fetch_sub(1, Ordering::SeqCst);
    }

    fn ref_count(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }
}

/// Mock index writer: `stage_refresh` makes the next flush report changes at
/// the given version.
pub struct MockWriter {
    version: AtomicU64,
    pending: AtomicBool,
    files: Mutex<FilesMetadata>,
    fail_flush: Mutex<Option<ReplicationError>>,
    ram_buffer_mb: Mutex<f64>,
    closed: AtomicBool,
}

impl MockWriter {
    pub fn new(version: SearcherVersion) -> Arc<Self> {
        Arc::new(Self {
            version: AtomicU64::new(version),
            pending: AtomicBool::new(false),
            files: Mutex::new(segment_files(&["_0.cfs", "segments_1"])),
            fail_flush: Mutex::new(None),
            ram_buffer_mb: Mutex::new(256.0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn stage_refresh(&self, version: SearcherVersion) {
        self.version.store(version, Ordering::SeqCst);
        self.pending.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_flush(&self, err: ReplicationError) {
        *self.fail_flush.lock() = Some(err);
    }

    pub fn ram_buffer_mb(&self) -> f64 {
        *self.ram_buffer_mb.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl IndexWriterHandle for MockWriter {
    fn flush_and_refresh(&self) -> ReplicationResult<bool> {
        if let Some(err) = self.fail_flush.lock().take() {
            return Err(err);
        }
        Ok(self.pending.swap(false, Ordering::SeqCst))
    }

    fn copy_state(&self) -> ReplicationResult<CopyState> {
        Ok(CopyState {
            version: self.version.load(Ordering::SeqCst),
            primary_gen: PRIMARY_GEN,
            files: self.files.lock().clone(),
        })
    }

    fn copy_state_version(&self) -> SearcherVersion {
        self.version.load(Ordering::SeqCst)
    }

    fn acquire_searcher(&self) -> ReplicationResult<Arc<dyn NrtSearcher>> {
        Ok(Arc::new(MockSearcher::new(self.copy_state_version())))
    }

    fn set_ram_buffer_size_mb(&self, mb: f64) {
        *self.ram_buffer_mb.lock() = mb;
    }

    fn close(&self) -> ReplicationResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MockUploader {
    pub uploads: Mutex<Vec<CopyState>>,
    pub result: Mutex<ReplicationResult<()>>,
}

impl MockUploader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            uploads: Mutex::new(Vec::new()),
            result: Mutex::new(Ok(())),
        })
    }

    pub fn uploaded_versions(&self) -> Vec<SearcherVersion> {
        self.uploads.lock().iter().map(|state| state.version).collect()
    }
}

#[async_trait]
impl CopyStateUploader for MockUploader {
    async fn upload(&self, copy_state: &CopyState) -> ReplicationResult<()> {
        self.uploads.lock().push(copy_state.clone());
        self.result.lock().clone()
    }
}

pub struct PrimaryFixture {
    pub primary: Arc<PrimaryNode>,
    pub manager: Arc<PrimaryRefreshManager>,
    pub writer: Arc<MockWriter>,
    pub uploader: Arc<MockUploader>,
    pub queue: Arc<StateUploadQueue>,
    pub config: Arc<RwLock<ReplicationConfig>>,
}

/// Must run inside a tokio runtime, the upload worker is spawned eagerly.
pub fn primary_fixture() -> PrimaryFixture {
    primary_fixture_with_config(ReplicationConfig::default())
}

pub fn primary_fixture_with_config(config: ReplicationConfig) -> PrimaryFixture {
    let writer = MockWriter::new(1);
    let uploader = MockUploader::new();
    let queue = Arc::new(StateUploadQueue::spawn(uploader.clone()));
    let config = Arc::new(RwLock::new(config));
    let primary = Arc::new(PrimaryNode::new(
        "test-index",
        "test-index-id",
        PRIMARY_GEN,
        HostPort::new("primary", 6000),
        writer.clone(),
        queue.clone(),
        config.clone(),
    ));
    let manager =
        Arc::new(PrimaryRefreshManager::new(primary.clone()).expect("initial searcher"));
    PrimaryFixture {
        primary,
        manager,
        writer,
        uploader,
        queue,
        config,
    }
}
