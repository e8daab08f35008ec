use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use crate::types::SearcherVersion;

const AVG_DATASET_LEN: usize = 128;

#[derive(Serialize, Clone, Debug, Default, PartialEq)]
pub struct OperationStatistics {
    pub count: usize,
    pub fail_count: usize,
    pub avg_time: Option<Duration>,
}

/// Sliding average over operation durations.
pub struct OperationDurationsAggregator {
    ok_count: usize,
    fail_count: usize,
    timings: [f32; AVG_DATASET_LEN],
    timing_index: usize,
    timing_loops: usize,
}

impl OperationDurationsAggregator {
    pub fn new() -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self {
            ok_count: 0,
            fail_count: 0,
            timings: [0.; AVG_DATASET_LEN],
            timing_index: 0,
            timing_loops: 0,
        }))
    }

    pub fn add_operation_result(&mut self, success: bool, duration: Duration) {
        if success {
            self.ok_count += 1;
            self.timings[self.timing_index] = duration.as_micros() as f32;
            self.timing_index += 1;
            if self.timing_index >= AVG_DATASET_LEN {
                self.timing_index = 0;
                self.timing_loops += 1;
            }
        } else {
            self.fail_count += 1;
        }
    }

    pub fn get_statistics(&self) -> OperationStatistics {
        OperationStatistics {
            count: self.ok_count,
            fail_count: self.fail_count,
            avg_time: (self.ok_count > 0).then(|| self.calculate_avg()),
        }
    }

    fn calculate_avg(&self) -> Duration {
        let data_len = if self.timing_loops > 0 {
            AVG_DATASET_LEN
        } else {
            self.timing_index
        };
        let sum: f32 = self.timings[..data_len].iter().sum();
        Duration::from_micros((sum / data_len as f32) as u64)
    }
}

/// Counters of the replication coordinator. External metric sinks consume
/// the [`telemetry`](ReplicationMetrics::telemetry) snapshot.
pub struct ReplicationMetrics {
    searcher_version: AtomicU64,
    nrt_point_count: AtomicUsize,
    merge_precopy_start_count: AtomicUsize,
    merge_precopy_end_count: AtomicUsize,
    merge_precopy_durations: Arc<Mutex<OperationDurationsAggregator>>,
}

impl Default for ReplicationMetrics {
    fn default() -> Self {
        Self {
            searcher_version: AtomicU64::new(0),
            nrt_point_count: AtomicUsize::new(0),
            merge_precopy_start_count: AtomicUsize::new(0),
            merge_precopy_end_count: AtomicUsize::new(0),
            merge_precopy_durations: OperationDurationsAggregator::new(),
        }
    }
}

impl ReplicationMetrics {
    pub fn on_nrt_point_sent(&self, version: SearcherVersion) {
        self.searcher_version.store(version, Ordering::Relaxed);
        self.nrt_point_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_merge_precopy_start(&self) {
        self.merge_precopy_start_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_merge_precopy_end(&self, elapsed: Duration, completed: bool) {
        self.merge_precopy_end_count.fetch_add(1, Ordering::Relaxed);
        self.merge_precopy_durations
            .lock()
            .add_operation_result(completed, elapsed);
    }

    pub fn telemetry(&self) -> ReplicationTelemetry {
        ReplicationTelemetry {
            searcher_version: self.searcher_version.load(Ordering::Relaxed),
            nrt_point_count: self.nrt_point_count.load(Ordering::Relaxed),
            merge_precopy_start_count: self.merge_precopy_start_count.load(Ordering::Relaxed),
            merge_precopy_end_count: self.merge_precopy_end_count.load(Ordering::Relaxed),
            merge_precopy: self.merge_precopy_durations.lock().get_statistics(),
        }
    }
}

#[derive(Serialize, Clone, Debug)]
pub struct ReplicationTelemetry {
    pub searcher_version: SearcherVersion,
    pub nrt_point_count: usize,
    pub merge_precopy_start_count: usize,
    pub merge_precopy_end_count: usize,
    pub merge_precopy: OperationStatistics,
}
