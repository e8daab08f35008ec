use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Settings of the replication coordinator. Held behind a shared lock so
/// changes apply to in-flight coordination; everything else about the index
/// (merge tuning, directory choice) is passed through to the writer and
/// opaque here.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ReplicationConfig {
    /// Longest a merge pre-copy may keep replicas warming, in seconds.
    /// Zero or negative disables the deadline.
    #[serde(default)]
    pub max_merge_precopy_duration_sec: i64,
    /// RAM buffer handed to the index writer, in megabytes.
    #[serde(default = "default_ram_buffer_size_mb")]
    pub ram_buffer_size_mb: f64,
    /// Interval between periodic refresh ticks, in milliseconds.
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
}

fn default_ram_buffer_size_mb() -> f64 {
    256.0
}

fn default_refresh_interval_ms() -> u64 {
    1000
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        ReplicationConfig {
            max_merge_precopy_duration_sec: 0,
            ram_buffer_size_mb: default_ram_buffer_size_mb(),
            refresh_interval_ms: default_refresh_interval_ms(),
        }
    }
}

impl ReplicationConfig {
    pub fn max_merge_precopy_duration(&self) -> Option<Duration> {
        (self.max_merge_precopy_duration_sec > 0)
            .then(|| Duration::from_secs(self.max_merge_precopy_duration_sec as u64))
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }
}
