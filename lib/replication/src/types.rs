use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub type ReplicaId = u32;

/// Distinguishes successive primary leaderships; version semantics reset
/// across generations.
pub type PrimaryGen = u64;

/// Version of a searcher snapshot, non-decreasing within one primary
/// generation.
pub type SearcherVersion = u64;

/// Network endpoint of a replica's replication service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Immutable descriptor of one segment file, produced by the index writer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub length: u64,
    pub checksum: u64,
    pub header: Vec<u8>,
    pub footer: Vec<u8>,
}

/// File name to descriptor map describing the files of one snapshot or merge.
pub type FilesMetadata = HashMap<String, FileMetadata>;

/// Everything a replica needs to materialize one searcher snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyState {
    pub version: SearcherVersion,
    pub primary_gen: PrimaryGen,
    pub files: FilesMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferCode {
    Ongoing,
    Done,
    Failed,
}

/// One progress item of a file transfer. The coordinator drains and logs
/// these, it never interprets the code for control flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferStatus {
    pub code: TransferCode,
    pub message: String,
}
