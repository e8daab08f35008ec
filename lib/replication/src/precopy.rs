use std::collections::HashSet;
use std::mem;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::client::TransferStatusStream;
use crate::registry::ReplicaHandle;
use crate::types::{FilesMetadata, PrimaryGen};

/// Tracks the set of replicas currently ingesting the files of one merged
/// segment.
///
/// The file map is fixed at construction. The connection set shrinks as
/// transfers drain; [`try_add_connection`](Self::try_add_connection) may
/// enlarge it until the pre-copy is finished or past its deadline. `finished`
/// becomes true exactly once, when the connection set runs empty.
pub struct MergePreCopy {
    files: FilesMetadata,
    deadline: Option<Instant>,
    state: Mutex<PreCopyState>,
}

struct PreCopyState {
    connections: HashSet<ReplicaHandle>,
    pending_transfers: Vec<(ReplicaHandle, TransferStatusStream)>,
    finished: bool,
}

impl MergePreCopy {
    pub fn new(
        files: FilesMetadata,
        transfers: Vec<(ReplicaHandle, TransferStatusStream)>,
        deadline: Option<Instant>,
    ) -> Self {
        let connections = transfers.iter().map(|(handle, _)| handle.clone()).collect();
        Self {
            files,
            deadline,
            state: Mutex::new(PreCopyState {
                connections,
                pending_transfers: transfers,
                finished: false,
            }),
        }
    }

    pub fn files(&self) -> &FilesMetadata {
        &self.files
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn contains(&self, handle: &ReplicaHandle) -> bool {
        self.state.lock().connections.contains(handle)
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    /// Marks the pre-copy finished if no connections remain. Monotonic: once
    /// true, stays true, and no replica can be admitted anymore.
    pub fn try_finish(&self) -> bool {
        let mut state = self.state.lock();
        if state.connections.is_empty() {
            state.finished = true;
        }
        state.finished
    }

    fn deadline_expired(&self) -> bool {
        self.deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Admits a late-joining replica: starts a `copy_files` transfer with the
    /// pre-copy's own files and deadline and adds the replica to the active
    /// set. Returns false when the pre-copy is finished, past its deadline,
    /// the replica is already participating, or the transfer failed to start.
    pub async fn try_add_connection(
        &self,
        handle: &ReplicaHandle,
        index_name: &str,
        index_id: &str,
        primary_gen: PrimaryGen,
    ) -> bool {
        {
            let state = self.state.lock();
            if state.finished || self.deadline_expired() || state.connections.contains(handle) {
                return false;
            }
        }

        let stream = match handle
            .client
            .copy_files(
                index_name,
                index_id,
                primary_gen,
                self.files.clone(),
                self.deadline,
            )
            .await
        {
            Ok(stream) => stream,
            Err(status) => {
                log::warn!(
                    "Failed to start merge precopy transfer to replica {}: {status}",
                    handle.host_port,
                );
                return false;
            }
        };

        let mut state = self.state.lock();
        // The pre-copy may have been declared done while the transfer was
        // being opened. Dropping the stream cancels the call, so losing the
        // race leaks nothing.
        if state.finished || self.deadline_expired() || state.connections.contains(handle) {
            return false;
        }
        state.connections.insert(handle.clone());
        state.pending_transfers.push((handle.clone(), stream));
        true
    }

    /// Hands out the transfer streams that have not been drained yet. Each
    /// stream is returned exactly once; the replica stays in the connection
    /// set until the caller drains its stream and removes it with
    /// [`remove_connection`](Self::remove_connection).
    pub fn take_pending_transfers(&self) -> Vec<(ReplicaHandle, TransferStatusStream)> {
        mem::take(&mut self.state.lock().pending_transfers)
    }

    pub fn remove_connection(&self, handle: &ReplicaHandle) {
        self.state.lock().connections.remove(handle);
    }
}
