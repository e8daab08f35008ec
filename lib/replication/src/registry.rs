use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::client::ReplicationClient;
use crate::types::{HostPort, ReplicaId};

/// A registered replica: identity plus the outbound client capability.
#[derive(Clone)]
pub struct ReplicaHandle {
    pub replica_id: ReplicaId,
    pub host_port: HostPort,
    pub client: Arc<dyn ReplicationClient>,
}

impl ReplicaHandle {
    pub fn new(replica_id: ReplicaId, client: Arc<dyn ReplicationClient>) -> Self {
        let host_port = client.host_port();
        Self {
            replica_id,
            host_port,
            client,
        }
    }
}

// Equality and hashing cover `(replica_id, host_port)` only. The client
// handle is excluded so that a reconnect replacing the channel does not
// register the replica a second time.
impl PartialEq for ReplicaHandle {
    fn eq(&self, other: &Self) -> bool {
        self.replica_id == other.replica_id && self.host_port == other.host_port
    }
}

impl Eq for ReplicaHandle {}

impl Hash for ReplicaHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.replica_id.hash(state);
        self.host_port.hash(state);
    }
}

impl fmt::Debug for ReplicaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicaHandle")
            .field("replica_id", &self.replica_id)
            .field("host_port", &self.host_port)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for ReplicaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R{} ({})", self.replica_id, self.host_port)
    }
}

/// Concurrent collection of registered replicas, unique by
/// `(replica_id, host_port)`.
///
/// No operation performs I/O or blocks while holding the lock; the broadcast
/// and pre-copy paths iterate over snapshots.
#[derive(Default)]
pub struct ReplicaRegistry {
    replicas: RwLock<Vec<ReplicaHandle>>,
}

impl ReplicaRegistry {
    /// Inserts the handle unless an equal entry is already present. Returns
    /// whether it was inserted.
    pub fn add(&self, handle: ReplicaHandle) -> bool {
        let mut replicas = self.replicas.write();
        if replicas.contains(&handle) {
            return false;
        }
        replicas.push(handle);
        true
    }

    pub fn remove(&self, handle: &ReplicaHandle) -> bool {
        let mut replicas = self.replicas.write();
        let before = replicas.len();
        replicas.retain(|existing| existing != handle);
        replicas.len() != before
    }

    /// Owned copy, safe to iterate while other threads mutate the registry.
    pub fn snapshot(&self) -> Vec<ReplicaHandle> {
        self.replicas.read().clone()
    }

    /// Removes and returns all entries, for shutdown.
    pub fn drain(&self) -> Vec<ReplicaHandle> {
        std::mem::take(&mut *self.replicas.write())
    }

    pub fn len(&self) -> usize {
        self.replicas.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.read().is_empty()
    }
}
