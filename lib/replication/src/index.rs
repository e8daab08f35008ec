use std::sync::Arc;

use crate::error::ReplicationResult;
use crate::types::{CopyState, SearcherVersion};

/// Ref-counted, read-only view of the index at one version.
///
/// Reference counting is the reader-lifetime protocol: the searcher stays
/// usable while its count is above zero, the last `dec_ref` releases the
/// underlying reader.
pub trait NrtSearcher: Send + Sync {
    fn version(&self) -> SearcherVersion;

    /// Takes another reference, unless the searcher was already released.
    fn try_inc_ref(&self) -> bool;

    fn dec_ref(&self);

    fn ref_count(&self) -> usize;
}

/// Narrow handle to the underlying segment index writer. Indexing, merging
/// policy and searcher construction live behind this seam.
pub trait IndexWriterHandle: Send + Sync {
    /// Flush buffered documents and open a new snapshot. Returns true iff
    /// anything new became visible.
    fn flush_and_refresh(&self) -> ReplicationResult<bool>;

    /// Version plus file descriptors of the latest flushed snapshot.
    fn copy_state(&self) -> ReplicationResult<CopyState>;

    fn copy_state_version(&self) -> SearcherVersion;

    /// Searcher over the latest reader, with one reference already taken for
    /// the caller.
    fn acquire_searcher(&self) -> ReplicationResult<Arc<dyn NrtSearcher>>;

    fn set_ram_buffer_size_mb(&self, mb: f64);

    fn close(&self) -> ReplicationResult<()>;
}
