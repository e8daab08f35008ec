use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::time::Instant;
use tonic::Status;

use crate::types::{FilesMetadata, HostPort, PrimaryGen, SearcherVersion, TransferStatus};

/// Server-streaming transfer progress as surfaced by a tonic client call.
/// Dropping the stream cancels the underlying call.
pub type TransferStatusStream = BoxStream<'static, Result<TransferStatus, Status>>;

/// Outbound RPC capability of one replica node, consumed by the coordinator.
///
/// Implementations wrap a tonic channel; the coordinator never sees the
/// transport itself, only status codes and streams.
#[async_trait]
pub trait ReplicationClient: Send + Sync {
    /// Address of the replication endpoint this client is connected to.
    fn host_port(&self) -> HostPort;

    /// Notify the replica of a new NRT point to converge to. Unary;
    /// `Unavailable` and `FailedPrecondition` mean the replica is lost to
    /// this primary, anything else is transient.
    async fn new_nrt_point(
        &self,
        index_name: &str,
        index_id: &str,
        primary_gen: PrimaryGen,
        version: SearcherVersion,
    ) -> Result<(), Status>;

    /// Ask the replica to start ingesting the given files and return the
    /// transfer progress stream. The deadline, when set, is carried by the
    /// call; the stream terminates with `DeadlineExceeded` once it passes.
    async fn copy_files(
        &self,
        index_name: &str,
        index_id: &str,
        primary_gen: PrimaryGen,
        files: FilesMetadata,
        deadline: Option<Instant>,
    ) -> Result<TransferStatusStream, Status>;

    /// Tear down the underlying channel.
    fn close(&self);
}
