use thiserror::Error;
use tonic::Code;

pub type ReplicationResult<T> = Result<T, ReplicationError>;

/// Errors surfaced by the replication coordinator.
///
/// The type is `Clone` because a single failure cause may have to complete
/// any number of refresh watcher futures.
#[derive(Error, Debug, Clone)]
pub enum ReplicationError {
    #[error("Service internal error: {description}")]
    Service { description: String },
    #[error("Timeout error: {description}")]
    Timeout { description: String },
    #[error("Operation cancelled: {description}")]
    Cancelled { description: String },
}

impl ReplicationError {
    pub fn service_error(description: impl Into<String>) -> Self {
        Self::Service {
            description: description.into(),
        }
    }

    pub fn timeout(description: impl Into<String>) -> Self {
        Self::Timeout {
            description: description.into(),
        }
    }

    pub fn cancelled(description: impl Into<String>) -> Self {
        Self::Cancelled {
            description: description.into(),
        }
    }
}

impl From<tonic::Status> for ReplicationError {
    fn from(status: tonic::Status) -> Self {
        match status.code() {
            Code::DeadlineExceeded => Self::Timeout {
                description: status.message().to_string(),
            },
            Code::Cancelled => Self::Cancelled {
                description: status.message().to_string(),
            },
            _ => Self::Service {
                description: status.to_string(),
            },
        }
    }
}
