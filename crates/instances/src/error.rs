//! Error types for instance commands

use hearth_cluster::ErrorKind;
use hearth_operations::OperationError;
use thiserror::Error;

/// Result type for instance commands
pub type InstanceResult<T> = Result<T, InstanceError>;

/// Errors raised while validating or submitting instance commands
#[derive(Debug, Error)]
pub enum InstanceError {
    /// Snapshot name rejected by validation
    #[error("Invalid snapshot name {name:?}: {reason}")]
    InvalidName {
        /// Rejected name
        name: String,
        /// What is wrong with it
        reason: &'static str,
    },

    /// Request rejected by validation
    #[error("{0}")]
    InvalidArgument(String),

    /// Replacing an existing snapshot failed while deleting it
    #[error("Failed deleting existing snapshot {name:?}: {err}")]
    ReuseFailed {
        /// Snapshot being replaced
        name: String,
        /// Error reported by the delete operation
        err: String,
    },

    /// Cluster store failure
    #[error(transparent)]
    Cluster(#[from] hearth_cluster::Error),

    /// Operation engine failure
    #[error(transparent)]
    Operation(#[from] OperationError),
}

impl InstanceError {
    /// Error kind used to pick a response status
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidName { .. } | Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::ReuseFailed { .. } => ErrorKind::Internal,
            Self::Cluster(e) => e.kind(),
            Self::Operation(e) => match e {
                OperationError::NotFound(_) => ErrorKind::NotFound,
                OperationError::Unavailable(_) => ErrorKind::Unavailable,
                OperationError::InvalidState(_) => ErrorKind::Conflict,
                OperationError::Timeout { .. } => ErrorKind::Timeout,
            },
        }
    }
}
