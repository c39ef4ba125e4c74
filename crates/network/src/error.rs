//! Error types for network allocation tracking

use hearth_cluster::ErrorKind;
use thiserror::Error;

/// Result type for network operations
pub type NetworkResult<T> = Result<T, NetworkError>;

/// Errors from network drivers and the allocation aggregator
#[derive(Debug, Error)]
pub enum NetworkError {
    /// The driver does not support the requested query
    #[error("Not implemented")]
    NotImplemented,

    /// No network with this name
    #[error("Network {0:?} not found")]
    NotFound(String),

    /// A stored or reported address could not be parsed
    #[error("Invalid IP address {0:?}")]
    InvalidAddress(String),

    /// Driver failure
    #[error("{0}")]
    Driver(String),

    /// Cluster store failure
    #[error(transparent)]
    Cluster(#[from] hearth_cluster::Error),

    /// Failure annotated with the entity being processed
    #[error("{context}: {source}")]
    Context {
        /// What was being done, naming network and project
        context: String,
        /// Underlying error
        #[source]
        source: Box<NetworkError>,
    },
}

impl NetworkError {
    /// Wrap with a description of the failing step
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Error kind used to pick a response status
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Cluster(e) => e.kind(),
            Self::Context { source, .. } => source.kind(),
            Self::NotImplemented | Self::InvalidAddress(_) | Self::Driver(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Whether the driver reported the query as unsupported
    pub fn is_not_implemented(&self) -> bool {
        match self {
            Self::NotImplemented => true,
            Self::Context { source, .. } => source.is_not_implemented(),
            _ => false,
        }
    }
}
