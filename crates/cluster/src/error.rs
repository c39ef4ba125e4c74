//! Error types for cluster membership and the cluster store

use std::fmt;

use thiserror::Error;

/// Result type for cluster operations
pub type ClusterResult<T> = Result<T, Error>;

/// Main error type for the cluster crate
#[derive(Debug, Error)]
pub struct Error {
    /// Error kind
    kind: ErrorKind,
    /// Error context
    context: ErrorContext,
}

impl Error {
    /// Create a new error
    pub fn new(kind: ErrorKind, context: ErrorContext) -> Self {
        Self { kind, context }
    }

    /// Create error with string context
    pub fn with_context(kind: ErrorKind, context: impl Into<String>) -> Self {
        Self {
            kind,
            context: ErrorContext::Message(context.into()),
        }
    }

    /// Create error wrapping a source error
    pub fn chain(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            kind,
            context: ErrorContext::Chain {
                message: message.into(),
                source: source.into(),
            },
        }
    }

    /// Get error kind
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Get error context
    pub fn context(&self) -> &ErrorContext {
        &self.context
    }

    /// Create a not found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::NotFound, what)
    }

    /// Create a conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Conflict, msg)
    }

    /// Create an unavailable error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Unavailable, msg)
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Timeout, msg)
    }

    /// Create an invalid token error
    pub fn invalid_token(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::InvalidToken, msg)
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::InvalidArgument, msg)
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Internal, msg)
    }

    /// Create a not leader error
    pub fn not_leader(msg: impl Into<String>, current_leader: Option<String>) -> Self {
        Self {
            kind: ErrorKind::NotLeader,
            context: ErrorContext::Leadership {
                message: msg.into(),
                current_leader,
            },
        }
    }

    /// Check if this is a not-leader error
    pub fn is_not_leader(&self) -> bool {
        matches!(self.kind, ErrorKind::NotLeader)
    }

    /// Check if this is a not-found error
    pub fn is_not_found(&self) -> bool {
        matches!(self.kind, ErrorKind::NotFound)
    }

    /// Get the current leader from a not-leader error
    pub fn get_leader(&self) -> Option<&str> {
        match &self.context {
            ErrorContext::Leadership { current_leader, .. } => current_leader.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.context {
            ErrorContext::Message(msg) => write!(f, "{msg}"),
            ErrorContext::Chain { message, source } => write!(f, "{message}: {source}"),
            ErrorContext::Leadership {
                message,
                current_leader,
            } => {
                if let Some(leader) = current_leader {
                    write!(f, "{message} (current leader: {leader})")
                } else {
                    write!(f, "{message} (no known leader)")
                }
            }
        }
    }
}

/// Error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Named entity absent
    NotFound,
    /// Request clashes with current state
    Conflict,
    /// No leader or writes are gated; retry with backoff
    Unavailable,
    /// Caller deadline exceeded
    Timeout,
    /// Malformed or unusable join token
    InvalidToken,
    /// Malformed input
    InvalidArgument,
    /// Permission denied
    Forbidden,
    /// Collaborator or storage failure
    Internal,
    /// Proposal sent to a member that is not the leader
    NotLeader,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::NotFound => write!(f, "Not found"),
            ErrorKind::Conflict => write!(f, "Conflict"),
            ErrorKind::Unavailable => write!(f, "Unavailable"),
            ErrorKind::Timeout => write!(f, "Timeout"),
            ErrorKind::InvalidToken => write!(f, "Invalid token"),
            ErrorKind::InvalidArgument => write!(f, "Invalid argument"),
            ErrorKind::Forbidden => write!(f, "Forbidden"),
            ErrorKind::Internal => write!(f, "Internal error"),
            ErrorKind::NotLeader => write!(f, "Not the leader"),
        }
    }
}

/// Error context
#[derive(Debug)]
pub enum ErrorContext {
    /// Simple message
    Message(String),
    /// Error chain with source
    Chain {
        /// Error message
        message: String,
        /// Source error
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// Leadership error with info
    Leadership {
        /// Error message
        message: String,
        /// Current leader if known
        current_leader: Option<String>,
    },
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::chain(ErrorKind::Internal, "I/O error", err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::chain(ErrorKind::Internal, "Serialization error", err)
    }
}

impl From<hearth_storage::StorageError> for Error {
    fn from(err: hearth_storage::StorageError) -> Self {
        Self::chain(ErrorKind::Internal, "Log storage error", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_context() {
        let err = Error::not_leader("Proposal rejected by node2", Some("node1".to_string()));
        assert!(err.is_not_leader());
        assert_eq!(err.get_leader(), Some("node1"));
        assert_eq!(
            err.to_string(),
            "Proposal rejected by node2 (current leader: node1)"
        );

        let err = Error::chain(
            ErrorKind::Internal,
            "Failed loading networks",
            std::io::Error::other("disk gone"),
        );
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(err.to_string(), "Failed loading networks: disk gone");
    }
}
