//! Error types for the operation engine

use std::time::Duration;

use thiserror::Error;

/// Result type for operation engine calls
pub type OperationResult<T> = Result<T, OperationError>;

/// Errors returned by the operation engine
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OperationError {
    /// No operation with this ID is known to the engine
    #[error("Operation not found: {0}")]
    NotFound(String),

    /// The engine is shutting down and refuses new work
    #[error("Operation engine unavailable: {0}")]
    Unavailable(String),

    /// The requested transition is not valid from the current status
    #[error("Invalid operation state: {0}")]
    InvalidState(String),

    /// Waiting for the operation exceeded the caller's deadline
    #[error("Timed out after {waited:?} waiting for operation {id}")]
    Timeout {
        /// Operation being waited on
        id: String,
        /// How long the caller waited
        waited: Duration,
    },
}
