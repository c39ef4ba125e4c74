//! Asynchronous operation tracking for hearth
//!
//! Every mutating action on the control plane is represented by an
//! [`Operation`]. The engine creates operations, drives their work on the
//! tokio runtime, publishes status transitions to any number of waiters, and
//! reaps terminal operations once their retention window has passed.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Engine configuration
pub mod config;

/// Operation engine
pub mod engine;

/// Error types
pub mod error;

/// Progress reporting for running work
pub mod progress;

/// Cluster-wide operation registry seam
pub mod registry;

/// Operation types
pub mod types;

pub use config::OperationsConfig;
pub use engine::{OperationContext, OperationEngine, OperationHandle, WorkError};
pub use error::{OperationError, OperationResult};
pub use progress::ProgressReporter;
pub use registry::{NoopRegistry, OperationRegistry, RegistryError};
pub use types::{Operation, OperationClass, OperationStatus, Resources};
