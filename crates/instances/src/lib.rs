//! Instance commands for hearth
//!
//! Snapshot create, delete, rename and restore are validated synchronously
//! and then executed as operations through an [`InstanceDriver`].

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Instance runtime seam
pub mod driver;

/// Error types
pub mod error;

/// Snapshot commands
pub mod snapshot;

pub use driver::{InstanceDriver, RecordOnlyDriver};
pub use error::{InstanceError, InstanceResult};
pub use snapshot::{SnapshotManager, SnapshotRequest, next_snapshot_name, validate_snapshot_name};
