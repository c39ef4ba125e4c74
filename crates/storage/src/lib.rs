//! Log storage traits for the hearth cluster database
//!
//! The replicated cluster database is a sequence of committed entries. This
//! crate only describes how those entries are persisted; it knows nothing
//! about what they contain.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Indexed log storage
pub mod log;

pub use log::{
    LogIndex, LogStorage, StorageError, StorageNamespace, StorageResult, display_payload,
};
