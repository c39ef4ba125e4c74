//! Indexed log storage abstraction
//!
//! Entries are opaque byte sequences keyed by a dense, monotonically
//! increasing index inside a namespace. The consensus layer owns the
//! meaning of each entry.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt::{Debug, Display};

/// Index of an entry in a log. Index 0 is never used for an entry.
pub type LogIndex = u64;

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in storage operations
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Storage backend error
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// IO operation failed
    #[error("{0}: {1}")]
    Io(&'static str, #[source] std::io::Error),

    /// Entry index out of sequence
    #[error("Out of sequence append to {namespace}: expected {expected}, got {got}")]
    OutOfSequence {
        /// Namespace being appended to
        namespace: String,
        /// Index the log expected next
        expected: LogIndex,
        /// Index that was supplied
        got: LogIndex,
    },
}

/// A namespace for organizing logs
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageNamespace(String);

impl StorageNamespace {
    /// Create a new storage namespace
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the namespace as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for StorageNamespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Renders an entry payload for log lines: UTF-8 when possible, hex otherwise.
pub fn display_payload(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(s) => s.to_string(),
        Err(_) => format!("0x{}", hex::encode(payload)),
    }
}

/// Log storage trait - stores indexed byte sequences
#[async_trait]
pub trait LogStorage: Debug + Send + Sync + 'static {
    /// Atomically append entries (one or more). Indices must continue the
    /// log without gaps.
    async fn append(
        &self,
        namespace: &StorageNamespace,
        entries: Vec<(LogIndex, Bytes)>,
    ) -> StorageResult<()>;

    /// Get the current bounds of the log (first_index, last_index)
    async fn bounds(
        &self,
        namespace: &StorageNamespace,
    ) -> StorageResult<Option<(LogIndex, LogIndex)>>;

    /// Read a range of entries [start, end)
    async fn read_range(
        &self,
        namespace: &StorageNamespace,
        start: LogIndex,
        end: LogIndex,
    ) -> StorageResult<Vec<(LogIndex, Bytes)>>;
}

#[async_trait]
impl<T: LogStorage> LogStorage for std::sync::Arc<T> {
    async fn append(
        &self,
        namespace: &StorageNamespace,
        entries: Vec<(LogIndex, Bytes)>,
    ) -> StorageResult<()> {
        (**self).append(namespace, entries).await
    }

    async fn bounds(
        &self,
        namespace: &StorageNamespace,
    ) -> StorageResult<Option<(LogIndex, LogIndex)>> {
        (**self).bounds(namespace).await
    }

    async fn read_range(
        &self,
        namespace: &StorageNamespace,
        start: LogIndex,
        end: LogIndex,
    ) -> StorageResult<Vec<(LogIndex, Bytes)>> {
        (**self).read_range(namespace, start, end).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_payload() {
        assert_eq!(display_payload(b"{\"a\":1}"), "{\"a\":1}");
        assert_eq!(display_payload(&[0xff, 0x00]), "0xff00");
    }
}
