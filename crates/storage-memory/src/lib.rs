//! In-memory log storage

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use hearth_storage::{LogIndex, LogStorage, StorageError, StorageNamespace, StorageResult};
use tokio::sync::RwLock;

type Logs = HashMap<StorageNamespace, BTreeMap<LogIndex, Bytes>>;

/// Log storage kept in process memory. Clones share the same logs.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    logs: Arc<RwLock<Logs>>,
}

impl MemoryStorage {
    /// Create empty storage
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LogStorage for MemoryStorage {
    async fn append(
        &self,
        namespace: &StorageNamespace,
        entries: Vec<(LogIndex, Bytes)>,
    ) -> StorageResult<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut logs = self.logs.write().await;
        let log = logs.entry(namespace.clone()).or_default();

        let mut expected = log.last_key_value().map_or(1, |(&last, _)| last + 1);
        for (index, _) in &entries {
            if *index != expected {
                return Err(StorageError::OutOfSequence {
                    namespace: namespace.to_string(),
                    expected,
                    got: *index,
                });
            }
            expected += 1;
        }

        log.extend(entries);
        Ok(())
    }

    async fn bounds(
        &self,
        namespace: &StorageNamespace,
    ) -> StorageResult<Option<(LogIndex, LogIndex)>> {
        let logs = self.logs.read().await;

        Ok(logs.get(namespace).and_then(|log| {
            let (&first, _) = log.first_key_value()?;
            let (&last, _) = log.last_key_value()?;
            Some((first, last))
        }))
    }

    async fn read_range(
        &self,
        namespace: &StorageNamespace,
        start: LogIndex,
        end: LogIndex,
    ) -> StorageResult<Vec<(LogIndex, Bytes)>> {
        if start >= end {
            return Ok(Vec::new());
        }

        let logs = self.logs.read().await;
        Ok(logs
            .get(namespace)
            .map(|log| {
                log.range(start..end)
                    .map(|(&index, payload)| (index, payload.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}

impl std::fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStorage").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit(index: LogIndex) -> (LogIndex, Bytes) {
        (index, Bytes::from(format!("{{\"base_index\":{}}}", index - 1)))
    }

    #[tokio::test]
    async fn test_append_and_read() {
        let storage = MemoryStorage::new();
        let global = StorageNamespace::new("global");

        assert_eq!(storage.bounds(&global).await.unwrap(), None);
        storage
            .append(&global, vec![commit(1), commit(2), commit(3)])
            .await
            .unwrap();

        let range = storage.read_range(&global, 2, 4).await.unwrap();
        assert_eq!(range, vec![commit(2), commit(3)]);
        assert!(storage.read_range(&global, 3, 3).await.unwrap().is_empty());
        assert_eq!(storage.bounds(&global).await.unwrap(), Some((1, 3)));
    }

    #[tokio::test]
    async fn test_append_rejects_gaps_and_rewrites() {
        let storage = MemoryStorage::new();
        let global = StorageNamespace::new("global");
        storage.append(&global, vec![commit(1)]).await.unwrap();

        let err = storage.append(&global, vec![commit(3)]).await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::OutOfSequence {
                expected: 2,
                got: 3,
                ..
            }
        ));

        let err = storage.append(&global, vec![commit(1)]).await.unwrap_err();
        assert!(matches!(err, StorageError::OutOfSequence { expected: 2, .. }));

        // A rejected batch leaves nothing behind
        let err = storage
            .append(&global, vec![commit(2), commit(4)])
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::OutOfSequence { got: 4, .. }));
        assert_eq!(storage.bounds(&global).await.unwrap(), Some((1, 1)));
    }

    #[tokio::test]
    async fn test_namespaces_are_independent() {
        let storage = MemoryStorage::new();
        let shared = storage.clone();

        storage
            .append(&StorageNamespace::new("a"), vec![commit(1)])
            .await
            .unwrap();
        shared
            .append(&StorageNamespace::new("b"), vec![commit(1), commit(2)])
            .await
            .unwrap();

        assert_eq!(
            storage.bounds(&StorageNamespace::new("b")).await.unwrap(),
            Some((1, 2))
        );
        assert_eq!(
            shared.bounds(&StorageNamespace::new("a")).await.unwrap(),
            Some((1, 1))
        );
    }
}
