//! Log storage in files on disk
//!
//! Every namespace is a directory below the storage root and every entry a
//! file in it, named after its zero-padded index. Entries are written to a
//! temporary file first and renamed into place, so a crash never leaves a
//! half-written entry under a valid name.

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use hearth_storage::{LogIndex, LogStorage, StorageError, StorageNamespace, StorageResult};
use tokio::fs;
use tokio::io::{self, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

const INDEX_WIDTH: usize = 20;

type Bounds = Option<(LogIndex, LogIndex)>;

/// Log storage using files on disk. Clones share the same bounds cache.
#[derive(Clone)]
pub struct FsStorage {
    dir: PathBuf,
    bounds: Arc<Mutex<HashMap<StorageNamespace, Bounds>>>,
}

impl FsStorage {
    /// Creates a new `FsStorage` rooted at `dir`. Nothing is read or created
    /// until the first access.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            bounds: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn namespace_dir(&self, namespace: &StorageNamespace) -> PathBuf {
        self.dir.join(namespace.as_str())
    }

    fn entry_path(&self, namespace: &StorageNamespace, index: LogIndex) -> PathBuf {
        self.namespace_dir(namespace)
            .join(format!("{index:0width$}", width = INDEX_WIDTH))
    }

    async fn scan(&self, namespace: &StorageNamespace) -> StorageResult<Bounds> {
        let dir = self.namespace_dir(namespace);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::Io("error reading log directory", e)),
        };

        let mut bounds: Bounds = None;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::Io("error reading log directory entry", e))?
        {
            let Some(index) = entry.file_name().to_str().and_then(parse_index) else {
                continue;
            };
            bounds = Some(match bounds {
                None => (index, index),
                Some((first, last)) => (first.min(index), last.max(index)),
            });
        }

        debug!("Opened log {} with bounds {:?}", dir.display(), bounds);
        Ok(bounds)
    }

    async fn cached_bounds(
        &self,
        cache: &mut HashMap<StorageNamespace, Bounds>,
        namespace: &StorageNamespace,
    ) -> StorageResult<Bounds> {
        if let Some(bounds) = cache.get(namespace) {
            return Ok(*bounds);
        }

        let bounds = self.scan(namespace).await?;
        cache.insert(namespace.clone(), bounds);
        Ok(bounds)
    }

    async fn write_entries(
        &self,
        namespace: &StorageNamespace,
        entries: &[(LogIndex, Bytes)],
    ) -> StorageResult<()> {
        create_dir(&self.namespace_dir(namespace)).await?;

        for (index, payload) in entries {
            let path = self.entry_path(namespace, *index);
            let staging = path.with_extension("tmp");

            let mut file = fs::File::create(&staging)
                .await
                .map_err(|e| StorageError::Io("error creating log entry", e))?;
            file.write_all(payload)
                .await
                .map_err(|e| StorageError::Io("error writing log entry", e))?;
            file.sync_data()
                .await
                .map_err(|e| StorageError::Io("error syncing log entry", e))?;

            fs::rename(&staging, &path)
                .await
                .map_err(|e| StorageError::Io("error renaming log entry", e))?;
        }

        Ok(())
    }
}

fn parse_index(name: &str) -> Option<LogIndex> {
    if name.len() != INDEX_WIDTH || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}

async fn create_dir(dir: &Path) -> StorageResult<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o750);

    builder
        .create(dir)
        .await
        .map_err(|e| StorageError::Io("error creating log directory", e))
}

#[async_trait]
impl LogStorage for FsStorage {
    async fn append(
        &self,
        namespace: &StorageNamespace,
        entries: Vec<(LogIndex, Bytes)>,
    ) -> StorageResult<()> {
        let (Some((first_new, _)), Some((last_new, _))) = (entries.first(), entries.last()) else {
            return Ok(());
        };
        let (first_new, last_new) = (*first_new, *last_new);

        let mut cache = self.bounds.lock().await;
        let bounds = self.cached_bounds(&mut cache, namespace).await?;

        let mut expected = bounds.map_or(1, |(_, last)| last + 1);
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

        if let Err(e) = self.write_entries(namespace, &entries).await {
            // Part of the batch may have landed; rescan on next access
            cache.remove(namespace);
            return Err(e);
        }

        let first = bounds.map_or(first_new, |(first, _)| first);
        cache.insert(namespace.clone(), Some((first, last_new)));
        Ok(())
    }

    async fn bounds(&self, namespace: &StorageNamespace) -> StorageResult<Bounds> {
        let mut cache = self.bounds.lock().await;
        self.cached_bounds(&mut cache, namespace).await
    }

    async fn read_range(
        &self,
        namespace: &StorageNamespace,
        start: LogIndex,
        end: LogIndex,
    ) -> StorageResult<Vec<(LogIndex, Bytes)>> {
        let Some((first, last)) = self.bounds(namespace).await? else {
            return Ok(Vec::new());
        };

        let mut result = Vec::new();
        for index in start.max(first)..end.min(last.saturating_add(1)) {
            let payload = fs::read(self.entry_path(namespace, index))
                .await
                .map_err(|e| StorageError::Io("error reading log entry", e))?;
            result.push((index, Bytes::from(payload)));
        }

        Ok(result)
    }
}

impl std::fmt::Debug for FsStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsStorage")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;

    fn entry(index: LogIndex) -> (LogIndex, Bytes) {
        (index, Bytes::from(format!("{{\"base_index\":{}}}", index - 1)))
    }

    #[tokio::test]
    async fn test_append_and_read() {
        let dir = tempdir().unwrap();
        let storage = FsStorage::new(dir.path());
        let global = StorageNamespace::new("global");

        assert_eq!(storage.bounds(&global).await.unwrap(), None);
        assert!(storage.read_range(&global, 1, 10).await.unwrap().is_empty());

        storage
            .append(&global, vec![entry(1), entry(2), entry(3)])
            .await
            .unwrap();

        assert_eq!(
            storage.read_range(&global, 2, 10).await.unwrap(),
            vec![entry(2), entry(3)]
        );
        assert!(storage.read_range(&global, 3, 3).await.unwrap().is_empty());
        assert_eq!(storage.bounds(&global).await.unwrap(), Some((1, 3)));
        assert!(dir.path().join("global/00000000000000000002").is_file());
    }

    #[tokio::test]
    async fn test_entries_survive_reopen() {
        let dir = tempdir().unwrap();
        let global = StorageNamespace::new("global");

        let storage = FsStorage::new(dir.path());
        storage.append(&global, vec![entry(1), entry(2)]).await.unwrap();
        drop(storage);

        // Leftovers of an interrupted write are not entries
        std::fs::write(dir.path().join("global/00000000000000000003.tmp"), b"{").unwrap();

        let reopened = FsStorage::new(dir.path());
        assert_eq!(reopened.bounds(&global).await.unwrap(), Some((1, 2)));
        assert_eq!(
            reopened.read_range(&global, 1, 3).await.unwrap(),
            vec![entry(1), entry(2)]
        );

        reopened.append(&global, vec![entry(3)]).await.unwrap();
        assert_eq!(reopened.bounds(&global).await.unwrap(), Some((1, 3)));
    }

    #[tokio::test]
    async fn test_append_rejects_gaps() {
        let dir = tempdir().unwrap();
        let storage = FsStorage::new(dir.path());
        let global = StorageNamespace::new("global");
        storage.append(&global, vec![entry(1)]).await.unwrap();

        let err = storage
            .append(&global, vec![entry(2), entry(4)])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::OutOfSequence {
                expected: 3,
                got: 4,
                ..
            }
        ));
        assert_eq!(storage.bounds(&global).await.unwrap(), Some((1, 1)));
        assert!(!dir.path().join("global/00000000000000000002").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_namespace_directory_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let storage = FsStorage::new(dir.path());
        storage
            .append(&StorageNamespace::new("global"), vec![entry(1)])
            .await
            .unwrap();

        let mode = std::fs::metadata(dir.path().join("global"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o750);
    }

    #[test]
    fn test_parse_index() {
        assert_eq!(parse_index("00000000000000000042"), Some(42));
        assert_eq!(parse_index("42"), None);
        assert_eq!(parse_index("0000000000000000004x"), None);
        assert_eq!(parse_index("00000000000000000042.tmp"), None);
    }
}
