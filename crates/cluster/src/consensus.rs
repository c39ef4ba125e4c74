//! Consensus log seam
//!
//! The store talks to the replicated log through [`Consensus`]. The log has a
//! single writer: only the current leader accepts proposals, and a proposal
//! whose read or write keys changed after the snapshot it was built on is
//! rejected. [`MemoryConsensus`] is the in-process log shared by all members
//! of a single-process cluster.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use hearth_storage::{LogIndex, LogStorage, StorageNamespace, display_payload};
use hearth_storage_memory::MemoryStorage;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{ClusterResult, Error};
use crate::state::Mutation;

/// Namespace holding the cluster log
pub const GLOBAL_NAMESPACE: &str = "global";

/// A transaction's commit as stored in the log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    /// Log index the transaction read from
    pub base_index: LogIndex,
    /// Keys the transaction read
    pub reads: BTreeSet<String>,
    /// Buffered changes, applied in order
    pub mutations: Vec<Mutation>,
}

impl Commit {
    /// Keys written by the commit
    pub fn write_keys(&self) -> BTreeSet<String> {
        self.mutations.iter().flat_map(Mutation::keys).collect()
    }
}

/// Replicated log used by the cluster store
#[async_trait]
pub trait Consensus: Send + Sync + 'static {
    /// Name of the current leader, if one is known
    async fn leader(&self) -> Option<String>;

    /// Propose a commit through `target`. Fails with `NotLeader` when the
    /// target does not hold write authority and with `Conflict` when the
    /// commit's keys changed after its base index.
    async fn propose(&self, target: &str, commit: Commit) -> ClusterResult<LogIndex>;

    /// Committed entries after `index`, in order
    async fn entries_since(&self, index: LogIndex) -> ClusterResult<Vec<(LogIndex, Commit)>>;

    /// Index of the last committed entry
    async fn commit_index(&self) -> LogIndex;
}

#[async_trait]
impl<T: Consensus> Consensus for Arc<T> {
    async fn leader(&self) -> Option<String> {
        (**self).leader().await
    }

    async fn propose(&self, target: &str, commit: Commit) -> ClusterResult<LogIndex> {
        (**self).propose(target, commit).await
    }

    async fn entries_since(&self, index: LogIndex) -> ClusterResult<Vec<(LogIndex, Commit)>> {
        (**self).entries_since(index).await
    }

    async fn commit_index(&self) -> LogIndex {
        (**self).commit_index().await
    }
}

#[derive(Default)]
struct LogState {
    commit_index: LogIndex,
    /// Index of the last commit that wrote each key
    key_versions: HashMap<String, LogIndex>,
}

/// In-process single-writer log backed by a [`LogStorage`]
pub struct MemoryConsensus<S: LogStorage = MemoryStorage> {
    storage: S,
    namespace: StorageNamespace,
    leader: RwLock<Option<String>>,
    log: Mutex<LogState>,
}

impl MemoryConsensus<MemoryStorage> {
    /// Create a log over fresh in-memory storage
    pub fn new(leader: Option<String>) -> Self {
        Self {
            storage: MemoryStorage::new(),
            namespace: StorageNamespace::new(GLOBAL_NAMESPACE),
            leader: RwLock::new(leader),
            log: Mutex::new(LogState::default()),
        }
    }
}

impl<S: LogStorage> MemoryConsensus<S> {
    /// Open a log over existing storage, replaying what it already holds
    pub async fn open(storage: S, leader: Option<String>) -> ClusterResult<Self> {
        let namespace = StorageNamespace::new(GLOBAL_NAMESPACE);
        let mut state = LogState::default();

        if let Some((first, last)) = storage.bounds(&namespace).await? {
            for (index, payload) in storage.read_range(&namespace, first, last + 1).await? {
                let commit = decode(index, &payload)?;
                for key in commit.write_keys() {
                    state.key_versions.insert(key, index);
                }
                state.commit_index = index;
            }
            info!("Replayed cluster log up to index {}", state.commit_index);
        }

        Ok(Self {
            storage,
            namespace,
            leader: RwLock::new(leader),
            log: Mutex::new(state),
        })
    }

    /// Hand write authority to `leader`, or to nobody
    pub fn set_leader(&self, leader: Option<String>) {
        info!("Cluster leader is now {:?}", leader);
        *self.leader.write() = leader;
    }
}

fn decode(index: LogIndex, payload: &[u8]) -> ClusterResult<Commit> {
    serde_json::from_slice(payload).map_err(|e| {
        Error::internal(format!(
            "Corrupt log entry {index} ({}): {e}",
            display_payload(payload)
        ))
    })
}

#[async_trait]
impl<S: LogStorage> Consensus for MemoryConsensus<S> {
    async fn leader(&self) -> Option<String> {
        self.leader.read().clone()
    }

    async fn propose(&self, target: &str, commit: Commit) -> ClusterResult<LogIndex> {
        let leader = self.leader.read().clone();
        match leader {
            None => return Err(Error::unavailable("No leader is currently known")),
            Some(leader) if leader != target => {
                return Err(Error::not_leader(
                    format!("Member {target} cannot accept writes"),
                    Some(leader),
                ));
            }
            Some(_) => {}
        }

        let mut log = self.log.lock().await;

        let writes = commit.write_keys();
        for key in commit.reads.iter().chain(writes.iter()) {
            let version = log.key_versions.get(key).copied().unwrap_or(0);
            if version > commit.base_index {
                return Err(Error::conflict(format!(
                    "Concurrent transaction changed {key} at index {version}"
                )));
            }
        }

        let index = log.commit_index + 1;
        let payload = serde_json::to_vec(&commit)?;
        self.storage
            .append(&self.namespace, vec![(index, Bytes::from(payload))])
            .await?;

        for key in writes {
            log.key_versions.insert(key, index);
        }
        log.commit_index = index;

        debug!(
            "Committed index {} with {} mutations",
            index,
            commit.mutations.len()
        );

        Ok(index)
    }

    async fn entries_since(&self, index: LogIndex) -> ClusterResult<Vec<(LogIndex, Commit)>> {
        let commit_index = self.log.lock().await.commit_index;
        if index >= commit_index {
            return Ok(Vec::new());
        }

        self.storage
            .read_range(&self.namespace, index + 1, commit_index + 1)
            .await?
            .into_iter()
            .map(|(index, payload)| Ok((index, decode(index, &payload)?)))
            .collect()
    }

    async fn commit_index(&self) -> LogIndex {
        self.log.lock().await.commit_index
    }
}
