//! Capability traits for network drivers

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use hearth_cluster::ClusterStore;
use serde::{Deserialize, Serialize};

use crate::error::{NetworkError, NetworkResult};

/// How a lease was handed out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseKind {
    /// Address pinned in the instance configuration
    Static,
    /// Address handed out by DHCP
    Dynamic,
    /// Address of the network gateway
    Gateway,
    /// Address on the uplink side
    Uplink,
}

impl LeaseKind {
    /// Whether the lease belongs to an instance
    pub fn is_instance(self) -> bool {
        matches!(self, Self::Static | Self::Dynamic)
    }
}

impl fmt::Display for LeaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Static => "static",
            Self::Dynamic => "dynamic",
            Self::Gateway => "gateway",
            Self::Uplink => "uplink",
        };
        write!(f, "{s}")
    }
}

/// Address lease reported by a driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Lease kind
    #[serde(rename = "type")]
    pub kind: LeaseKind,
    /// Leased address, without prefix length
    pub address: String,
    /// Name of the consumer
    pub hostname: String,
    /// Hardware address of the consumer
    #[serde(default)]
    pub hwaddr: String,
}

/// Who is asking a driver for state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    /// An API client; drivers may gather state from other members
    #[default]
    Normal,
    /// Another cluster member; drivers answer with local state only
    Cluster,
}

/// A loaded network with live driver state
#[async_trait]
pub trait NetworkDriver: Send + Sync {
    /// Numeric network ID
    fn id(&self) -> i64;

    /// Network name
    fn name(&self) -> &str;

    /// Effective configuration
    fn config(&self) -> BTreeMap<String, String>;

    /// Current leases. Drivers without lease tracking return
    /// [`NetworkError::NotImplemented`].
    async fn leases(&self, project: &str, client_type: ClientType) -> NetworkResult<Vec<Lease>>;
}

/// Loads networks by name
#[async_trait]
pub trait NetworkLoader: Send + Sync {
    /// Load the network `name` of `project`
    async fn load_by_name(&self, project: &str, name: &str)
    -> NetworkResult<Arc<dyn NetworkDriver>>;
}

/// Network backed only by its stored record, without lease tracking
pub struct StoredNetwork {
    record: hearth_cluster::Network,
}

#[async_trait]
impl NetworkDriver for StoredNetwork {
    fn id(&self) -> i64 {
        self.record.id
    }

    fn name(&self) -> &str {
        &self.record.name
    }

    fn config(&self) -> BTreeMap<String, String> {
        self.record.config.clone()
    }

    async fn leases(&self, _project: &str, _client_type: ClientType) -> NetworkResult<Vec<Lease>> {
        Err(NetworkError::NotImplemented)
    }
}

/// Loader returning [`StoredNetwork`]s read from the cluster store
pub struct StoreNetworkLoader {
    store: Arc<ClusterStore>,
}

impl StoreNetworkLoader {
    /// Create a loader over `store`
    pub fn new(store: Arc<ClusterStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl NetworkLoader for StoreNetworkLoader {
    async fn load_by_name(
        &self,
        project: &str,
        name: &str,
    ) -> NetworkResult<Arc<dyn NetworkDriver>> {
        let record = self
            .store
            .transaction(self.store.transaction_timeout(), |tx| {
                tx.network(project, name)
            })
            .await?;

        Ok(Arc::new(StoredNetwork { record }))
    }
}
