//! Mock network drivers for testing and local runs.
#![warn(missing_docs)]
#![warn(clippy::all)]

mod config;
mod error;

use config::Fixture;
pub use error::Error;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use hearth_network::{
    ClientType, Lease, LeaseKind, NetworkDriver, NetworkError, NetworkLoader, NetworkResult,
};
use parking_lot::RwLock;

/// What a mock network answers to lease queries
#[derive(Debug, Clone)]
pub enum LeaseBehavior {
    /// Return these leases
    Leases(Vec<Lease>),
    /// Report lease tracking as unsupported
    NotImplemented,
    /// Fail with a driver error
    Fail(String),
}

/// Mock network driver with scripted configuration and leases.
#[derive(Debug)]
pub struct MockNetwork {
    id: i64,
    name: String,
    config: RwLock<BTreeMap<String, String>>,
    leases: RwLock<LeaseBehavior>,
    lease_queries: AtomicUsize,
}

impl MockNetwork {
    /// Create a network with no configuration and no leases.
    #[must_use]
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            config: RwLock::new(BTreeMap::new()),
            leases: RwLock::new(LeaseBehavior::Leases(Vec::new())),
            lease_queries: AtomicUsize::new(0),
        }
    }

    /// Set a configuration key.
    #[must_use]
    pub fn with_config(self, key: &str, value: &str) -> Self {
        self.config.write().insert(key.to_string(), value.to_string());
        self
    }

    /// Add a lease.
    #[must_use]
    pub fn with_lease(self, kind: LeaseKind, address: &str, hostname: &str, hwaddr: &str) -> Self {
        self.add_lease(Lease {
            kind,
            address: address.to_string(),
            hostname: hostname.to_string(),
            hwaddr: hwaddr.to_string(),
        });
        self
    }

    /// Replace the lease behavior.
    #[must_use]
    pub fn with_leases(self, behavior: LeaseBehavior) -> Self {
        self.set_leases(behavior);
        self
    }

    /// Add a lease to a network already handed out.
    pub fn add_lease(&self, lease: Lease) {
        let mut behavior = self.leases.write();
        match &mut *behavior {
            LeaseBehavior::Leases(leases) => leases.push(lease),
            other => *other = LeaseBehavior::Leases(vec![lease]),
        }
    }

    /// Replace the lease behavior of a network already handed out.
    pub fn set_leases(&self, behavior: LeaseBehavior) {
        *self.leases.write() = behavior;
    }

    /// Number of lease queries answered so far.
    pub fn lease_queries(&self) -> usize {
        self.lease_queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NetworkDriver for MockNetwork {
    fn id(&self) -> i64 {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> BTreeMap<String, String> {
        self.config.read().clone()
    }

    async fn leases(&self, _project: &str, _client_type: ClientType) -> NetworkResult<Vec<Lease>> {
        self.lease_queries.fetch_add(1, Ordering::SeqCst);

        match &*self.leases.read() {
            LeaseBehavior::Leases(leases) => Ok(leases.clone()),
            LeaseBehavior::NotImplemented => Err(NetworkError::NotImplemented),
            LeaseBehavior::Fail(message) => Err(NetworkError::Driver(message.clone())),
        }
    }
}

/// Mock loader handing out [`MockNetwork`]s by project and name.
#[derive(Debug, Clone, Default)]
pub struct MockNetworkLoader {
    networks: Arc<RwLock<HashMap<(String, String), Arc<MockNetwork>>>>,
}

impl MockNetworkLoader {
    /// Create an empty loader.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a network under `project`, returning a handle for later
    /// scripting.
    pub fn insert(&self, project: &str, network: MockNetwork) -> Arc<MockNetwork> {
        let network = Arc::new(network);
        self.networks.write().insert(
            (project.to_string(), network.name.clone()),
            network.clone(),
        );
        network
    }

    /// Create a loader from a JSON fixture file
    ///
    /// # Errors
    ///
    /// Returns an error if the fixture file cannot be read or contains
    /// invalid JSON.
    pub fn from_fixture_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::FixtureFile(format!("Failed to read fixture file: {}", e)))?;

        let fixture: Fixture = serde_json::from_str(&content)
            .map_err(|e| Error::FixtureFile(format!("Failed to parse fixture file: {}", e)))?;

        let loader = Self::new();
        for entry in fixture.networks {
            let behavior = match entry.leases {
                Some(leases) => LeaseBehavior::Leases(leases),
                None => LeaseBehavior::NotImplemented,
            };
            let network = MockNetwork {
                config: RwLock::new(entry.config),
                ..MockNetwork::new(entry.id, entry.name)
            }
            .with_leases(behavior);
            loader.insert(&entry.project, network);
        }

        Ok(loader)
    }
}

#[async_trait]
impl NetworkLoader for MockNetworkLoader {
    async fn load_by_name(
        &self,
        project: &str,
        name: &str,
    ) -> NetworkResult<Arc<dyn NetworkDriver>> {
        self.networks
            .read()
            .get(&(project.to_string(), name.to_string()))
            .cloned()
            .map(|network| network as Arc<dyn NetworkDriver>)
            .ok_or_else(|| NetworkError::NotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[tokio::test]
    async fn test_mock_network_scripts_leases() {
        let loader = MockNetworkLoader::new();
        let network = loader.insert(
            "default",
            MockNetwork::new(1, "lxdbr0")
                .with_config("ipv4.address", "10.0.0.1/24")
                .with_lease(LeaseKind::Static, "10.0.0.5", "web1", "00:16:3e:00:00:01"),
        );

        let driver = loader.load_by_name("default", "lxdbr0").await.unwrap();
        assert_eq!(driver.id(), 1);
        assert_eq!(driver.config()["ipv4.address"], "10.0.0.1/24");
        let leases = driver.leases("default", ClientType::Normal).await.unwrap();
        assert_eq!(leases[0].hostname, "web1");

        network.set_leases(LeaseBehavior::NotImplemented);
        let err = driver
            .leases("default", ClientType::Normal)
            .await
            .unwrap_err();
        assert!(err.is_not_implemented());
        assert_eq!(network.lease_queries(), 2);

        let err = loader.load_by_name("other", "lxdbr0").await.err().unwrap();
        assert!(matches!(err, NetworkError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_loader_from_fixture_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"networks": [
                {{"name": "lxdbr0", "id": 1, "config": {{"ipv4.address": "10.0.0.1/24"}},
                  "leases": [{{"type": "dynamic", "address": "10.0.0.9", "hostname": "db1"}}]}},
                {{"project": "blue", "name": "ovn0", "id": 2}}
            ]}}"#
        )
        .unwrap();

        let loader = MockNetworkLoader::from_fixture_file(file.path()).unwrap();
        let lxdbr0 = loader.load_by_name("default", "lxdbr0").await.unwrap();
        let leases = lxdbr0.leases("default", ClientType::Normal).await.unwrap();
        assert_eq!(leases[0].kind, LeaseKind::Dynamic);
        assert_eq!(leases[0].hwaddr, "");

        let ovn0 = loader.load_by_name("blue", "ovn0").await.unwrap();
        assert!(
            ovn0.leases("blue", ClientType::Normal)
                .await
                .unwrap_err()
                .is_not_implemented()
        );

        assert!(MockNetworkLoader::from_fixture_file(file.path().with_extension("missing")).is_err());
    }
}
