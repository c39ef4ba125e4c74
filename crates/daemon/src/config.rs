//! Daemon configuration loaded from TOML

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hearth_cluster::{ClusterConfig, RoleConfig, join::DEFAULT_PORT};
use hearth_operations::OperationsConfig;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Cluster section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    /// Name of the local member
    pub member_name: String,

    /// Address other members reach this one on; empty for standalone
    pub address: String,

    /// Directory holding local database state
    pub data_dir: PathBuf,

    /// Hex SHA-256 fingerprint of the local certificate
    pub certificate_fingerprint: Option<String>,

    /// Consensus role band
    pub roles: RoleConfig,

    /// Deadline for transactions issued by the daemon
    pub transaction_timeout_ms: u64,

    /// Pause between retries after a leader change
    pub retry_backoff_ms: u64,

    /// Heartbeat period
    pub heartbeat_interval_secs: u64,

    /// Members silent for longer are reported offline
    pub offline_threshold_secs: u64,

    /// Members silent for longer are evicted
    pub eviction_threshold_secs: u64,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            member_name: "none".to_string(),
            address: String::new(),
            data_dir: PathBuf::from("/var/lib/hearth/database"),
            certificate_fingerprint: None,
            roles: RoleConfig::default(),
            transaction_timeout_ms: 10_000,
            retry_backoff_ms: 50,
            heartbeat_interval_secs: 10,
            offline_threshold_secs: 20,
            eviction_threshold_secs: 300,
        }
    }
}

/// Operations section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationsSection {
    /// How long terminal operations remain queryable
    pub retention_secs: u64,

    /// Reaper period
    pub reap_interval_ms: u64,
}

impl Default for OperationsSection {
    fn default() -> Self {
        Self {
            retention_secs: 5,
            reap_interval_ms: 1_000,
        }
    }
}

/// HTTP section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSection {
    /// Address the API listens on
    pub listen_addr: SocketAddr,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
        }
    }
}

/// Network section
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    /// JSON file describing network driver state; without it networks
    /// report only their stored configuration
    pub fixture: Option<PathBuf>,
}

/// Complete daemon configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Cluster membership and store
    pub cluster: ClusterSection,
    /// Operation engine
    pub operations: OperationsSection,
    /// HTTP API
    pub http: HttpSection,
    /// Network drivers
    pub network: NetworkSection,
}

impl DaemonConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| Error::Config(format!("Failed to parse config: {e}")))
    }

    /// Cluster configuration for the store and registry
    pub fn cluster_config(&self) -> ClusterConfig {
        let section = &self.cluster;
        ClusterConfig {
            member_name: section.member_name.clone(),
            address: section.address.clone(),
            data_dir: section.data_dir.clone(),
            certificate_fingerprint: section.certificate_fingerprint.clone(),
            roles: section.roles,
            transaction_timeout: Duration::from_millis(section.transaction_timeout_ms),
            retry_backoff: Duration::from_millis(section.retry_backoff_ms),
            heartbeat_interval: Duration::from_secs(section.heartbeat_interval_secs),
            offline_threshold: Duration::from_secs(section.offline_threshold_secs),
            eviction_threshold: Duration::from_secs(section.eviction_threshold_secs),
        }
    }

    /// Operation engine configuration; operations are owned by the local member
    pub fn operations_config(&self) -> OperationsConfig {
        OperationsConfig {
            location: self.cluster.member_name.clone(),
            retention: Duration::from_secs(self.operations.retention_secs),
            reap_interval: Duration::from_millis(self.operations.reap_interval_ms),
        }
    }
}
