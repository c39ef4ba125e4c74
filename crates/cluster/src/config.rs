use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ClusterResult, Error};

/// Schema version of this build
pub const SCHEMA_VERSION: u32 = 1;

/// Target band for consensus roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleConfig {
    /// Fewest voters the cluster may run with once it has reached the band
    pub min_voters: usize,
    /// Most voters the cluster may run with
    pub max_voters: usize,
    /// Most stand-by members
    pub max_standby: usize,
}

impl Default for RoleConfig {
    fn default() -> Self {
        Self {
            min_voters: 3,
            max_voters: 5,
            max_standby: 2,
        }
    }
}

impl RoleConfig {
    /// Check the band is usable
    pub fn validate(&self) -> ClusterResult<()> {
        if self.min_voters == 0 || self.min_voters > self.max_voters {
            return Err(Error::invalid_argument(format!(
                "Invalid voter band {}..={}",
                self.min_voters, self.max_voters
            )));
        }
        Ok(())
    }
}

/// Cluster member configuration
#[derive(Debug, Clone)]
pub struct ClusterConfig {
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

    /// Deadline applied to transactions issued by background tasks
    pub transaction_timeout: Duration,

    /// Pause between retries after a leader change
    pub retry_backoff: Duration,

    /// How often the local member records a heartbeat
    pub heartbeat_interval: Duration,

    /// Members without a heartbeat for this long are reported offline
    pub offline_threshold: Duration,

    /// Members without a heartbeat for this long are evicted
    pub eviction_threshold: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            member_name: "none".to_string(),
            address: String::new(),
            data_dir: PathBuf::from("/var/lib/hearth/database"),
            certificate_fingerprint: None,
            roles: RoleConfig::default(),
            transaction_timeout: Duration::from_secs(10),
            retry_backoff: Duration::from_millis(50),
            heartbeat_interval: Duration::from_secs(10),
            offline_threshold: Duration::from_secs(20),
            eviction_threshold: Duration::from_secs(300),
        }
    }
}
