//! Cluster member model

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Address reported for a member that is not exposed to the network
pub const STANDALONE_ADDRESS: &str = "1";

/// Stable numeric member ID, assigned once and never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberId(pub i64);

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role of a member in the consensus group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    /// Votes in the log and may lead
    Voter,
    /// Holds a replica without voting
    StandBy,
    /// Holds no replica; eligible for promotion
    Spare,
    /// Registered, role not yet assigned
    Pending,
}

impl Role {
    /// Whether the member takes part in the consensus group
    pub fn in_consensus_group(self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Promotion order: lower ranks are promoted first
    pub(crate) fn promotion_rank(self) -> u8 {
        match self {
            Self::Voter => 0,
            Self::StandBy => 1,
            Self::Spare => 2,
            Self::Pending => 3,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Voter => "voter",
            Self::StandBy => "stand-by",
            Self::Spare => "spare",
            Self::Pending => "pending",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "voter" => Ok(Self::Voter),
            "stand-by" => Ok(Self::StandBy),
            "spare" => Ok(Self::Spare),
            "pending" => Ok(Self::Pending),
            other => Err(Error::invalid_argument(format!("Unknown role {other:?}"))),
        }
    }
}

/// A member of the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMember {
    /// Member ID
    pub id: MemberId,
    /// Human readable name, unique in the cluster
    pub name: String,
    /// `host:port`, empty for a standalone member
    pub address: String,
    /// Current role
    pub role: Role,
    /// Database schema version the member runs
    pub schema_version: u32,
    /// When the member joined (unix millis)
    pub joined_at: i64,
    /// Last heartbeat seen (unix millis)
    pub last_heartbeat: i64,
    /// Hex SHA-256 fingerprint of the member certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_fingerprint: Option<String>,
}

impl ClusterMember {
    /// Set the role
    pub fn set_role(&mut self, role: Role) {
        self.role = role;
    }

    /// Set the network address; empty marks the member standalone
    pub fn set_address(&mut self, address: impl Into<String>) {
        self.address = address.into();
    }

    /// Record an upgraded schema version. Versions never go backwards.
    pub fn set_schema_version(&mut self, version: u32) -> Result<(), Error> {
        if version < self.schema_version {
            return Err(Error::invalid_argument(format!(
                "Schema version of member {} cannot go from {} to {}",
                self.name, self.schema_version, version
            )));
        }
        self.schema_version = version;
        Ok(())
    }

    /// Set the certificate fingerprint
    pub fn set_certificate_fingerprint(&mut self, fingerprint: Option<String>) {
        self.certificate_fingerprint = fingerprint;
    }

    /// Whether the member has no network address
    pub fn is_standalone(&self) -> bool {
        self.address.is_empty()
    }

    /// Whether a heartbeat was seen within `threshold` of `now` (unix millis)
    pub fn is_online(&self, now: i64, threshold: Duration) -> bool {
        let threshold = i64::try_from(threshold.as_millis()).unwrap_or(i64::MAX);
        now.saturating_sub(self.last_heartbeat) <= threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member() -> ClusterMember {
        ClusterMember {
            id: MemberId(1),
            name: "node1".to_string(),
            address: "10.0.0.1:8443".to_string(),
            role: Role::Voter,
            schema_version: 3,
            joined_at: 0,
            last_heartbeat: 10_000,
            certificate_fingerprint: None,
        }
    }

    #[test]
    fn test_role_round_trips_through_api_names() {
        for role in [Role::Voter, Role::StandBy, Role::Spare, Role::Pending] {
            assert_eq!(role.to_string().parse::<Role>().unwrap(), role);
        }
        assert_eq!(serde_json::to_string(&Role::StandBy).unwrap(), "\"stand-by\"");
        assert!("leader".parse::<Role>().is_err());
    }

    #[test]
    fn test_schema_version_is_monotonic() {
        let mut member = member();
        member.set_schema_version(4).unwrap();
        assert!(member.set_schema_version(2).is_err());
        assert_eq!(member.schema_version, 4);
    }

    #[test]
    fn test_is_online() {
        let member = member();
        assert!(member.is_online(15_000, Duration::from_secs(5)));
        assert!(!member.is_online(15_001, Duration::from_secs(5)));
    }
}
