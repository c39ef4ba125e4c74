use std::collections::BTreeMap;

use hearth_network::Lease;
use serde::Deserialize;

/// Network definition in the fixture file
#[derive(Debug, Deserialize)]
pub struct FixtureNetwork {
    #[serde(default = "default_project")]
    pub project: String,
    pub name: String,
    pub id: i64,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    /// Absent means the driver does not track leases
    pub leases: Option<Vec<Lease>>,
}

/// Fixture file
#[derive(Debug, Deserialize)]
pub struct Fixture {
    pub networks: Vec<FixtureNetwork>,
}

fn default_project() -> String {
    "default".to_string()
}
