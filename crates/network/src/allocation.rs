//! Computed ledger of addresses in use across projects and networks

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tracing::debug;

use hearth_cluster::api::{api_url, is_true_opt};

use crate::directory::NetworkDirectory;
use crate::driver::{ClientType, NetworkLoader};
use crate::error::{NetworkError, NetworkResult};

/// Consumer of an allocated address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AllocationType {
    /// The network's own address
    Network,
    /// An instance lease
    Instance,
    /// A network forward listen address
    NetworkForward,
    /// A network load-balancer listen address
    NetworkLoadBalancer,
}

impl fmt::Display for AllocationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Network => "network",
            Self::Instance => "instance",
            Self::NetworkForward => "network-forward",
            Self::NetworkLoadBalancer => "network-load-balancer",
        };
        write!(f, "{s}")
    }
}

/// One (address, consumer) pair
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NetworkAllocation {
    /// Address in host CIDR form (/32 or /128)
    pub address: String,
    /// URL of the consumer
    pub used_by: String,
    /// Consumer type
    #[serde(rename = "type")]
    pub kind: AllocationType,
    /// Hardware address, instances only
    #[serde(default)]
    pub hwaddr: String,
    /// Whether source NAT applies to the address
    pub nat: bool,
}

/// Which projects to compute allocations for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationFilter {
    /// Project used when `all_projects` is false
    pub project: String,
    /// Walk every project known to the cluster
    pub all_projects: bool,
}

impl Default for AllocationFilter {
    fn default() -> Self {
        Self {
            project: hearth_cluster::DEFAULT_PROJECT.to_string(),
            all_projects: false,
        }
    }
}

impl AllocationFilter {
    /// Filter for a single project
    pub fn project(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            all_projects: false,
        }
    }

    /// Filter spanning every project
    pub fn all_projects() -> Self {
        Self {
            all_projects: true,
            ..Default::default()
        }
    }
}

/// Convert an address to host CIDR form and report whether the network
/// applies NAT to its family.
fn ip_to_cidr(address: &str, config: &BTreeMap<String, String>) -> NetworkResult<(String, bool)> {
    let ip: IpAddr = address
        .parse()
        .map_err(|_| NetworkError::InvalidAddress(address.to_string()))?;

    Ok(match ip.to_canonical() {
        IpAddr::V4(v4) => (format!("{v4}/32"), is_true_opt(config.get("ipv4.nat"))),
        IpAddr::V6(v6) => (format!("{v6}/128"), is_true_opt(config.get("ipv6.nat"))),
    })
}

/// Merges network, lease, forward and load-balancer addresses into one list
pub struct AllocationAggregator {
    directory: Arc<dyn NetworkDirectory>,
    loader: Arc<dyn NetworkLoader>,
}

impl AllocationAggregator {
    /// Create an aggregator reading names from `directory` and live state
    /// from networks loaded through `loader`.
    pub fn new(directory: Arc<dyn NetworkDirectory>, loader: Arc<dyn NetworkLoader>) -> Self {
        Self { directory, loader }
    }

    /// Compute the allocations for the projects selected by `filter`.
    ///
    /// The first failure aborts the whole computation; no partial list is
    /// ever returned.
    pub async fn compute(&self, filter: &AllocationFilter) -> NetworkResult<Vec<NetworkAllocation>> {
        let projects = if filter.all_projects {
            self.directory
                .project_names()
                .await
                .map_err(|e| e.context("Failed loading projects"))?
        } else {
            vec![filter.project.clone()]
        };

        let mut result = Vec::new();
        for project in &projects {
            let networks = self
                .directory
                .network_names(project)
                .await
                .map_err(|e| e.context(format!("Failed loading networks in project {project:?}")))?;

            for network in &networks {
                self.network_allocations(project, network, &mut result)
                    .await?;
            }
        }

        debug!(
            "Computed {} allocations across {} projects",
            result.len(),
            projects.len()
        );
        Ok(result)
    }

    async fn network_allocations(
        &self,
        project: &str,
        network: &str,
        result: &mut Vec<NetworkAllocation>,
    ) -> NetworkResult<()> {
        let subject = format!("network {network:?} in project {project:?}");

        let driver = self
            .loader
            .load_by_name(project, network)
            .await
            .map_err(|e| e.context(format!("Failed loading {subject}")))?;
        let config = driver.config();
        let network_url = api_url(&["networks", network], project);

        for family in ["ipv4", "ipv6"] {
            // "none", "auto" and unset all mean no own address
            let Some(own) = config
                .get(&format!("{family}.address"))
                .and_then(|value| value.parse::<IpNet>().ok())
            else {
                continue;
            };

            let host = IpNet::new(own.addr(), own.max_prefix_len())
                .map_err(|_| NetworkError::InvalidAddress(own.to_string()))?;
            result.push(NetworkAllocation {
                address: host.to_string(),
                used_by: network_url.clone(),
                kind: AllocationType::Network,
                hwaddr: String::new(),
                nat: is_true_opt(config.get(&format!("{family}.nat"))),
            });
        }

        let leases = match driver.leases(project, ClientType::Normal).await {
            Ok(leases) => leases,
            Err(e) if e.is_not_implemented() => {
                debug!("Network {} does not report leases", network);
                Vec::new()
            }
            Err(e) => return Err(e.context(format!("Failed getting leases for {subject}"))),
        };

        // Drivers may report one instance address under several lease kinds
        let mut seen = BTreeSet::new();
        for lease in leases.iter().filter(|lease| lease.kind.is_instance()) {
            let (address, nat) = ip_to_cidr(&lease.address, &config)
                .map_err(|e| e.context(format!("Invalid lease on {subject}")))?;
            let used_by = api_url(&["instances", &lease.hostname], project);
            if !seen.insert((address.clone(), used_by.clone())) {
                debug!("Skipping repeated {} lease {} on {}", lease.kind, address, subject);
                continue;
            }

            result.push(NetworkAllocation {
                address,
                used_by,
                kind: AllocationType::Instance,
                hwaddr: lease.hwaddr.clone(),
                nat,
            });
        }

        let forwards = self
            .directory
            .forward_addresses(driver.id())
            .await
            .map_err(|e| e.context(format!("Failed getting forwards for {subject}")))?;
        for listen in &forwards {
            let (address, _) = ip_to_cidr(listen, &config)
                .map_err(|e| e.context(format!("Invalid forward on {subject}")))?;
            result.push(NetworkAllocation {
                address,
                used_by: api_url(&["networks", network, "forwards", listen], project),
                kind: AllocationType::NetworkForward,
                hwaddr: String::new(),
                nat: false,
            });
        }

        let load_balancers = self
            .directory
            .load_balancer_addresses(driver.id())
            .await
            .map_err(|e| e.context(format!("Failed getting load-balancers for {subject}")))?;
        for listen in &load_balancers {
            let (address, _) = ip_to_cidr(listen, &config)
                .map_err(|e| e.context(format!("Invalid load-balancer on {subject}")))?;
            result.push(NetworkAllocation {
                address,
                used_by: api_url(&["networks", network, "load-balancers", listen], project),
                kind: AllocationType::NetworkLoadBalancer,
                hwaddr: String::new(),
                nat: false,
            });
        }

        Ok(())
    }
}
