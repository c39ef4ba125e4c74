//! Replicated cluster state
//!
//! [`ClusterState`] is the state machine every member rebuilds by applying
//! committed log entries in index order. Each [`Mutation`] names the record
//! keys it touches; the log uses those keys to detect conflicting commits.

use std::collections::BTreeMap;

use hearth_operations::{OperationClass, OperationStatus};
use hearth_storage::LogIndex;
use serde::{Deserialize, Serialize};

use crate::member::{ClusterMember, MemberId};

/// Name of the project every installation starts with
pub const DEFAULT_PROJECT: &str = "default";

/// A project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    /// Project name
    pub name: String,
    /// Free-form description
    #[serde(default)]
    pub description: String,
}

/// A managed network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    /// Numeric ID, unique across projects
    pub id: i64,
    /// Owning project
    pub project: String,
    /// Network name, unique within the project
    pub name: String,
    /// Stored configuration (`ipv4.address`, `ipv4.nat`, ...)
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

/// An ingress forward bound to a listen address of a network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkForward {
    /// Network the forward belongs to
    pub network_id: i64,
    /// Listen address
    pub listen_address: String,
    /// Free-form description
    #[serde(default)]
    pub description: String,
}

/// A load-balancer bound to a listen address of a network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkLoadBalancer {
    /// Network the load-balancer belongs to
    pub network_id: i64,
    /// Listen address
    pub listen_address: String,
    /// Free-form description
    #[serde(default)]
    pub description: String,
}

/// An instance record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Owning project
    pub project: String,
    /// Instance name
    pub name: String,
    /// Name of the member hosting the instance
    pub location: String,
}

/// A snapshot of an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    /// Owning project
    pub project: String,
    /// Instance the snapshot belongs to
    pub instance: String,
    /// Snapshot name, unique per instance
    pub name: String,
    /// Whether runtime state was captured
    pub stateful: bool,
    /// Creation time (unix millis)
    pub created_at: i64,
    /// Expiry time (unix millis), if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

/// Cluster-wide record of an operation and the member driving it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    /// Operation ID
    pub id: String,
    /// Member that owns the operation
    pub member_id: MemberId,
    /// Operation class
    pub class: OperationClass,
    /// Type tag
    pub description: String,
    /// Last status published by the owner
    pub status: OperationStatus,
}

/// Replicated ID counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Counter {
    /// Member IDs
    Member,
    /// Network IDs
    Network,
}

/// A single change to the replicated state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    /// Insert or replace a member
    PutMember(ClusterMember),
    /// Delete a member by name
    DeleteMember {
        /// Member name
        name: String,
    },
    /// Insert or replace a project
    PutProject(Project),
    /// Insert or replace a network
    PutNetwork(Network),
    /// Delete a network
    DeleteNetwork {
        /// Owning project
        project: String,
        /// Network name
        name: String,
    },
    /// Insert or replace a network forward
    PutForward(NetworkForward),
    /// Insert or replace a network load-balancer
    PutLoadBalancer(NetworkLoadBalancer),
    /// Insert or replace an instance
    PutInstance(Instance),
    /// Insert or replace an instance snapshot
    PutSnapshot(InstanceSnapshot),
    /// Delete an instance snapshot
    DeleteSnapshot {
        /// Owning project
        project: String,
        /// Instance name
        instance: String,
        /// Snapshot name
        name: String,
    },
    /// Insert or replace an operation record
    PutOperation(OperationRecord),
    /// Delete an operation record
    DeleteOperation {
        /// Operation ID
        id: String,
    },
    /// Set a counter to a new value
    SetCounter {
        /// Counter being advanced
        counter: Counter,
        /// New value
        value: i64,
    },
}

/// Record and table keys used for conflict detection
pub(crate) mod keys {
    use super::Counter;

    pub const MEMBERS: &str = "members";
    pub const PROJECTS: &str = "projects";
    pub const OPERATIONS: &str = "operations";

    pub fn member(name: &str) -> String {
        format!("members/{name}")
    }

    pub fn project(name: &str) -> String {
        format!("projects/{name}")
    }

    pub fn networks(project: &str) -> String {
        format!("networks/{project}")
    }

    pub fn network(project: &str, name: &str) -> String {
        format!("networks/{project}/{name}")
    }

    pub fn forwards(network_id: i64) -> String {
        format!("forwards/{network_id}")
    }

    pub fn forward(network_id: i64, listen_address: &str) -> String {
        format!("forwards/{network_id}/{listen_address}")
    }

    pub fn load_balancers(network_id: i64) -> String {
        format!("load-balancers/{network_id}")
    }

    pub fn load_balancer(network_id: i64, listen_address: &str) -> String {
        format!("load-balancers/{network_id}/{listen_address}")
    }

    pub fn instances(project: &str) -> String {
        format!("instances/{project}")
    }

    pub fn instance(project: &str, name: &str) -> String {
        format!("instances/{project}/{name}")
    }

    pub fn snapshots(project: &str, instance: &str) -> String {
        format!("snapshots/{project}/{instance}")
    }

    pub fn snapshot(project: &str, instance: &str, name: &str) -> String {
        format!("snapshots/{project}/{instance}/{name}")
    }

    pub fn operation(id: &str) -> String {
        format!("operations/{id}")
    }

    pub fn counter(counter: Counter) -> String {
        match counter {
            Counter::Member => "counters/member".to_string(),
            Counter::Network => "counters/network".to_string(),
        }
    }
}

impl Mutation {
    /// Keys written by this mutation: the record itself and its table
    pub fn keys(&self) -> Vec<String> {
        match self {
            Self::PutMember(member) => vec![keys::member(&member.name), keys::MEMBERS.to_string()],
            Self::DeleteMember { name } => vec![keys::member(name), keys::MEMBERS.to_string()],
            Self::PutProject(project) => {
                vec![keys::project(&project.name), keys::PROJECTS.to_string()]
            }
            Self::PutNetwork(network) => vec![
                keys::network(&network.project, &network.name),
                keys::networks(&network.project),
            ],
            Self::DeleteNetwork { project, name } => {
                vec![keys::network(project, name), keys::networks(project)]
            }
            Self::PutForward(forward) => vec![
                keys::forward(forward.network_id, &forward.listen_address),
                keys::forwards(forward.network_id),
            ],
            Self::PutLoadBalancer(lb) => vec![
                keys::load_balancer(lb.network_id, &lb.listen_address),
                keys::load_balancers(lb.network_id),
            ],
            Self::PutInstance(instance) => vec![
                keys::instance(&instance.project, &instance.name),
                keys::instances(&instance.project),
            ],
            Self::PutSnapshot(snapshot) => vec![
                keys::snapshot(&snapshot.project, &snapshot.instance, &snapshot.name),
                keys::snapshots(&snapshot.project, &snapshot.instance),
            ],
            Self::DeleteSnapshot {
                project,
                instance,
                name,
            } => vec![
                keys::snapshot(project, instance, name),
                keys::snapshots(project, instance),
            ],
            Self::PutOperation(record) => {
                vec![keys::operation(&record.id), keys::OPERATIONS.to_string()]
            }
            Self::DeleteOperation { id } => {
                vec![keys::operation(id), keys::OPERATIONS.to_string()]
            }
            Self::SetCounter { counter, .. } => vec![keys::counter(*counter)],
        }
    }
}

/// Typed view of the replicated cluster database
#[derive(Debug, Clone, Default)]
pub struct ClusterState {
    members: BTreeMap<String, ClusterMember>,
    projects: BTreeMap<String, Project>,
    networks: BTreeMap<(String, String), Network>,
    forwards: BTreeMap<(i64, String), NetworkForward>,
    load_balancers: BTreeMap<(i64, String), NetworkLoadBalancer>,
    instances: BTreeMap<(String, String), Instance>,
    snapshots: BTreeMap<(String, String, String), InstanceSnapshot>,
    operations: BTreeMap<String, OperationRecord>,
    counters: BTreeMap<Counter, i64>,
    applied_index: LogIndex,
}

impl ClusterState {
    /// Index of the last applied log entry
    pub fn applied_index(&self) -> LogIndex {
        self.applied_index
    }

    /// All members ordered by name
    pub fn members(&self) -> impl Iterator<Item = &ClusterMember> {
        self.members.values()
    }

    /// Member by name
    pub fn member(&self, name: &str) -> Option<&ClusterMember> {
        self.members.get(name)
    }

    /// Member by ID
    pub fn member_by_id(&self, id: MemberId) -> Option<&ClusterMember> {
        self.members.values().find(|member| member.id == id)
    }

    /// Names of all projects, sorted
    pub fn project_names(&self) -> Vec<String> {
        self.projects.keys().cloned().collect()
    }

    /// Project by name
    pub fn project(&self, name: &str) -> Option<&Project> {
        self.projects.get(name)
    }

    /// Networks of a project, sorted by name
    pub fn networks(&self, project: &str) -> Vec<&Network> {
        self.networks
            .values()
            .filter(|network| network.project == project)
            .collect()
    }

    /// Network by project and name
    pub fn network(&self, project: &str, name: &str) -> Option<&Network> {
        self.networks.get(&(project.to_string(), name.to_string()))
    }

    /// Forwards of a network, sorted by listen address
    pub fn forwards(&self, network_id: i64) -> Vec<&NetworkForward> {
        self.forwards
            .values()
            .filter(|forward| forward.network_id == network_id)
            .collect()
    }

    /// Load-balancers of a network, sorted by listen address
    pub fn load_balancers(&self, network_id: i64) -> Vec<&NetworkLoadBalancer> {
        self.load_balancers
            .values()
            .filter(|lb| lb.network_id == network_id)
            .collect()
    }

    /// Instance by project and name
    pub fn instance(&self, project: &str, name: &str) -> Option<&Instance> {
        self.instances.get(&(project.to_string(), name.to_string()))
    }

    /// Snapshots of an instance, sorted by name
    pub fn snapshots(&self, project: &str, instance: &str) -> Vec<&InstanceSnapshot> {
        self.snapshots
            .values()
            .filter(|snapshot| snapshot.project == project && snapshot.instance == instance)
            .collect()
    }

    /// Snapshot by project, instance and name
    pub fn snapshot(&self, project: &str, instance: &str, name: &str) -> Option<&InstanceSnapshot> {
        self.snapshots
            .get(&(project.to_string(), instance.to_string(), name.to_string()))
    }

    /// Operation record by ID
    pub fn operation(&self, id: &str) -> Option<&OperationRecord> {
        self.operations.get(id)
    }

    /// All operation records
    pub fn operations(&self) -> impl Iterator<Item = &OperationRecord> {
        self.operations.values()
    }

    /// Current value of a counter
    pub fn counter(&self, counter: Counter) -> i64 {
        self.counters.get(&counter).copied().unwrap_or(0)
    }

    /// Apply a committed batch of mutations
    pub(crate) fn apply_commit(&mut self, index: LogIndex, mutations: &[Mutation]) {
        for mutation in mutations {
            self.apply(mutation);
        }
        self.applied_index = index;
    }

    pub(crate) fn apply(&mut self, mutation: &Mutation) {
        match mutation.clone() {
            Mutation::PutMember(member) => {
                self.members.insert(member.name.clone(), member);
            }
            Mutation::DeleteMember { name } => {
                self.members.remove(&name);
            }
            Mutation::PutProject(project) => {
                self.projects.insert(project.name.clone(), project);
            }
            Mutation::PutNetwork(network) => {
                self.networks
                    .insert((network.project.clone(), network.name.clone()), network);
            }
            Mutation::DeleteNetwork { project, name } => {
                if let Some(network) = self.networks.remove(&(project, name)) {
                    self.forwards.retain(|(id, _), _| *id != network.id);
                    self.load_balancers.retain(|(id, _), _| *id != network.id);
                }
            }
            Mutation::PutForward(forward) => {
                self.forwards.insert(
                    (forward.network_id, forward.listen_address.clone()),
                    forward,
                );
            }
            Mutation::PutLoadBalancer(lb) => {
                self.load_balancers
                    .insert((lb.network_id, lb.listen_address.clone()), lb);
            }
            Mutation::PutInstance(instance) => {
                self.instances
                    .insert((instance.project.clone(), instance.name.clone()), instance);
            }
            Mutation::PutSnapshot(snapshot) => {
                self.snapshots.insert(
                    (
                        snapshot.project.clone(),
                        snapshot.instance.clone(),
                        snapshot.name.clone(),
                    ),
                    snapshot,
                );
            }
            Mutation::DeleteSnapshot {
                project,
                instance,
                name,
            } => {
                self.snapshots.remove(&(project, instance, name));
            }
            Mutation::PutOperation(record) => {
                self.operations.insert(record.id.clone(), record);
            }
            Mutation::DeleteOperation { id } => {
                self.operations.remove(&id);
            }
            Mutation::SetCounter { counter, value } => {
                self.counters.insert(counter, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutation_wire_format() {
        let mutation = Mutation::DeleteSnapshot {
            project: "default".to_string(),
            instance: "web1".to_string(),
            name: "snap0".to_string(),
        };
        let json = serde_json::to_value(&mutation).unwrap();
        assert_eq!(json["op"], "delete_snapshot");
        assert_eq!(
            mutation.keys(),
            vec![
                "snapshots/default/web1/snap0".to_string(),
                "snapshots/default/web1".to_string()
            ]
        );
    }

    #[test]
    fn test_delete_network_drops_its_forwards() {
        let mut state = ClusterState::default();
        state.apply(&Mutation::PutNetwork(Network {
            id: 1,
            project: DEFAULT_PROJECT.to_string(),
            name: "lxdbr0".to_string(),
            config: BTreeMap::new(),
        }));
        state.apply(&Mutation::PutForward(NetworkForward {
            network_id: 1,
            listen_address: "192.0.2.10".to_string(),
            description: String::new(),
        }));
        assert_eq!(state.forwards(1).len(), 1);

        state.apply_commit(
            7,
            &[Mutation::DeleteNetwork {
                project: DEFAULT_PROJECT.to_string(),
                name: "lxdbr0".to_string(),
            }],
        );
        assert!(state.forwards(1).is_empty());
        assert_eq!(state.applied_index(), 7);
    }
}
