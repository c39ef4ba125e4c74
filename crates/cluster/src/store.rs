//! Transactional access to the replicated cluster database
//!
//! Every member keeps a local replica of [`ClusterState`]. Reads are served
//! from it directly. Writes run inside [`ClusterStore::transaction`]: the
//! closure works on a private copy of the replica, its reads and buffered
//! mutations become a [`Commit`], and the commit is proposed to the current
//! leader. Only committed entries ever reach a replica, so a failed
//! transaction leaves nothing behind.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use hearth_storage::LogIndex;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::ClusterConfig;
use crate::consensus::{Commit, Consensus};
use crate::error::{ClusterResult, Error};
use crate::member::{ClusterMember, MemberId, Role};
use crate::state::{
    ClusterState, Counter, Instance, InstanceSnapshot, Mutation, Network, NetworkForward,
    NetworkLoadBalancer, OperationRecord, Project, keys,
};

/// Parameters for registering a new member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMember {
    /// Member name
    pub name: String,
    /// `host:port`, empty for standalone
    pub address: String,
    /// Schema version the member runs
    pub schema_version: u32,
    /// Hex SHA-256 certificate fingerprint
    pub certificate_fingerprint: Option<String>,
}

/// Handle passed to a transaction closure.
///
/// Reads are recorded so the log can reject the commit if anything it looked
/// at changed concurrently. Writes are visible to later reads in the same
/// transaction and to nobody else until commit.
pub struct ClusterTx {
    state: ClusterState,
    base_index: LogIndex,
    now: i64,
    reads: BTreeSet<String>,
    mutations: Vec<Mutation>,
}

impl ClusterTx {
    fn new(state: ClusterState, now: i64) -> Self {
        Self {
            base_index: state.applied_index(),
            state,
            now,
            reads: BTreeSet::new(),
            mutations: Vec::new(),
        }
    }

    /// Wall clock time the transaction started at (unix millis)
    pub fn now(&self) -> i64 {
        self.now
    }

    fn read(&mut self, key: String) {
        self.reads.insert(key);
    }

    fn write(&mut self, mutation: Mutation) {
        self.state.apply(&mutation);
        self.mutations.push(mutation);
    }

    fn into_commit(self) -> Commit {
        Commit {
            base_index: self.base_index,
            reads: self.reads,
            mutations: self.mutations,
        }
    }

    fn next_id(&mut self, counter: Counter) -> i64 {
        self.read(keys::counter(counter));
        let value = self.state.counter(counter) + 1;
        self.write(Mutation::SetCounter { counter, value });
        value
    }

    /// All members ordered by name
    pub fn members(&mut self) -> Vec<ClusterMember> {
        self.read(keys::MEMBERS.to_string());
        self.state.members().cloned().collect()
    }

    /// Member by name
    pub fn member(&mut self, name: &str) -> ClusterResult<ClusterMember> {
        self.read(keys::member(name));
        self.state
            .member(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("Cluster member {name:?} not found")))
    }

    /// ID of the member called `name`
    pub fn get_member_id(&mut self, name: &str) -> ClusterResult<MemberId> {
        self.member(name).map(|member| member.id)
    }

    /// Register a member in the `pending` role
    pub fn create_member(&mut self, new: NewMember) -> ClusterResult<ClusterMember> {
        if new.name.is_empty() {
            return Err(Error::invalid_argument("Member name cannot be empty"));
        }

        let members = self.members();
        if members.iter().any(|member| member.name == new.name) {
            return Err(Error::conflict(format!(
                "Cluster member {:?} already exists",
                new.name
            )));
        }
        if !new.address.is_empty() && members.iter().any(|member| member.address == new.address) {
            return Err(Error::conflict(format!(
                "Address {} is already used by another cluster member",
                new.address
            )));
        }

        let member = ClusterMember {
            id: MemberId(self.next_id(Counter::Member)),
            name: new.name,
            address: new.address,
            role: Role::Pending,
            schema_version: new.schema_version,
            joined_at: self.now,
            last_heartbeat: self.now,
            certificate_fingerprint: new.certificate_fingerprint,
        };
        self.write(Mutation::PutMember(member.clone()));

        Ok(member)
    }

    /// Replace an existing member
    pub fn update_member(&mut self, member: ClusterMember) -> ClusterResult<()> {
        let current = self.member(&member.name)?;
        if current.id != member.id {
            return Err(Error::conflict(format!(
                "Cluster member {:?} was replaced concurrently",
                member.name
            )));
        }
        self.write(Mutation::PutMember(member));
        Ok(())
    }

    /// Delete a member
    pub fn delete_member(&mut self, name: &str) -> ClusterResult<ClusterMember> {
        let member = self.member(name)?;
        self.write(Mutation::DeleteMember {
            name: name.to_string(),
        });
        Ok(member)
    }

    /// Names of all projects
    pub fn project_names(&mut self) -> Vec<String> {
        self.read(keys::PROJECTS.to_string());
        self.state.project_names()
    }

    /// Create a project
    pub fn create_project(&mut self, name: &str, description: &str) -> ClusterResult<()> {
        self.read(keys::project(name));
        if self.state.project(name).is_some() {
            return Err(Error::conflict(format!("Project {name:?} already exists")));
        }
        self.write(Mutation::PutProject(Project {
            name: name.to_string(),
            description: description.to_string(),
        }));
        Ok(())
    }

    fn require_project(&mut self, project: &str) -> ClusterResult<()> {
        self.read(keys::project(project));
        if self.state.project(project).is_none() {
            return Err(Error::not_found(format!("Project {project:?} not found")));
        }
        Ok(())
    }

    /// Networks of a project
    pub fn networks(&mut self, project: &str) -> ClusterResult<Vec<Network>> {
        self.require_project(project)?;
        self.read(keys::networks(project));
        Ok(self.state.networks(project).into_iter().cloned().collect())
    }

    /// Network by project and name
    pub fn network(&mut self, project: &str, name: &str) -> ClusterResult<Network> {
        self.read(keys::network(project, name));
        self.state.network(project, name).cloned().ok_or_else(|| {
            Error::not_found(format!(
                "Network {name:?} not found in project {project:?}"
            ))
        })
    }

    /// Create a network
    pub fn create_network(
        &mut self,
        project: &str,
        name: &str,
        config: BTreeMap<String, String>,
    ) -> ClusterResult<Network> {
        self.require_project(project)?;
        self.read(keys::network(project, name));
        if self.state.network(project, name).is_some() {
            return Err(Error::conflict(format!(
                "Network {name:?} already exists in project {project:?}"
            )));
        }

        let network = Network {
            id: self.next_id(Counter::Network),
            project: project.to_string(),
            name: name.to_string(),
            config,
        };
        self.write(Mutation::PutNetwork(network.clone()));
        Ok(network)
    }

    /// Forwards of a network
    pub fn forwards(&mut self, network_id: i64) -> Vec<NetworkForward> {
        self.read(keys::forwards(network_id));
        self.state
            .forwards(network_id)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Create a forward on a network
    pub fn create_forward(&mut self, forward: NetworkForward) -> ClusterResult<()> {
        self.read(keys::forward(forward.network_id, &forward.listen_address));
        if self
            .state
            .forwards(forward.network_id)
            .iter()
            .any(|existing| existing.listen_address == forward.listen_address)
        {
            return Err(Error::conflict(format!(
                "A forward for {} already exists",
                forward.listen_address
            )));
        }
        self.write(Mutation::PutForward(forward));
        Ok(())
    }

    /// Load-balancers of a network
    pub fn load_balancers(&mut self, network_id: i64) -> Vec<NetworkLoadBalancer> {
        self.read(keys::load_balancers(network_id));
        self.state
            .load_balancers(network_id)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Create a load-balancer on a network
    pub fn create_load_balancer(&mut self, lb: NetworkLoadBalancer) -> ClusterResult<()> {
        self.read(keys::load_balancer(lb.network_id, &lb.listen_address));
        if self
            .state
            .load_balancers(lb.network_id)
            .iter()
            .any(|existing| existing.listen_address == lb.listen_address)
        {
            return Err(Error::conflict(format!(
                "A load-balancer for {} already exists",
                lb.listen_address
            )));
        }
        self.write(Mutation::PutLoadBalancer(lb));
        Ok(())
    }

    /// Instance by project and name
    pub fn instance(&mut self, project: &str, name: &str) -> ClusterResult<Instance> {
        self.read(keys::instance(project, name));
        self.state.instance(project, name).cloned().ok_or_else(|| {
            Error::not_found(format!(
                "Instance {name:?} not found in project {project:?}"
            ))
        })
    }

    /// Create an instance record
    pub fn create_instance(&mut self, instance: Instance) -> ClusterResult<()> {
        self.require_project(&instance.project)?;
        self.read(keys::instance(&instance.project, &instance.name));
        if self
            .state
            .instance(&instance.project, &instance.name)
            .is_some()
        {
            return Err(Error::conflict(format!(
                "Instance {:?} already exists",
                instance.name
            )));
        }
        self.write(Mutation::PutInstance(instance));
        Ok(())
    }

    /// Snapshots of an instance
    pub fn snapshots(&mut self, project: &str, instance: &str) -> Vec<InstanceSnapshot> {
        self.read(keys::snapshots(project, instance));
        self.state
            .snapshots(project, instance)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Snapshot by project, instance and name
    pub fn snapshot(
        &mut self,
        project: &str,
        instance: &str,
        name: &str,
    ) -> ClusterResult<InstanceSnapshot> {
        self.read(keys::snapshot(project, instance, name));
        self.state
            .snapshot(project, instance, name)
            .cloned()
            .ok_or_else(|| {
                Error::not_found(format!(
                    "Snapshot {name:?} of instance {instance:?} not found"
                ))
            })
    }

    /// Record a new snapshot
    pub fn create_snapshot(&mut self, snapshot: InstanceSnapshot) -> ClusterResult<()> {
        self.instance(&snapshot.project, &snapshot.instance)?;
        self.read(keys::snapshot(
            &snapshot.project,
            &snapshot.instance,
            &snapshot.name,
        ));
        if self
            .state
            .snapshot(&snapshot.project, &snapshot.instance, &snapshot.name)
            .is_some()
        {
            return Err(Error::conflict(format!(
                "Snapshot {:?} of instance {:?} already exists",
                snapshot.name, snapshot.instance
            )));
        }
        self.write(Mutation::PutSnapshot(snapshot));
        Ok(())
    }

    /// Delete a snapshot
    pub fn delete_snapshot(&mut self, project: &str, instance: &str, name: &str) -> ClusterResult<()> {
        self.snapshot(project, instance, name)?;
        self.write(Mutation::DeleteSnapshot {
            project: project.to_string(),
            instance: instance.to_string(),
            name: name.to_string(),
        });
        Ok(())
    }

    /// Rename a snapshot
    pub fn rename_snapshot(
        &mut self,
        project: &str,
        instance: &str,
        from: &str,
        to: &str,
    ) -> ClusterResult<()> {
        let mut snapshot = self.snapshot(project, instance, from)?;
        self.delete_snapshot(project, instance, from)?;
        snapshot.name = to.to_string();
        self.create_snapshot(snapshot)
    }

    /// Operation record by ID
    pub fn operation(&mut self, id: &str) -> ClusterResult<OperationRecord> {
        self.read(keys::operation(id));
        self.state
            .operation(id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("Operation {id:?} not found")))
    }

    /// All operation records
    pub fn operations(&mut self) -> Vec<OperationRecord> {
        self.read(keys::OPERATIONS.to_string());
        self.state.operations().cloned().collect()
    }

    /// Insert or replace an operation record
    pub fn put_operation(&mut self, record: OperationRecord) {
        self.write(Mutation::PutOperation(record));
    }

    /// Delete an operation record
    pub fn delete_operation(&mut self, id: &str) {
        self.write(Mutation::DeleteOperation { id: id.to_string() });
    }
}

/// Leader-aware transactional access to cluster state
pub struct ClusterStore {
    member_name: String,
    consensus: Arc<dyn Consensus>,
    replica: RwLock<ClusterState>,
    tx_lock: Mutex<()>,
    pub(crate) transaction_timeout: Duration,
    retry_backoff: Duration,
    pub(crate) offline_threshold: Duration,
}

impl ClusterStore {
    /// Create a store for the local member
    pub fn new(config: &ClusterConfig, consensus: Arc<dyn Consensus>) -> Self {
        Self {
            member_name: config.member_name.clone(),
            consensus,
            replica: RwLock::new(ClusterState::default()),
            tx_lock: Mutex::new(()),
            transaction_timeout: config.transaction_timeout,
            retry_backoff: config.retry_backoff,
            offline_threshold: config.offline_threshold,
        }
    }

    /// Name of the local member
    pub fn member_name(&self) -> &str {
        &self.member_name
    }

    /// Default deadline for transactions issued on behalf of the member
    pub fn transaction_timeout(&self) -> Duration {
        self.transaction_timeout
    }

    /// Name of the current leader, if known
    pub async fn leader(&self) -> Option<String> {
        self.consensus.leader().await
    }

    /// Apply committed entries the local replica has not seen yet
    pub async fn catch_up(&self) -> ClusterResult<LogIndex> {
        let applied = self.replica.read().applied_index();
        let entries = self.consensus.entries_since(applied).await?;

        let mut replica = self.replica.write();
        for (index, commit) in entries {
            if index <= replica.applied_index() {
                continue;
            }
            replica.apply_commit(index, &commit.mutations);
        }

        Ok(replica.applied_index())
    }

    /// Read from the local replica, which may lag the leader
    pub fn read<T>(&self, f: impl FnOnce(&ClusterState) -> T) -> T {
        f(&self.replica.read())
    }

    /// Read after catching up with everything the leader has committed
    pub async fn read_consistent<T>(&self, f: impl FnOnce(&ClusterState) -> T) -> ClusterResult<T> {
        if self.consensus.leader().await.is_none() {
            return Err(Error::unavailable(
                "No leader is currently known for a consistent read",
            ));
        }
        self.catch_up().await?;
        Ok(self.read(f))
    }

    /// ID of the member called `name`
    pub fn get_member_id(&self, name: &str) -> ClusterResult<MemberId> {
        self.read(|state| state.member(name).map(|member| member.id))
            .ok_or_else(|| Error::not_found(format!("Cluster member {name:?} not found")))
    }

    /// Run `f` as one atomic transaction against the leader.
    ///
    /// `f` may run more than once when leadership moves; it must not have
    /// side effects outside the handle. Fails with `Unavailable` when no
    /// leader is known and with `Timeout` once `timeout` elapses.
    pub async fn transaction<T, F>(&self, timeout: Duration, mut f: F) -> ClusterResult<T>
    where
        F: FnMut(&mut ClusterTx) -> ClusterResult<T> + Send,
        T: Send,
    {
        let deadline = Instant::now() + timeout;

        let attempts = async {
            let _guard = self.tx_lock.lock().await;
            loop {
                match self.attempt(&mut f).await {
                    Err(e) if e.is_not_leader() => {
                        debug!("Retrying transaction from {}: {}", self.member_name, e);
                        tokio::time::sleep(self.retry_backoff).await;
                    }
                    result => return result,
                }
            }
        };

        match tokio::time::timeout_at(deadline, attempts).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Transaction from {} exceeded its {:?} deadline",
                    self.member_name, timeout
                );
                Err(Error::timeout(format!(
                    "Transaction from member {} did not commit within {:?}",
                    self.member_name, timeout
                )))
            }
        }
    }

    async fn attempt<T, F>(&self, f: &mut F) -> ClusterResult<T>
    where
        F: FnMut(&mut ClusterTx) -> ClusterResult<T> + Send,
        T: Send,
    {
        self.catch_up().await?;

        let snapshot = self.replica.read().clone();
        let mut tx = ClusterTx::new(snapshot, crate::now_millis());
        let value = f(&mut tx)?;

        if tx.mutations.is_empty() {
            return Ok(value);
        }

        let leader = self
            .consensus
            .leader()
            .await
            .ok_or_else(|| Error::unavailable("No leader is currently known"))?;
        self.read(|state| check_write_gate(state, &leader))?;

        let index = self.consensus.propose(&leader, tx.into_commit()).await?;
        debug!("Transaction from {} committed at {}", self.member_name, index);

        self.catch_up().await?;
        Ok(value)
    }
}

/// Writes wait while the leader's schema trails the voter majority.
fn check_write_gate(state: &ClusterState, leader: &str) -> ClusterResult<()> {
    let Some(leader_member) = state.member(leader) else {
        return Ok(());
    };

    let mut versions: Vec<u32> = state
        .members()
        .filter(|member| member.role == Role::Voter)
        .map(|member| member.schema_version)
        .collect();
    if versions.is_empty() {
        return Ok(());
    }
    versions.sort_unstable_by(|a, b| b.cmp(a));

    // Highest version reached by a strict majority of voters
    let majority = versions[versions.len() / 2];
    if leader_member.schema_version < majority {
        return Err(Error::unavailable(format!(
            "Leader {leader} runs schema version {} while the voter majority runs {majority}",
            leader_member.schema_version
        )));
    }

    Ok(())
}
