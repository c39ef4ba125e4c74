//! Cluster membership and role assignment
//!
//! Roles are computed by one deterministic policy ([`plan_roles`]) that every
//! membership change runs through: join, removal, eviction and explicit
//! rebalancing. The policy keeps the voter count inside the configured band,
//! promotes the longest-tenured stand-by first and never demotes the leader.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{ClusterConfig, RoleConfig};
use crate::error::{ClusterResult, Error, ErrorKind};
use crate::member::{ClusterMember, MemberId, Role, STANDALONE_ADDRESS};
use crate::state::DEFAULT_PROJECT;
use crate::store::{ClusterStore, ClusterTx, NewMember};

/// A role change made by a rebalance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleChange {
    /// Member name
    pub name: String,
    /// Role before
    pub from: Role,
    /// Role after
    pub to: Role,
}

/// Result of activating the local member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activation {
    /// Member ID
    pub id: MemberId,
    /// Resolved address
    pub address: String,
    /// Role the member starts with
    pub role: Role,
}

/// Outcome of an eviction pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Eviction {
    /// Members removed
    pub evicted: Vec<String>,
    /// Unreachable members kept because removing them would break the band
    pub retained: Vec<String>,
}

/// Address to use for a member. A standalone member has no stored address
/// and gets the standalone sentinel.
pub fn resolve_address(member: &ClusterMember) -> String {
    if member.address.is_empty() {
        STANDALONE_ADDRESS.to_string()
    } else {
        member.address.clone()
    }
}

/// Compute the role every member should hold.
///
/// The voter target is the member count capped at `max_voters`, kept odd
/// once it exceeds `min_voters`. Existing voters keep their seats unless the
/// target shrinks, in which case the newest non-leader voters step down.
/// Open seats go to stand-bys, then spares, then pending members, oldest
/// first. Up to `max_standby` of the rest become stand-by, the others spare.
pub fn plan_roles(
    members: &[ClusterMember],
    leader: Option<&str>,
    config: &RoleConfig,
) -> BTreeMap<String, Role> {
    let mut ordered: Vec<&ClusterMember> = members.iter().collect();
    ordered.sort_by_key(|member| (member.joined_at, member.id));

    let mut target = ordered.len().min(config.max_voters);
    if target > config.min_voters && target % 2 == 0 {
        target -= 1;
    }

    let is_leader = |member: &ClusterMember| leader == Some(member.name.as_str());

    let mut voters: Vec<&ClusterMember> = ordered
        .iter()
        .copied()
        .filter(|member| member.role == Role::Voter || is_leader(member))
        .collect();

    while voters.len() > target {
        let Some(position) = voters.iter().rposition(|member| !is_leader(member)) else {
            break;
        };
        voters.remove(position);
    }

    let mut rest: Vec<&ClusterMember> = ordered
        .iter()
        .copied()
        .filter(|member| !voters.iter().any(|voter| voter.id == member.id))
        .collect();
    rest.sort_by_key(|member| (member.role.promotion_rank(), member.joined_at, member.id));

    let open = target.saturating_sub(voters.len()).min(rest.len());
    voters.extend(rest.drain(..open));

    let mut plan = BTreeMap::new();
    for member in voters {
        plan.insert(member.name.clone(), Role::Voter);
    }
    for (position, member) in rest.into_iter().enumerate() {
        let role = if position < config.max_standby {
            Role::StandBy
        } else {
            Role::Spare
        };
        plan.insert(member.name.clone(), role);
    }

    plan
}

fn count_voters<'a>(roles: impl Iterator<Item = &'a Role>) -> usize {
    roles.filter(|role| **role == Role::Voter).count()
}

/// Apply the planned roles inside a transaction
fn apply_plan(
    tx: &mut ClusterTx,
    leader: Option<&str>,
    config: &RoleConfig,
) -> ClusterResult<Vec<RoleChange>> {
    let members = tx.members();
    let plan = plan_roles(&members, leader, config);

    let mut changes = Vec::new();
    for mut member in members {
        let Some(&role) = plan.get(&member.name) else {
            continue;
        };
        if member.role == role {
            continue;
        }

        changes.push(RoleChange {
            name: member.name.clone(),
            from: member.role,
            to: role,
        });
        member.set_role(role);
        tx.update_member(member)?;
    }

    Ok(changes)
}

/// Delete a member after checking the voter band survives it
fn remove_member(
    tx: &mut ClusterTx,
    name: &str,
    leader: Option<&str>,
    config: &RoleConfig,
) -> ClusterResult<ClusterMember> {
    let members = tx.members();
    let Some(target) = members.iter().find(|member| member.name == name) else {
        return Err(Error::not_found(format!("Cluster member {name:?} not found")));
    };

    if leader == Some(name) {
        return Err(Error::conflict(format!(
            "Cluster member {name:?} is the leader and cannot be removed"
        )));
    }

    if target.role == Role::Voter {
        let voters_before = count_voters(members.iter().map(|member| &member.role));
        if voters_before == 1 {
            return Err(Error::conflict(format!(
                "Cluster member {name:?} is the last voter"
            )));
        }

        let remaining: Vec<ClusterMember> = members
            .iter()
            .filter(|member| member.name != name)
            .cloned()
            .collect();
        let voters_after = count_voters(plan_roles(&remaining, leader, config).values());

        if voters_before >= config.min_voters && voters_after < config.min_voters {
            return Err(Error::conflict(format!(
                "Removing cluster member {name:?} would leave {voters_after} voters, below the minimum of {}",
                config.min_voters
            )));
        }
    }

    tx.delete_member(name)
}

fn log_changes(changes: &[RoleChange]) {
    for change in changes {
        info!(
            "Cluster member {} changed role from {} to {}",
            change.name, change.from, change.to
        );
    }
}

/// Tracks cluster members and their roles
pub struct MemberRegistry {
    store: Arc<ClusterStore>,
    roles: RoleConfig,
    data_dir: PathBuf,
    timeout: Duration,
}

impl MemberRegistry {
    /// Create a registry over `store`
    pub fn new(config: &ClusterConfig, store: Arc<ClusterStore>) -> ClusterResult<Self> {
        config.roles.validate()?;

        Ok(Self {
            store,
            roles: config.roles,
            data_dir: config.data_dir.clone(),
            timeout: config.transaction_timeout,
        })
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<ClusterStore> {
        &self.store
    }

    /// ID of the member called `name`
    pub async fn lookup(&self, name: &str) -> ClusterResult<MemberId> {
        self.store.catch_up().await?;
        self.store.get_member_id(name)
    }

    /// All members, ordered by name
    pub async fn members(&self) -> ClusterResult<Vec<ClusterMember>> {
        self.store.catch_up().await?;
        Ok(self.store.read(|state| state.members().cloned().collect()))
    }

    /// Address of the member called `name`
    pub async fn address(&self, name: &str) -> ClusterResult<String> {
        self.store.catch_up().await?;
        self.store
            .read(|state| state.member(name).map(resolve_address))
            .ok_or_else(|| Error::not_found(format!("Cluster member {name:?} not found")))
    }

    /// Role `candidate` should hold given the current membership, or `None`
    /// if it is not part of the consensus group
    pub async fn determine_role(&self, candidate: &str) -> ClusterResult<Option<Role>> {
        self.store.catch_up().await?;
        let leader = self.store.leader().await;

        let members: Vec<ClusterMember> =
            self.store.read(|state| state.members().cloned().collect());
        if !members.iter().any(|member| member.name == candidate) {
            return Ok(None);
        }

        let plan = plan_roles(&members, leader.as_deref(), &self.roles);
        Ok(plan.get(candidate).copied())
    }

    /// Initialize a new cluster with `first` as its only voter
    pub async fn bootstrap(&self, first: NewMember) -> ClusterResult<ClusterMember> {
        let member = self
            .store
            .transaction(self.timeout, |tx| {
                if !tx.members().is_empty() {
                    return Err(Error::conflict("Cluster is already initialized"));
                }

                let mut member = tx.create_member(first.clone())?;
                member.set_role(Role::Voter);
                tx.update_member(member.clone())?;

                if !tx.project_names().iter().any(|name| name == DEFAULT_PROJECT) {
                    tx.create_project(DEFAULT_PROJECT, "Default project")?;
                }

                Ok(member)
            })
            .await?;

        info!("Bootstrapped cluster with member {} ({})", member.name, member.id);
        Ok(member)
    }

    /// Activate the local member.
    ///
    /// Members taking part in the consensus group get their replicated data
    /// directory created if missing; failing to create it is fatal.
    pub async fn activate(&self) -> ClusterResult<Option<Activation>> {
        let name = self.store.member_name().to_string();

        let Some(role) = self.determine_role(&name).await? else {
            info!("Member {} is not part of the consensus group", name);
            return Ok(None);
        };

        let member = self
            .store
            .read(|state| state.member(&name).cloned())
            .ok_or_else(|| Error::not_found(format!("Cluster member {name:?} not found")))?;
        let address = resolve_address(&member);

        info!(
            "Starting database node {} (id {}, address {}, role {})",
            name, member.id, address, role
        );

        ensure_data_dir(&self.data_dir)?;

        Ok(Some(Activation {
            id: member.id,
            address,
            role,
        }))
    }

    /// Register a new member and assign it a role
    pub async fn join(&self, new: NewMember) -> ClusterResult<ClusterMember> {
        let leader = self.store.leader().await;
        let roles = self.roles;
        let name = new.name.clone();

        let (member, changes) = self
            .store
            .transaction(self.timeout, |tx| {
                tx.create_member(new.clone())?;
                let changes = apply_plan(tx, leader.as_deref(), &roles)?;
                Ok((tx.member(&name)?, changes))
            })
            .await?;

        info!(
            "Cluster member {} joined as {} at {}",
            member.name,
            member.role,
            resolve_address(&member)
        );
        log_changes(&changes);

        Ok(member)
    }

    /// Remove a member and promote replacements
    pub async fn remove(&self, name: &str) -> ClusterResult<Vec<RoleChange>> {
        let leader = self.store.leader().await;
        let roles = self.roles;

        let changes = self
            .store
            .transaction(self.timeout, |tx| {
                remove_member(tx, name, leader.as_deref(), &roles)?;
                apply_plan(tx, leader.as_deref(), &roles)
            })
            .await?;

        info!("Removed cluster member {}", name);
        log_changes(&changes);

        Ok(changes)
    }

    /// Recompute roles for the current membership
    pub async fn rebalance(&self) -> ClusterResult<Vec<RoleChange>> {
        let leader = self.store.leader().await;
        let roles = self.roles;

        let changes = self
            .store
            .transaction(self.timeout, |tx| apply_plan(tx, leader.as_deref(), &roles))
            .await?;

        log_changes(&changes);
        Ok(changes)
    }

    /// Record that `name` is alive at `now` (unix millis)
    pub async fn heartbeat(&self, name: &str, now: i64) -> ClusterResult<()> {
        self.store
            .transaction(self.timeout, |tx| {
                let mut member = tx.member(name)?;
                member.last_heartbeat = now;
                tx.update_member(member)
            })
            .await?;

        debug!("Heartbeat from {} at {}", name, now);
        Ok(())
    }

    /// Remove members not seen for longer than `threshold`.
    ///
    /// The leader is never evicted, and neither is a voter whose removal
    /// would break the voter band.
    pub async fn evict_unreachable(&self, now: i64, threshold: Duration) -> ClusterResult<Eviction> {
        let leader = self.store.leader().await;
        let roles = self.roles;

        let (eviction, changes) = self
            .store
            .transaction(self.timeout, |tx| {
                let mut eviction = Eviction::default();

                for member in tx.members() {
                    if member.is_online(now, threshold) || leader.as_deref() == Some(&member.name) {
                        continue;
                    }

                    match remove_member(tx, &member.name, leader.as_deref(), &roles) {
                        Ok(_) => eviction.evicted.push(member.name),
                        Err(e) if e.kind() == ErrorKind::Conflict => {
                            eviction.retained.push(member.name)
                        }
                        Err(e) => return Err(e),
                    }
                }

                let changes = if eviction.evicted.is_empty() {
                    Vec::new()
                } else {
                    apply_plan(tx, leader.as_deref(), &roles)?
                };
                Ok((eviction, changes))
            })
            .await?;

        for name in &eviction.evicted {
            warn!("Evicted unreachable cluster member {}", name);
        }
        for name in &eviction.retained {
            warn!(
                "Cluster member {} is unreachable but is needed to keep the voter band",
                name
            );
        }
        log_changes(&changes);

        Ok(eviction)
    }
}

/// Create `<data_dir>/global` with mode 0750 if it does not exist
fn ensure_data_dir(data_dir: &Path) -> ClusterResult<()> {
    let dir = data_dir.join("global");
    if dir.is_dir() {
        return Ok(());
    }

    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o750);
    }

    builder.create(&dir).map_err(|e| {
        Error::chain(
            ErrorKind::Internal,
            format!("Failed to create database directory {}", dir.display()),
            e,
        )
    })
}
