//! Snapshot commands riding on operations

use std::sync::Arc;

use hearth_cluster::{ClusterStore, Error, Instance, InstanceSnapshot, api_url, now_millis};
use hearth_operations::{
    OperationClass, OperationEngine, OperationHandle, OperationStatus, Resources,
};
use tracing::{info, warn};

use crate::driver::InstanceDriver;
use crate::error::{InstanceError, InstanceResult};

/// Parameters of a snapshot creation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotRequest {
    /// Snapshot name; empty picks the next free `snapN`
    pub name: String,
    /// Capture runtime state as well
    pub stateful: bool,
    /// Expiry time (unix millis)
    pub expires_at: Option<i64>,
    /// Replace an existing snapshot of the same name
    pub reuse: bool,
}

/// Check a user supplied snapshot name
pub fn validate_snapshot_name(name: &str) -> InstanceResult<()> {
    let reason = if name.is_empty() {
        "Name cannot be empty"
    } else if name.contains('/') {
        "Name cannot contain \"/\""
    } else if name == "." || name == ".." {
        "Name is reserved"
    } else if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        "Name cannot contain white space"
    } else {
        return Ok(());
    };

    Err(InstanceError::InvalidName {
        name: name.to_string(),
        reason,
    })
}

/// Next unused `snapN` name, one past the highest existing index
pub fn next_snapshot_name(existing: &[InstanceSnapshot]) -> InstanceResult<String> {
    let highest = existing
        .iter()
        .filter_map(|snapshot| snapshot.name.strip_prefix("snap")?.parse::<u64>().ok())
        .max();

    let next = match highest {
        None => 0,
        Some(highest) => highest.checked_add(1).ok_or_else(|| {
            InstanceError::InvalidArgument(
                "No snapshot index left after \"snap\" names, give the snapshot a name".to_string(),
            )
        })?,
    };
    Ok(format!("snap{next}"))
}

fn resources(project: &str, instance: &str, snapshot: Option<&str>) -> Resources {
    let mut resources = Resources::new();
    resources.insert(
        "instances".to_string(),
        vec![api_url(&["instances", instance], project)],
    );
    if let Some(snapshot) = snapshot {
        resources.insert(
            "instances_snapshots".to_string(),
            vec![api_url(&["instances", instance, "snapshots", snapshot], project)],
        );
    }
    resources
}

/// Validates snapshot commands and submits them as operations.
///
/// Validation happens before an operation exists; failures there are
/// returned directly. Runtime and store failures surface through the
/// operation's terminal state.
#[derive(Clone)]
pub struct SnapshotManager {
    store: Arc<ClusterStore>,
    engine: OperationEngine,
    driver: Arc<dyn InstanceDriver>,
}

impl SnapshotManager {
    /// Create a manager submitting work to `engine`
    pub fn new(
        store: Arc<ClusterStore>,
        engine: OperationEngine,
        driver: Arc<dyn InstanceDriver>,
    ) -> Self {
        Self {
            store,
            engine,
            driver,
        }
    }

    async fn load(
        &self,
        project: &str,
        instance: &str,
    ) -> InstanceResult<(Instance, Vec<InstanceSnapshot>)> {
        Ok(self
            .store
            .transaction(self.store.transaction_timeout(), |tx| {
                let target = tx.instance(project, instance)?;
                Ok((target, tx.snapshots(project, instance)))
            })
            .await?)
    }

    /// Create a snapshot of `instance`.
    ///
    /// With `reuse`, an existing snapshot of the same name is deleted first
    /// and the delete operation must succeed before the create operation is
    /// submitted.
    pub async fn create_snapshot(
        &self,
        project: &str,
        instance: &str,
        request: SnapshotRequest,
    ) -> InstanceResult<OperationHandle> {
        let (target, existing) = self.load(project, instance).await?;

        let name = if request.name.is_empty() {
            next_snapshot_name(&existing)?
        } else {
            validate_snapshot_name(&request.name)?;
            request.name.clone()
        };

        if existing.iter().any(|snapshot| snapshot.name == name) {
            if !request.reuse {
                return Err(Error::conflict(format!(
                    "Snapshot {name:?} of instance {instance:?} already exists"
                ))
                .into());
            }
            self.replace(project, instance, &name).await?;
        }

        let handle = self
            .engine
            .create(
                OperationClass::Task,
                "Snapshotting instance",
                resources(project, instance, Some(&name)),
            )
            .await?;

        let store = self.store.clone();
        let driver = self.driver.clone();
        let record = InstanceSnapshot {
            project: project.to_string(),
            instance: instance.to_string(),
            name,
            stateful: request.stateful,
            created_at: now_millis(),
            expires_at: request.expires_at,
        };
        self.engine.run(&handle, move |ctx| async move {
            let timeout = store.transaction_timeout();
            store
                .transaction(timeout, |tx| tx.create_snapshot(record.clone()))
                .await?;

            if let Err(e) = driver
                .snapshot(&ctx, &target, &record.name, record.stateful)
                .await
            {
                // Drop the record again so the name can be retried
                let reverted = store
                    .transaction(timeout, |tx| {
                        tx.delete_snapshot(&record.project, &record.instance, &record.name)
                    })
                    .await;
                if let Err(revert) = reverted {
                    warn!(
                        "Failed to remove record of snapshot {}/{}: {}",
                        record.instance, record.name, revert
                    );
                }
                return Err(e);
            }

            Ok(())
        })?;

        info!(
            "Submitted snapshot of instance {} in project {} ({})",
            instance,
            project,
            handle.id()
        );
        Ok(handle)
    }

    async fn replace(&self, project: &str, instance: &str, name: &str) -> InstanceResult<()> {
        let delete = self.delete_snapshot(project, instance, name).await?;
        let outcome = self.engine.wait(delete.id(), None).await?;

        if outcome.status != OperationStatus::Success {
            let err = if outcome.err.is_empty() {
                outcome.status.to_string()
            } else {
                outcome.err
            };
            return Err(InstanceError::ReuseFailed {
                name: name.to_string(),
                err,
            });
        }

        Ok(())
    }

    /// Delete a snapshot
    pub async fn delete_snapshot(
        &self,
        project: &str,
        instance: &str,
        name: &str,
    ) -> InstanceResult<OperationHandle> {
        let (target, existing) = self.load(project, instance).await?;
        if !existing.iter().any(|snapshot| snapshot.name == name) {
            return Err(Error::not_found(format!(
                "Snapshot {name:?} of instance {instance:?} not found"
            ))
            .into());
        }

        let handle = self
            .engine
            .create(
                OperationClass::Task,
                "Deleting snapshot",
                resources(project, instance, Some(name)),
            )
            .await?;

        let store = self.store.clone();
        let driver = self.driver.clone();
        let project = project.to_string();
        let name = name.to_string();
        self.engine.run(&handle, move |ctx| async move {
            driver.delete_snapshot(&ctx, &target, &name).await?;
            store
                .transaction(store.transaction_timeout(), |tx| {
                    tx.delete_snapshot(&project, &target.name, &name)
                })
                .await?;
            Ok(())
        })?;

        Ok(handle)
    }

    /// Rename a snapshot
    pub async fn rename_snapshot(
        &self,
        project: &str,
        instance: &str,
        from: &str,
        to: &str,
    ) -> InstanceResult<OperationHandle> {
        validate_snapshot_name(to)?;

        let (target, existing) = self.load(project, instance).await?;
        if !existing.iter().any(|snapshot| snapshot.name == from) {
            return Err(Error::not_found(format!(
                "Snapshot {from:?} of instance {instance:?} not found"
            ))
            .into());
        }
        if existing.iter().any(|snapshot| snapshot.name == to) {
            return Err(Error::conflict(format!(
                "Name {to:?} already in use by another snapshot of instance {instance:?}"
            ))
            .into());
        }

        let handle = self
            .engine
            .create(
                OperationClass::Task,
                "Renaming snapshot",
                resources(project, instance, Some(from)),
            )
            .await?;

        let store = self.store.clone();
        let driver = self.driver.clone();
        let project = project.to_string();
        let from = from.to_string();
        let to = to.to_string();
        self.engine.run(&handle, move |ctx| async move {
            driver.rename_snapshot(&ctx, &target, &from, &to).await?;
            store
                .transaction(store.transaction_timeout(), |tx| {
                    tx.rename_snapshot(&project, &target.name, &from, &to)
                })
                .await?;
            Ok(())
        })?;

        Ok(handle)
    }

    /// Restore `instance` from one of its snapshots
    pub async fn restore_snapshot(
        &self,
        project: &str,
        instance: &str,
        name: &str,
        stateful: bool,
    ) -> InstanceResult<OperationHandle> {
        let (target, existing) = self.load(project, instance).await?;
        let Some(snapshot) = existing.into_iter().find(|snapshot| snapshot.name == name) else {
            return Err(Error::not_found(format!(
                "Snapshot {name:?} of instance {instance:?} not found"
            ))
            .into());
        };

        if stateful && !snapshot.stateful {
            return Err(InstanceError::InvalidArgument(format!(
                "Stateful restore requested but snapshot {name:?} is stateless"
            )));
        }

        let handle = self
            .engine
            .create(
                OperationClass::Task,
                "Restoring snapshot",
                resources(project, instance, None),
            )
            .await?;

        let driver = self.driver.clone();
        self.engine.run(&handle, move |ctx| async move {
            driver.restore(&ctx, &target, &snapshot, stateful).await
        })?;

        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_cluster::ErrorKind;

    fn snapshot(name: &str) -> InstanceSnapshot {
        InstanceSnapshot {
            project: "default".to_string(),
            instance: "u1".to_string(),
            name: name.to_string(),
            stateful: false,
            created_at: 0,
            expires_at: None,
        }
    }

    #[test]
    fn test_next_snapshot_name() {
        assert_eq!(next_snapshot_name(&[]).unwrap(), "snap0");
        assert_eq!(
            next_snapshot_name(&[snapshot("snap0"), snapshot("snap4"), snapshot("before-upgrade")])
                .unwrap(),
            "snap5"
        );
        assert_eq!(next_snapshot_name(&[snapshot("snapshot")]).unwrap(), "snap0");
    }

    #[test]
    fn test_next_snapshot_name_exhausted() {
        let last = format!("snap{}", u64::MAX);
        assert!(validate_snapshot_name(&last).is_ok());

        let err = next_snapshot_name(&[snapshot("snap3"), snapshot(&last)]).unwrap_err();
        assert!(matches!(err, InstanceError::InvalidArgument(_)));
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_validate_snapshot_name() {
        assert!(validate_snapshot_name("snap0").is_ok());
        assert!(validate_snapshot_name("before-upgrade.2").is_ok());

        for name in ["", "a/b", ".", "..", "two words", "tab\there"] {
            let err = validate_snapshot_name(name).unwrap_err();
            assert!(matches!(err, InstanceError::InvalidName { .. }), "{name:?}");
        }
    }

    #[test]
    fn test_resources_carry_project() {
        let resources = resources("blue", "u1", Some("snap0"));
        assert_eq!(resources["instances"], vec!["/1.0/instances/u1?project=blue"]);
        assert_eq!(
            resources["instances_snapshots"],
            vec!["/1.0/instances/u1/snapshots/snap0?project=blue"]
        );
        assert!(!super::resources("default", "u1", None).contains_key("instances_snapshots"));
    }
}
