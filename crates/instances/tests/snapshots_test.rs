//! Snapshot commands against an in-process cluster and a scripted runtime

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use hearth_cluster::{
    ClusterConfig, ClusterStore, ErrorKind, Instance, InstanceSnapshot, MemoryConsensus,
};
use hearth_instances::{InstanceDriver, RecordOnlyDriver, SnapshotManager, SnapshotRequest};
use hearth_operations::{
    NoopRegistry, OperationContext, OperationEngine, OperationStatus, OperationsConfig, WorkError,
};
use tokio::sync::Semaphore;
use tracing_test::traced_test;

#[derive(Default)]
struct ScriptedDriver {
    calls: parking_lot::Mutex<Vec<String>>,
    fail_snapshots: AtomicBool,
    hold_deletes: Option<Semaphore>,
}

impl ScriptedDriver {
    fn holding_deletes() -> Self {
        Self {
            hold_deletes: Some(Semaphore::new(0)),
            ..Default::default()
        }
    }

    fn release_delete(&self) {
        if let Some(gate) = &self.hold_deletes {
            gate.add_permits(1);
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl InstanceDriver for ScriptedDriver {
    async fn snapshot(
        &self,
        ctx: &OperationContext,
        instance: &Instance,
        name: &str,
        _stateful: bool,
    ) -> Result<(), WorkError> {
        self.calls
            .lock()
            .push(format!("snapshot {}/{name}", instance.name));
        ctx.progress()
            .set_progress("create_snapshot", "Snapshotting", 50, 0, 1_000_000);
        if self.fail_snapshots.load(Ordering::SeqCst) {
            return Err("Failed to freeze instance".into());
        }
        Ok(())
    }

    async fn delete_snapshot(
        &self,
        _ctx: &OperationContext,
        instance: &Instance,
        name: &str,
    ) -> Result<(), WorkError> {
        if let Some(gate) = &self.hold_deletes {
            gate.acquire().await?.forget();
        }
        self.calls
            .lock()
            .push(format!("delete {}/{name}", instance.name));
        Ok(())
    }

    async fn rename_snapshot(
        &self,
        _ctx: &OperationContext,
        instance: &Instance,
        from: &str,
        to: &str,
    ) -> Result<(), WorkError> {
        self.calls
            .lock()
            .push(format!("rename {}/{from} {to}", instance.name));
        Ok(())
    }

    async fn restore(
        &self,
        _ctx: &OperationContext,
        instance: &Instance,
        snapshot: &InstanceSnapshot,
        stateful: bool,
    ) -> Result<(), WorkError> {
        self.calls.lock().push(format!(
            "restore {}/{} stateful={stateful}",
            instance.name, snapshot.name
        ));
        Ok(())
    }
}

struct Fixture {
    store: Arc<ClusterStore>,
    engine: OperationEngine,
    manager: SnapshotManager,
}

async fn fixture(driver: Arc<dyn InstanceDriver>) -> Fixture {
    let consensus = Arc::new(MemoryConsensus::new(Some("node1".to_string())));
    let config = ClusterConfig {
        member_name: "node1".to_string(),
        ..Default::default()
    };
    let store = Arc::new(ClusterStore::new(&config, consensus));
    store
        .transaction(store.transaction_timeout(), |tx| {
            tx.create_project("default", "")?;
            tx.create_instance(Instance {
                project: "default".to_string(),
                name: "u1".to_string(),
                location: "node1".to_string(),
            })
        })
        .await
        .unwrap();

    let engine = OperationEngine::new(OperationsConfig::default(), Arc::new(NoopRegistry));
    let manager = SnapshotManager::new(store.clone(), engine.clone(), driver);
    Fixture {
        store,
        engine,
        manager,
    }
}

fn named(name: &str) -> SnapshotRequest {
    SnapshotRequest {
        name: name.to_string(),
        ..Default::default()
    }
}

fn snapshot_names(store: &ClusterStore) -> Vec<String> {
    store.read(|state| {
        state
            .snapshots("default", "u1")
            .into_iter()
            .map(|snapshot| snapshot.name.clone())
            .collect()
    })
}

#[tokio::test]
async fn test_create_assigns_names_and_records() {
    let f = fixture(Arc::new(RecordOnlyDriver)).await;

    for expected in ["snap0", "snap1"] {
        let handle = f
            .manager
            .create_snapshot("default", "u1", SnapshotRequest::default())
            .await
            .unwrap();
        let op = f.engine.wait(handle.id(), None).await.unwrap();
        assert_eq!(op.status, OperationStatus::Success);
        assert_eq!(op.description, "Snapshotting instance");
        assert_eq!(
            op.resources["instances_snapshots"],
            vec![format!("/1.0/instances/u1/snapshots/{expected}")]
        );
    }

    assert_eq!(snapshot_names(&f.store), vec!["snap0", "snap1"]);
}

#[tokio::test]
async fn test_validation_fails_before_an_operation_exists() {
    let f = fixture(Arc::new(RecordOnlyDriver)).await;
    let handle = f
        .manager
        .create_snapshot("default", "u1", named("snap0"))
        .await
        .unwrap();
    f.engine.wait(handle.id(), None).await.unwrap();

    let err = f
        .manager
        .create_snapshot("default", "u1", named("snap0"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let err = f
        .manager
        .create_snapshot("default", "u2", named("snap0"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = f
        .manager
        .create_snapshot("default", "u1", named("a/b"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    assert_eq!(f.engine.list().len(), 1);
}

#[tokio::test]
async fn test_reuse_waits_for_delete_success() {
    let driver = Arc::new(ScriptedDriver::default());
    let f = fixture(driver.clone()).await;
    let first = f
        .manager
        .create_snapshot("default", "u1", named("snap0"))
        .await
        .unwrap();
    f.engine.wait(first.id(), None).await.unwrap();

    let request = SnapshotRequest {
        reuse: true,
        ..named("snap0")
    };
    let handle = f
        .manager
        .create_snapshot("default", "u1", request)
        .await
        .unwrap();

    // By the time the create exists, the delete has already succeeded
    let operations = f.engine.list();
    assert_eq!(operations.len(), 3);
    assert_eq!(operations[1].description, "Deleting snapshot");
    assert_eq!(operations[1].status, OperationStatus::Success);
    assert!(operations[1].updated_at <= operations[2].created_at);

    let op = f.engine.wait(handle.id(), None).await.unwrap();
    assert_eq!(op.status, OperationStatus::Success);
    assert_eq!(
        driver.calls(),
        vec!["snapshot u1/snap0", "delete u1/snap0", "snapshot u1/snap0"]
    );
    assert_eq!(snapshot_names(&f.store), vec!["snap0"]);
}

#[tokio::test]
async fn test_create_conflicts_with_delete_in_flight() {
    let driver = Arc::new(ScriptedDriver::holding_deletes());
    let f = fixture(driver.clone()).await;
    let first = f
        .manager
        .create_snapshot("default", "u1", named("snap0"))
        .await
        .unwrap();
    f.engine.wait(first.id(), None).await.unwrap();

    let delete = f
        .manager
        .delete_snapshot("default", "u1", "snap0")
        .await
        .unwrap();
    assert_eq!(delete.status(), OperationStatus::Running);

    // Not serialized behind the delete: the name is still taken
    let err = f
        .manager
        .create_snapshot("default", "u1", named("snap0"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    driver.release_delete();
    let op = f.engine.wait(delete.id(), None).await.unwrap();
    assert_eq!(op.status, OperationStatus::Success);
    assert!(snapshot_names(&f.store).is_empty());
}

#[tokio::test]
#[traced_test]
async fn test_runtime_failure_surfaces_on_the_operation() {
    let driver = Arc::new(ScriptedDriver::default());
    driver.fail_snapshots.store(true, Ordering::SeqCst);
    let f = fixture(driver.clone()).await;

    let handle = f
        .manager
        .create_snapshot("default", "u1", named("snap0"))
        .await
        .unwrap();
    let op = f.engine.wait(handle.id(), None).await.unwrap();

    assert_eq!(op.status, OperationStatus::Failure);
    assert_eq!(op.err, "Failed to freeze instance");
    assert!(snapshot_names(&f.store).is_empty());
    assert!(logs_contain("Created task operation"));
}

#[tokio::test]
async fn test_rename_and_restore() {
    let driver = Arc::new(ScriptedDriver::default());
    let f = fixture(driver.clone()).await;
    for name in ["snap0", "snap1"] {
        let handle = f
            .manager
            .create_snapshot("default", "u1", named(name))
            .await
            .unwrap();
        f.engine.wait(handle.id(), None).await.unwrap();
    }

    let err = f
        .manager
        .rename_snapshot("default", "u1", "snap0", "snap1")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let handle = f
        .manager
        .rename_snapshot("default", "u1", "snap0", "before-upgrade")
        .await
        .unwrap();
    let op = f.engine.wait(handle.id(), None).await.unwrap();
    assert_eq!(op.status, OperationStatus::Success);
    assert_eq!(snapshot_names(&f.store), vec!["before-upgrade", "snap1"]);

    let err = f
        .manager
        .restore_snapshot("default", "u1", "snap1", true)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let handle = f
        .manager
        .restore_snapshot("default", "u1", "before-upgrade", false)
        .await
        .unwrap();
    let op = f.engine.wait(handle.id(), None).await.unwrap();
    assert_eq!(op.status, OperationStatus::Success);
    assert_eq!(op.resources["instances"], vec!["/1.0/instances/u1"]);
    assert_eq!(
        driver.calls().last().map(String::as_str),
        Some("restore u1/before-upgrade stateful=false")
    );
}
