//! Daemon lifecycle

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use hearth_cluster::{
    ClusterStore, MemberRegistry, MemoryConsensus, NewMember, SCHEMA_VERSION, now_millis,
};
use hearth_instances::{RecordOnlyDriver, SnapshotManager};
use hearth_network::{AllocationAggregator, NetworkLoader, StoreNetworkLoader};
use hearth_network_mock::MockNetworkLoader;
use hearth_operations::OperationEngine;
use hearth_storage_fs::FsStorage;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::DaemonConfig;
use crate::error::{Error, Result};
use crate::routes::{AppState, router};

/// A single hearth member: cluster store, operation engine and HTTP API
pub struct Daemon {
    config: DaemonConfig,
    state: AppState,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
}

impl Daemon {
    /// Build the daemon over the cluster log in `data_dir`, bootstrapping a
    /// fresh cluster if the local member is not part of one yet
    pub async fn new(config: DaemonConfig) -> Result<Self> {
        let cluster = config.cluster_config();
        let storage = FsStorage::new(&cluster.data_dir);
        let consensus = Arc::new(
            MemoryConsensus::open(storage, Some(cluster.member_name.clone())).await?,
        );
        let store = Arc::new(ClusterStore::new(&cluster, consensus));
        let registry = Arc::new(MemberRegistry::new(&cluster, store.clone())?);

        if registry.activate().await?.is_none() {
            registry
                .bootstrap(NewMember {
                    name: cluster.member_name.clone(),
                    address: cluster.address.clone(),
                    schema_version: SCHEMA_VERSION,
                    certificate_fingerprint: cluster.certificate_fingerprint.clone(),
                })
                .await?;
            registry.activate().await?;
        }

        let engine = OperationEngine::new(config.operations_config(), store.clone());

        let loader: Arc<dyn NetworkLoader> = match &config.network.fixture {
            Some(path) => {
                info!("Loading network fixture from: {:?}", path);
                Arc::new(MockNetworkLoader::from_fixture_file(path)?)
            }
            None => Arc::new(StoreNetworkLoader::new(store.clone())),
        };
        let allocations = Arc::new(AllocationAggregator::new(store.clone(), loader));
        let snapshots = SnapshotManager::new(store, engine.clone(), Arc::new(RecordOnlyDriver));

        let state = AppState {
            registry,
            engine,
            allocations,
            snapshots,
            address: cluster.address,
            certificate_fingerprint: cluster.certificate_fingerprint,
            offline_threshold: cluster.offline_threshold,
        };

        Ok(Self {
            config,
            state,
            shutdown_token: CancellationToken::new(),
            task_tracker: TaskTracker::new(),
        })
    }

    /// Shared handler state
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// API router over this daemon's state
    pub fn router(&self) -> Router {
        router(self.state.clone())
    }

    /// Start serving the API and the background loops
    pub async fn start(&self) -> Result<JoinHandle<()>> {
        if self.task_tracker.is_closed() {
            return Err(Error::AlreadyStarted);
        }

        let listen_addr = self.config.http.listen_addr;
        let listener = tokio::net::TcpListener::bind(listen_addr)
            .await
            .map_err(Error::Bind)?;
        info!("API listening on {}", listen_addr);

        self.state.engine.start();

        let router = self.router();
        let shutdown_token = self.shutdown_token.clone();
        let handle = self.task_tracker.spawn(async move {
            tokio::select! {
                e = axum::serve(listener, router.into_make_service()).into_future() => {
                    info!("http server exited {:?}", e);
                }
                () = shutdown_token.cancelled() => {}
            };
        });

        let cluster = self.config.cluster_config();
        self.task_tracker.spawn(heartbeat_loop(
            self.state.registry.clone(),
            cluster.heartbeat_interval,
            cluster.eviction_threshold,
            self.shutdown_token.clone(),
        ));

        self.task_tracker.close();

        Ok(handle)
    }

    /// Stop the API, the background loops and the operation engine
    pub async fn shutdown(&self) {
        info!("daemon shutting down...");

        self.shutdown_token.cancel();
        self.task_tracker.wait().await;
        self.state.engine.shutdown().await;

        info!("daemon shutdown");
    }
}

async fn heartbeat_loop(
    registry: Arc<MemberRegistry>,
    interval: Duration,
    eviction_threshold: Duration,
    shutdown_token: CancellationToken,
) {
    let name = registry.store().member_name().to_string();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            () = shutdown_token.cancelled() => {
                debug!("Heartbeat loop stopped");
                break;
            }
        }

        let now = now_millis();
        if let Err(e) = registry.heartbeat(&name, now).await {
            warn!("Failed to record heartbeat: {}", e);
            continue;
        }

        // Only the leader evicts
        if registry.store().leader().await.as_deref() != Some(name.as_str()) {
            continue;
        }
        match registry.evict_unreachable(now, eviction_threshold).await {
            Ok(eviction) => {
                for member in &eviction.retained {
                    warn!("Keeping unreachable member {} to preserve quorum", member);
                }
            }
            Err(e) => warn!("Failed to evict unreachable members: {}", e),
        }
    }
}
