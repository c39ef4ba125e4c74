//! Operation engine
//!
//! Operations live in memory on the member that accepted them. Status is
//! published through a `watch` channel so any number of waiters can block on
//! a terminal state without polling, and metadata sits behind a short
//! synchronous lock so readers never wait on the worker.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info, warn};

use crate::config::OperationsConfig;
use crate::error::{OperationError, OperationResult};
use crate::progress::ProgressReporter;
use crate::registry::OperationRegistry;
use crate::types::{Operation, OperationClass, OperationStatus, Resources};

/// Error type returned by operation work
pub type WorkError = Box<dyn std::error::Error + Send + Sync>;

const CANCELLED_MESSAGE: &str = "Operation cancelled";

#[derive(Debug, Clone)]
pub(crate) struct OperationState {
    status: OperationStatus,
    err: Option<String>,
    updated_at: DateTime<Utc>,
    finished_at: Option<Instant>,
}

pub(crate) struct OperationInner {
    id: String,
    class: OperationClass,
    description: String,
    created_at: DateTime<Utc>,
    location: String,
    resources: Resources,
    pub(crate) metadata: RwLock<Map<String, Value>>,
    state: watch::Sender<OperationState>,
    cancel: CancellationToken,
    abort: Mutex<Option<AbortHandle>>,
}

impl OperationInner {
    pub(crate) fn status(&self) -> OperationStatus {
        self.state.borrow().status
    }

    pub(crate) fn touch(&self) {
        self.state.send_modify(|state| state.updated_at = Utc::now());
    }

    /// Moves to `to` unless a terminal state was already reached.
    fn transition(&self, to: OperationStatus, err: Option<String>) -> bool {
        self.state.send_if_modified(|state| {
            if state.status.is_final() || state.status == to {
                return false;
            }

            state.status = to;
            state.err = err;
            state.updated_at = Utc::now();
            if to.is_final() {
                state.finished_at = Some(Instant::now());
            }
            true
        })
    }

    fn finished_at(&self) -> Option<Instant> {
        self.state.borrow().finished_at
    }

    fn snapshot(&self) -> Operation {
        let state = self.state.borrow().clone();
        let may_cancel = !state.status.is_final() && !self.cancel.is_cancelled();

        Operation {
            id: self.id.clone(),
            class: self.class,
            description: self.description.clone(),
            created_at: self.created_at,
            updated_at: state.updated_at,
            status: state.status,
            status_code: state.status.code(),
            resources: self.resources.clone(),
            metadata: self.metadata.read().clone(),
            may_cancel,
            err: state.err.unwrap_or_default(),
            location: self.location.clone(),
        }
    }
}

/// Reference to a live operation
#[derive(Clone)]
pub struct OperationHandle {
    inner: Arc<OperationInner>,
}

impl OperationHandle {
    /// Operation ID
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Current status
    pub fn status(&self) -> OperationStatus {
        self.inner.status()
    }

    /// Point-in-time view of the operation
    pub fn snapshot(&self) -> Operation {
        self.inner.snapshot()
    }

    /// Progress reporter bound to this operation
    pub fn progress(&self) -> ProgressReporter {
        ProgressReporter::new(self.inner.clone())
    }
}

impl std::fmt::Debug for OperationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationHandle")
            .field("id", &self.inner.id)
            .field("status", &self.inner.status())
            .finish()
    }
}

/// Context handed to running work
pub struct OperationContext {
    id: String,
    cancel: CancellationToken,
    progress: ProgressReporter,
}

impl OperationContext {
    /// ID of the operation being executed
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once cancellation is requested
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Progress reporter for this operation
    pub fn progress(&self) -> &ProgressReporter {
        &self.progress
    }
}

struct EngineInner {
    config: OperationsConfig,
    operations: RwLock<HashMap<String, Arc<OperationInner>>>,
    registry: Arc<dyn OperationRegistry>,
    accepting: AtomicBool,
    shutdown: CancellationToken,
    background_tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Creates, drives and tracks operations for one member
#[derive(Clone)]
pub struct OperationEngine {
    inner: Arc<EngineInner>,
}

impl OperationEngine {
    /// Create a new engine
    pub fn new(config: OperationsConfig, registry: Arc<dyn OperationRegistry>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config,
                operations: RwLock::new(HashMap::new()),
                registry,
                accepting: AtomicBool::new(true),
                shutdown: CancellationToken::new(),
                background_tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Start the background reaper
    pub fn start(&self) {
        let engine = self.clone();
        let shutdown = self.inner.shutdown.clone();
        let period = self.inner.config.reap_interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let reaped = engine.reap_expired().await;
                        if reaped > 0 {
                            debug!("Reaped {} expired operations", reaped);
                        }
                    }
                    _ = shutdown.cancelled() => {
                        info!("Operation reaper stopped");
                        break;
                    }
                }
            }
        });

        self.inner.background_tasks.lock().push(task);
    }

    /// Stop accepting operations and stop background tasks.
    ///
    /// Running work is left alone; it still reaches a terminal state.
    pub async fn shutdown(&self) {
        if !self.inner.accepting.swap(false, Ordering::SeqCst) {
            return;
        }

        info!("Shutting down operation engine");
        self.inner.shutdown.cancel();

        let tasks: Vec<_> = self.inner.background_tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Error stopping operation engine task: {}", e);
            }
        }
    }

    /// Create a new operation in the `created` state
    pub async fn create(
        &self,
        class: OperationClass,
        description: impl Into<String>,
        resources: Resources,
    ) -> OperationResult<OperationHandle> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(OperationError::Unavailable(
                "Operation engine is shutting down".to_string(),
            ));
        }

        let now = Utc::now();
        let (state, _) = watch::channel(OperationState {
            status: OperationStatus::Created,
            err: None,
            updated_at: now,
            finished_at: None,
        });

        let inner = Arc::new(OperationInner {
            id: uuid::Uuid::new_v4().to_string(),
            class,
            description: description.into(),
            created_at: now,
            location: self.inner.config.location.clone(),
            resources,
            metadata: RwLock::new(Map::new()),
            state,
            cancel: CancellationToken::new(),
            abort: Mutex::new(None),
        });

        self.inner
            .operations
            .write()
            .insert(inner.id.clone(), inner.clone());

        let snapshot = inner.snapshot();
        if let Err(e) = self.inner.registry.register(&snapshot).await {
            warn!("Failed to register operation {}: {}", inner.id, e);
        }

        info!(
            "Created {} operation {} ({})",
            inner.class, inner.id, inner.description
        );

        Ok(OperationHandle { inner })
    }

    /// Start the work of a task operation.
    ///
    /// Returns as soon as the operation is `running`; the outcome is observed
    /// through [`OperationEngine::wait`].
    pub fn run<F, Fut>(&self, handle: &OperationHandle, work: F) -> OperationResult<()>
    where
        F: FnOnce(OperationContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), WorkError>> + Send + 'static,
    {
        let op = handle.inner.clone();

        if op.class != OperationClass::Task {
            return Err(OperationError::InvalidState(format!(
                "Operation {} is a {} and has no work to run",
                op.id, op.class
            )));
        }

        let status = op.status();
        if status != OperationStatus::Created || !op.transition(OperationStatus::Running, None) {
            return Err(OperationError::InvalidState(format!(
                "Operation {} cannot start from {:?}",
                op.id, status
            )));
        }

        let context = OperationContext {
            id: op.id.clone(),
            cancel: op.cancel.clone(),
            progress: ProgressReporter::new(op.clone()),
        };

        let worker = tokio::spawn(work(context));
        *op.abort.lock() = Some(worker.abort_handle());

        let engine = self.clone();
        let worker_op = op.clone();
        tokio::spawn(async move {
            engine.publish(&worker_op).await;

            let result = match worker.await {
                Ok(result) => result,
                Err(e) if e.is_panic() => {
                    let reason = panic_message(e.into_panic());
                    warn!("Operation {} panicked: {}", worker_op.id, reason);
                    Err(format!("Operation panicked: {reason}").into())
                }
                // Aborted by a forced cancellation, which settles the status itself
                Err(_) => return,
            };

            let (status, err) = match result {
                Ok(()) => (OperationStatus::Success, None),
                Err(e) if worker_op.cancel.is_cancelled() => {
                    (OperationStatus::Cancelled, Some(e.to_string()))
                }
                Err(e) => (OperationStatus::Failure, Some(e.to_string())),
            };

            if worker_op.transition(status, err) {
                debug!("Operation {} finished: {:?}", worker_op.id, status);
                engine.publish(&worker_op).await;
            }
        });

        Ok(())
    }

    /// Wait until the operation reaches a terminal state.
    ///
    /// Returns immediately if it already has. A timeout stops waiting without
    /// touching the operation, unless cancellation was requested earlier, in
    /// which case the work is abandoned and the operation becomes `cancelled`.
    pub async fn wait(&self, id: &str, timeout: Option<Duration>) -> OperationResult<Operation> {
        let op = self.lookup(id)?;

        let mut rx = op.state.subscribe();
        let waiting = async move { rx.wait_for(|state| state.status.is_final()).await.is_ok() };

        let reached = match timeout {
            Some(limit) => tokio::time::timeout(limit, waiting).await.unwrap_or(false),
            None => waiting.await,
        };

        if reached || op.status().is_final() {
            return Ok(op.snapshot());
        }

        if op.cancel.is_cancelled() {
            self.force_cancel(&op).await;
            return Ok(op.snapshot());
        }

        Err(OperationError::Timeout {
            id: id.to_string(),
            waited: timeout.unwrap_or_default(),
        })
    }

    /// Request cancellation of a non-terminal operation.
    ///
    /// Operations without running work are cancelled at once; running work is
    /// asked to stop and decides itself when to return.
    pub async fn cancel(&self, id: &str) -> OperationResult<Operation> {
        let op = self.lookup(id)?;

        let status = op.status();
        if status.is_final() {
            return Err(OperationError::InvalidState(format!(
                "Operation {id} already finished: {status:?}"
            )));
        }

        op.cancel.cancel();

        if (op.class == OperationClass::Token || status == OperationStatus::Created)
            && op.transition(
                OperationStatus::Cancelled,
                Some(CANCELLED_MESSAGE.to_string()),
            )
        {
            self.publish(&op).await;
        } else {
            info!("Cancellation requested for running operation {}", id);
        }

        Ok(op.snapshot())
    }

    /// Complete a token operation with the outcome of the external action
    pub async fn complete_token(
        &self,
        id: &str,
        result: Result<(), String>,
    ) -> OperationResult<Operation> {
        let op = self.lookup(id)?;

        if op.class != OperationClass::Token {
            return Err(OperationError::InvalidState(format!(
                "Operation {id} is not a token"
            )));
        }

        let (status, err) = match result {
            Ok(()) => (OperationStatus::Success, None),
            Err(e) => (OperationStatus::Failure, Some(e)),
        };

        if !op.transition(status, err) {
            return Err(OperationError::InvalidState(format!(
                "Operation {id} already finished: {:?}",
                op.status()
            )));
        }
        self.publish(&op).await;

        Ok(op.snapshot())
    }

    /// Current view of an operation
    pub fn get(&self, id: &str) -> OperationResult<Operation> {
        Ok(self.lookup(id)?.snapshot())
    }

    /// Handle to a live operation
    pub fn handle(&self, id: &str) -> OperationResult<OperationHandle> {
        Ok(OperationHandle {
            inner: self.lookup(id)?,
        })
    }

    /// All operations known to this member, oldest first
    pub fn list(&self) -> Vec<Operation> {
        let mut operations: Vec<_> = self
            .inner
            .operations
            .read()
            .values()
            .map(|op| op.snapshot())
            .collect();
        operations.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        operations
    }

    /// Drop terminal operations whose retention window has passed
    pub async fn reap_expired(&self) -> usize {
        let retention = self.inner.config.retention;
        let now = Instant::now();

        let expired: Vec<String> = {
            let mut operations = self.inner.operations.write();
            let expired: Vec<String> = operations
                .values()
                .filter(|op| {
                    op.finished_at()
                        .is_some_and(|finished| now.duration_since(finished) >= retention)
                })
                .map(|op| op.id.clone())
                .collect();

            for id in &expired {
                operations.remove(id);
            }
            expired
        };

        for id in &expired {
            if let Err(e) = self.inner.registry.forget(id).await {
                warn!("Failed to forget operation {}: {}", id, e);
            }
        }

        expired.len()
    }

    fn lookup(&self, id: &str) -> OperationResult<Arc<OperationInner>> {
        self.inner
            .operations
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| OperationError::NotFound(id.to_string()))
    }

    async fn force_cancel(&self, op: &Arc<OperationInner>) {
        if let Some(abort) = op.abort.lock().take() {
            abort.abort();
        }

        if op.transition(
            OperationStatus::Cancelled,
            Some(CANCELLED_MESSAGE.to_string()),
        ) {
            warn!(
                "Operation {} did not observe cancellation, abandoning its work",
                op.id
            );
            self.publish(op).await;
        }
    }

    async fn publish(&self, op: &OperationInner) {
        let status = op.status();
        if let Err(e) = self.inner.registry.update_status(&op.id, status).await {
            warn!("Failed to record status {:?} for operation {}: {}", status, op.id, e);
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => message.to_string(),
            Err(_) => "unknown panic".to_string(),
        },
    }
}
