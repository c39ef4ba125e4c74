//! HTTP routes

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{Json, Path, Query, State};
use axum::routing::{delete, get, post, put};
use chrono::{DateTime, Utc};
use hearth_cluster::{
    ClusterMember, DEFAULT_PROJECT, ErrorKind, JoinToken, MemberRegistry, NewMember, SCHEMA_VERSION,
    api_url, is_true, now_millis, resolve_address,
};
use hearth_instances::{SnapshotManager, SnapshotRequest};
use hearth_network::{AllocationAggregator, AllocationFilter};
use hearth_operations::{Operation, OperationClass, OperationEngine, OperationError, Resources};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::response::{ApiError, ApiResponse, ApiResult};

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    /// Membership and roles
    pub registry: Arc<MemberRegistry>,
    /// Local operations
    pub engine: OperationEngine,
    /// Network allocation ledger
    pub allocations: Arc<AllocationAggregator>,
    /// Snapshot commands
    pub snapshots: SnapshotManager,
    /// Address advertised in join tokens
    pub address: String,
    /// Certificate fingerprint advertised in join tokens
    pub certificate_fingerprint: Option<String>,
    /// Members silent for longer are reported offline
    pub offline_threshold: Duration,
}

/// Build the API router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/1.0/network-allocations", get(network_allocations))
        .route("/1.0/operations", get(list_operations))
        .route(
            "/1.0/operations/{id}",
            get(get_operation).delete(cancel_operation),
        )
        .route("/1.0/operations/{id}/wait", get(wait_operation))
        .route(
            "/1.0/cluster/members",
            get(list_members).post(request_join_token),
        )
        .route("/1.0/cluster/members/{name}", delete(remove_member))
        .route("/1.0/cluster/join", post(join_cluster))
        .route("/1.0/instances/{name}", put(restore_instance))
        .route(
            "/1.0/instances/{name}/snapshots",
            get(list_snapshots).post(create_snapshot),
        )
        .route(
            "/1.0/instances/{name}/snapshots/{snapshot}",
            post(rename_snapshot).delete(delete_snapshot),
        )
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ProjectQuery {
    project: Option<String>,
    #[serde(rename = "all-projects")]
    all_projects: Option<String>,
}

impl ProjectQuery {
    fn project(&self) -> &str {
        match self.project.as_deref() {
            Some(project) if !project.is_empty() => project,
            _ => DEFAULT_PROJECT,
        }
    }
}

async fn network_allocations(
    State(state): State<AppState>,
    Query(query): Query<ProjectQuery>,
) -> ApiResult {
    let filter = AllocationFilter {
        project: query.project().to_string(),
        all_projects: query.all_projects.as_deref().is_some_and(is_true),
    };

    let allocations = state.allocations.compute(&filter).await?;
    ApiResponse::sync(allocations)
}

async fn list_operations(State(state): State<AppState>) -> ApiResult {
    let mut grouped: BTreeMap<String, Vec<Operation>> = BTreeMap::new();
    for operation in state.engine.list() {
        grouped
            .entry(operation.status.to_string().to_lowercase())
            .or_default()
            .push(operation);
    }
    ApiResponse::sync(grouped)
}

async fn get_operation(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    match state.engine.get(&id) {
        Ok(operation) => ApiResponse::sync(operation),
        // Owned by another member; serve the replicated record
        Err(OperationError::NotFound(_)) => {
            let record = state
                .registry
                .store()
                .operation_record(&id, now_millis())?;
            ApiResponse::sync(record)
        }
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WaitQuery {
    timeout: Option<i64>,
}

async fn wait_operation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<WaitQuery>,
) -> ApiResult {
    let timeout = query
        .timeout
        .filter(|secs| *secs >= 0)
        .map(|secs| Duration::from_secs(secs.unsigned_abs()));

    let operation = state.engine.wait(&id, timeout).await?;
    ApiResponse::sync(operation)
}

async fn cancel_operation(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let operation = state.engine.cancel(&id).await?;
    ApiResponse::sync(operation)
}

#[derive(Debug, Serialize)]
struct MemberView {
    #[serde(flatten)]
    member: ClusterMember,
    url: String,
    resolved_address: String,
    status: &'static str,
}

async fn list_members(State(state): State<AppState>) -> ApiResult {
    let now = now_millis();
    let members: Vec<MemberView> = state
        .registry
        .members()
        .await?
        .into_iter()
        .map(|member| MemberView {
            url: api_url(&["cluster", "members", &member.name], ""),
            resolved_address: resolve_address(&member),
            status: if member.is_online(now, state.offline_threshold) {
                "Online"
            } else {
                "Offline"
            },
            member,
        })
        .collect();
    ApiResponse::sync(members)
}

async fn remove_member(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult {
    let changes = state.registry.remove(&name).await?;
    ApiResponse::sync(json!({ "role_changes": changes }))
}

#[derive(Debug, Deserialize)]
struct JoinTokenRequest {
    server_name: String,
}

async fn request_join_token(
    State(state): State<AppState>,
    Json(request): Json<JoinTokenRequest>,
) -> ApiResult {
    if request.server_name.is_empty() {
        return Err(ApiError::bad_request("Server name cannot be empty"));
    }
    if state.address.is_empty() {
        return Err(ApiError::bad_request("This member is not clustered"));
    }
    let Some(fingerprint) = state.certificate_fingerprint.clone() else {
        return Err(ApiError::bad_request(
            "This member has no certificate fingerprint configured",
        ));
    };

    let taken = state
        .registry
        .members()
        .await?
        .iter()
        .any(|member| member.name == request.server_name);
    if taken {
        return Err(ApiError::new(
            ErrorKind::Conflict,
            format!("The cluster already has a member with name {:?}", request.server_name),
        ));
    }

    let token = JoinToken {
        server_name: request.server_name.clone(),
        fingerprint,
        addresses: vec![state.address.clone()],
        secret: uuid::Uuid::new_v4().simple().to_string(),
        expires_at: None,
    };
    let encoded = token.encode()?;

    let mut resources = Resources::new();
    resources.insert("cluster".to_string(), vec![api_url(&["cluster"], "")]);
    let handle = state
        .engine
        .create(OperationClass::Token, "Requesting a join token", resources)
        .await?;

    let progress = handle.progress();
    progress.set_field("serverName", json!(token.server_name));
    progress.set_field("secret", json!(token.secret));
    progress.set_field("fingerprint", json!(token.fingerprint));
    progress.set_field("addresses", json!(token.addresses));
    progress.set_field("token", json!(encoded));

    info!("Issued join token for {}", token.server_name);
    Ok(ApiResponse::Async(handle.snapshot()))
}

#[derive(Debug, Deserialize)]
struct JoinRequest {
    server_name: String,
    address: String,
    secret: String,
    #[serde(default)]
    schema_version: Option<u32>,
    #[serde(default)]
    certificate_fingerprint: Option<String>,
}

fn matches_join_request(operation: &Operation, request: &JoinRequest) -> bool {
    operation.class == OperationClass::Token
        && !operation.status.is_final()
        && operation.metadata.get("serverName").and_then(|v| v.as_str())
            == Some(request.server_name.as_str())
        && operation.metadata.get("secret").and_then(|v| v.as_str()) == Some(request.secret.as_str())
}

async fn join_cluster(State(state): State<AppState>, Json(request): Json<JoinRequest>) -> ApiResult {
    let Some(token) = state
        .engine
        .list()
        .into_iter()
        .find(|operation| matches_join_request(operation, &request))
    else {
        return Err(ApiError::new(
            ErrorKind::InvalidToken,
            "No matching cluster join operation found",
        ));
    };

    let member = state
        .registry
        .join(NewMember {
            name: request.server_name.clone(),
            address: request.address.clone(),
            schema_version: request.schema_version.unwrap_or(SCHEMA_VERSION),
            certificate_fingerprint: request.certificate_fingerprint.clone(),
        })
        .await?;

    state.engine.complete_token(&token.id, Ok(())).await?;
    ApiResponse::sync(member)
}

async fn list_snapshots(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<ProjectQuery>,
) -> ApiResult {
    let project = query.project();
    let store = state.registry.store();
    let urls: Vec<String> = store
        .transaction(store.transaction_timeout(), |tx| {
            tx.instance(project, &name)?;
            Ok(tx
                .snapshots(project, &name)
                .into_iter()
                .map(|snapshot| {
                    api_url(&["instances", &name, "snapshots", &snapshot.name], project)
                })
                .collect())
        })
        .await?;
    ApiResponse::sync(urls)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SnapshotsPost {
    name: String,
    stateful: bool,
    expires_at: Option<DateTime<Utc>>,
    reuse: bool,
}

async fn create_snapshot(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<ProjectQuery>,
    Json(body): Json<SnapshotsPost>,
) -> ApiResult {
    let request = SnapshotRequest {
        name: body.name,
        stateful: body.stateful,
        expires_at: body.expires_at.map(|at| at.timestamp_millis()),
        reuse: body.reuse,
    };
    let handle = state
        .snapshots
        .create_snapshot(query.project(), &name, request)
        .await?;
    Ok(ApiResponse::Async(handle.snapshot()))
}

async fn delete_snapshot(
    State(state): State<AppState>,
    Path((name, snapshot)): Path<(String, String)>,
    Query(query): Query<ProjectQuery>,
) -> ApiResult {
    let handle = state
        .snapshots
        .delete_snapshot(query.project(), &name, &snapshot)
        .await?;
    Ok(ApiResponse::Async(handle.snapshot()))
}

#[derive(Debug, Deserialize)]
struct SnapshotPost {
    name: String,
}

async fn rename_snapshot(
    State(state): State<AppState>,
    Path((name, snapshot)): Path<(String, String)>,
    Query(query): Query<ProjectQuery>,
    Json(body): Json<SnapshotPost>,
) -> ApiResult {
    let handle = state
        .snapshots
        .rename_snapshot(query.project(), &name, &snapshot, &body.name)
        .await?;
    Ok(ApiResponse::Async(handle.snapshot()))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct InstancePut {
    restore: String,
    stateful: bool,
}

async fn restore_instance(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<ProjectQuery>,
    Json(body): Json<InstancePut>,
) -> ApiResult {
    // Accept both "snap0" and "u1/snap0"
    let snapshot = body
        .restore
        .strip_prefix(&format!("{name}/"))
        .unwrap_or(&body.restore)
        .to_string();
    if snapshot.is_empty() {
        return Err(ApiError::bad_request("Only snapshot restore is supported"));
    }

    let handle = state
        .snapshots
        .restore_snapshot(query.project(), &name, &snapshot, body.stateful)
        .await?;
    Ok(ApiResponse::Async(handle.snapshot()))
}
