//! API request handlers.
//!
//! Responses use view types that render derived ids as hex strings.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use reef_reconcile::{DeleteOutcome, VolumeError};
use reef_types::{
    Node, NodeId, PendingCleanup, Pool, PoolId, Protocol, ReplicaState, Volume, VolumeId,
    VolumePolicy, VolumeSpec, VolumeStatus,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::api::AppState;
use crate::api::error::ApiError;

// -----------------------------------------------------------------------
// Views
// -----------------------------------------------------------------------

/// A replica as rendered by the API.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ReplicaView {
    pub id: String,
    pub node: String,
    pub pool: String,
    pub state: ReplicaState,
}

/// A published target as rendered by the API.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct TargetView {
    pub node: String,
    pub protocol: Protocol,
    pub nexus: String,
    pub endpoint: Option<String>,
}

/// A volume as rendered by the API.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct VolumeView {
    pub id: String,
    pub status: VolumeStatus,
    pub size: u64,
    pub replica_count: u8,
    pub self_heal: bool,
    pub replicas: Vec<ReplicaView>,
    pub target: Option<TargetView>,
    pub created_at_ms: u64,
}

impl From<Volume> for VolumeView {
    fn from(volume: Volume) -> Self {
        let target = match (&volume.target, &volume.nexus) {
            (Some(target), Some(nexus)) => Some(TargetView {
                node: target.node.to_string(),
                protocol: target.protocol,
                nexus: nexus.id.to_string(),
                endpoint: nexus.target.as_ref().map(|t| t.endpoint.clone()),
            }),
            _ => None,
        };
        Self {
            id: volume.id.to_string(),
            status: volume.status,
            size: volume.spec.size,
            replica_count: volume.spec.replicas,
            self_heal: volume.spec.policy.self_heal,
            replicas: volume
                .replicas
                .into_iter()
                .map(|r| ReplicaView {
                    id: r.id.to_string(),
                    node: r.node.to_string(),
                    pool: r.pool.to_string(),
                    state: r.state,
                })
                .collect(),
            target,
            created_at_ms: volume.created_at_ms,
        }
    }
}

/// A pending-cleanup ledger entry as rendered by the API.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct CleanupView {
    pub key: String,
    pub task: String,
    pub node: String,
    pub volume: String,
    pub attempts: u32,
    pub timeouts: u32,
    pub next_attempt_ms: u64,
    pub last_error: Option<String>,
}

impl From<PendingCleanup> for CleanupView {
    fn from(entry: PendingCleanup) -> Self {
        Self {
            key: entry.key().to_string(),
            task: entry.task.kind().to_string(),
            node: entry.task.node().to_string(),
            volume: entry.task.volume().to_string(),
            attempts: entry.attempts,
            timeouts: entry.timeouts,
            next_attempt_ms: entry.next_attempt_ms,
            last_error: entry.last_error,
        }
    }
}

// -----------------------------------------------------------------------
// Nodes
// -----------------------------------------------------------------------

/// `GET /v0/nodes`
pub(crate) async fn list_nodes(State(state): State<AppState>) -> Json<Vec<Node>> {
    Json(state.service.registry().nodes())
}

/// `POST /v0/nodes/{node}/heartbeat`
///
/// Unknown nodes are registered.
pub(crate) async fn heartbeat(
    State(state): State<AppState>,
    Path(node): Path<String>,
) -> StatusCode {
    let node = NodeId::new(node);
    if state.service.registry().record_heartbeat(&node) {
        info!(%node, "node reachable after heartbeat");
    }
    StatusCode::NO_CONTENT
}

/// Body of `PUT /v0/nodes/{node}/liveness`.
#[derive(Debug, Deserialize)]
pub(crate) struct LivenessRequest {
    pub reachable: bool,
}

/// `PUT /v0/nodes/{node}/liveness`
///
/// Switches the node's in-process agent on or off and moves the node in
/// the registry accordingly.
pub(crate) async fn set_liveness(
    State(state): State<AppState>,
    Path(node): Path<String>,
    Json(body): Json<LivenessRequest>,
) -> Result<Json<Node>, ApiError> {
    let node = NodeId::new(node);
    let registry = state.service.registry();
    if let Some(agent) = state.fleet.get(&node) {
        agent.set_online(body.reachable);
    }
    let changed = if body.reachable {
        registry.mark_reachable(&node)?
    } else {
        registry.mark_unreachable(&node)?
    };
    if changed {
        info!(%node, reachable = body.reachable, "node liveness changed");
    }
    let current = registry
        .get(&node)
        .ok_or(reef_cluster::ClusterError::NodeNotFound(node))?;
    Ok(Json(current))
}

/// Body of `PUT /v0/nodes/{node}/pools/{pool}`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct PoolRequest {
    pub disks: Vec<String>,
}

/// `PUT /v0/nodes/{node}/pools/{pool}`
pub(crate) async fn put_pool(
    State(state): State<AppState>,
    Path((node, pool)): Path<(String, String)>,
    Json(body): Json<PoolRequest>,
) -> Result<Json<Pool>, ApiError> {
    let pool = state
        .service
        .put_node_pool(&NodeId::new(node), &PoolId::new(pool), body.disks)
        .await?;
    Ok(Json(pool))
}

// -----------------------------------------------------------------------
// Volumes
// -----------------------------------------------------------------------

/// `GET /v0/volumes`
pub(crate) async fn list_volumes(
    State(state): State<AppState>,
) -> Result<Json<Vec<VolumeView>>, ApiError> {
    let volumes = state.service.list_volumes()?;
    Ok(Json(volumes.into_iter().map(VolumeView::from).collect()))
}

/// Body of `PUT /v0/volumes/{id}`.
#[derive(Debug, Deserialize)]
pub(crate) struct VolumeRequest {
    pub size: u64,
    pub replicas: u8,
    #[serde(default)]
    pub self_heal: bool,
}

/// `PUT /v0/volumes/{id}`
pub(crate) async fn put_volume(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<VolumeRequest>,
) -> Result<Json<VolumeView>, ApiError> {
    let spec = VolumeSpec {
        size: body.size,
        replicas: body.replicas,
        policy: VolumePolicy {
            self_heal: body.self_heal,
        },
    };
    let volume = state.service.put_volume(&VolumeId::new(id), spec).await?;
    Ok(Json(volume.into()))
}

/// `GET /v0/volumes/{id}`
pub(crate) async fn get_volume(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<VolumeView>, ApiError> {
    let volume = state.service.get_volume(&VolumeId::new(id))?;
    Ok(Json(volume.into()))
}

/// `DELETE /v0/volumes/{id}`
///
/// `204` once the record is gone, even if some teardown was deferred.
/// `404` if there was nothing to delete.
pub(crate) async fn delete_volume(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = VolumeId::new(id);
    match state.service.delete_volume(&id).await? {
        DeleteOutcome::Deleted(report) => {
            info!(
                volume = %id,
                destroyed = report.destroyed.len(),
                deferred = report.deferred.len(),
                "delete_volume"
            );
            Ok(StatusCode::NO_CONTENT.into_response())
        }
        DeleteOutcome::NotFound => Err(VolumeError::NotFound(id).into()),
    }
}

/// Body of `PUT /v0/volumes/{id}/target`.
#[derive(Debug, Deserialize)]
pub(crate) struct TargetRequest {
    pub node: String,
    pub protocol: String,
}

/// `PUT /v0/volumes/{id}/target`
pub(crate) async fn put_target(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<TargetRequest>,
) -> Result<Json<VolumeView>, ApiError> {
    let protocol: Protocol = body.protocol.parse().map_err(|e| ApiError::InvalidRequest {
        message: format!("{e}"),
    })?;
    let volume = state
        .service
        .put_volume_target(&VolumeId::new(id), &NodeId::new(body.node), protocol)
        .await?;
    Ok(Json(volume.into()))
}

/// `DELETE /v0/volumes/{id}/target`
pub(crate) async fn delete_target(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<VolumeView>, ApiError> {
    let volume = state.service.del_volume_target(&VolumeId::new(id)).await?;
    Ok(Json(volume.into()))
}

// -----------------------------------------------------------------------
// Ledger
// -----------------------------------------------------------------------

/// `GET /v0/cleanups`
pub(crate) async fn list_cleanups(
    State(state): State<AppState>,
) -> Result<Json<Vec<CleanupView>>, ApiError> {
    let entries = state.service.pending_cleanups()?;
    Ok(Json(entries.into_iter().map(CleanupView::from).collect()))
}
