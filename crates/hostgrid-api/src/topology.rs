//! Topology administration handlers.
//!
//! Regions, clusters, shards and nodes are synchronous records with no
//! remote step, so these answer 200/201/204 directly.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use hostgrid_control::{ControlError, NewCluster, NewNode, NewRegion, NewShard};

use crate::ApiState;
use crate::response::{control_error, respond};

fn deleted(result: Result<(), ControlError>) -> Response {
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => control_error(e),
    }
}

// ── Regions ────────────────────────────────────────────────────

/// GET /api/v1/regions
pub async fn list_regions(State(state): State<ApiState>) -> Response {
    respond(state.plane.list_regions(), StatusCode::OK)
}

/// POST /api/v1/regions
pub async fn create_region(State(state): State<ApiState>, Json(req): Json<NewRegion>) -> Response {
    respond(state.plane.create_region(req), StatusCode::CREATED)
}

/// GET /api/v1/regions/{id}
pub async fn get_region(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    respond(state.plane.get_region(&id), StatusCode::OK)
}

/// DELETE /api/v1/regions/{id}
pub async fn delete_region(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    deleted(state.plane.delete_region(&id))
}

// ── Clusters ───────────────────────────────────────────────────

/// GET /api/v1/clusters
pub async fn list_clusters(State(state): State<ApiState>) -> Response {
    respond(state.plane.list_clusters(), StatusCode::OK)
}

/// POST /api/v1/clusters
pub async fn create_cluster(State(state): State<ApiState>, Json(req): Json<NewCluster>) -> Response {
    respond(state.plane.create_cluster(req), StatusCode::CREATED)
}

/// GET /api/v1/clusters/{id}
pub async fn get_cluster(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    respond(state.plane.get_cluster(&id), StatusCode::OK)
}

/// DELETE /api/v1/clusters/{id}
pub async fn delete_cluster(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    deleted(state.plane.delete_cluster(&id))
}

// ── Shards ─────────────────────────────────────────────────────

/// GET /api/v1/shards
pub async fn list_shards(State(state): State<ApiState>) -> Response {
    respond(state.plane.list_shards(), StatusCode::OK)
}

/// POST /api/v1/shards
pub async fn create_shard(State(state): State<ApiState>, Json(req): Json<NewShard>) -> Response {
    respond(state.plane.create_shard(req), StatusCode::CREATED)
}

/// GET /api/v1/shards/{id}
pub async fn get_shard(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    respond(state.plane.get_shard(&id), StatusCode::OK)
}

/// DELETE /api/v1/shards/{id}
pub async fn delete_shard(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    deleted(state.plane.delete_shard(&id))
}

/// POST /api/v1/shards/{id}/converge
pub async fn converge_shard(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let result = state
        .plane
        .request_converge(&id)
        .await
        .map(|()| serde_json::json!({ "shard_id": id, "status": "converge requested" }));
    respond(result, StatusCode::ACCEPTED)
}

/// GET /api/v1/shards/{id}/desired-state
pub async fn shard_desired_state(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let result = state.plane.orchestrator().desired_state(&id).map_err(ControlError::from);
    respond(result, StatusCode::OK)
}

/// GET /api/v1/shards/{id}/health
pub async fn shard_health(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let result = state.plane.gateway().shard_health(&id).map_err(ControlError::from);
    respond(result, StatusCode::OK)
}

// ── Nodes ──────────────────────────────────────────────────────

/// GET /api/v1/nodes
pub async fn list_nodes(State(state): State<ApiState>) -> Response {
    respond(state.plane.list_nodes(), StatusCode::OK)
}

/// POST /api/v1/nodes
pub async fn create_node(State(state): State<ApiState>, Json(req): Json<NewNode>) -> Response {
    respond(state.plane.create_node(req), StatusCode::CREATED)
}

/// GET /api/v1/nodes/{id}
pub async fn get_node(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    respond(state.plane.get_node(&id), StatusCode::OK)
}

/// DELETE /api/v1/nodes/{id}
pub async fn delete_node(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    deleted(state.plane.delete_node(&id))
}
