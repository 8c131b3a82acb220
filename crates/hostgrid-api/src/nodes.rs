//! Node agent protocol handlers, mounted under `/internal/nodes`.
//!
//! Payloads are returned bare, without the API envelope, since agents
//! consume the documents directly. The node id always comes from the path.

use axum::Json;
use axum::extract::{Path, State};
use axum::response::Response;
use serde::Deserialize;

use hostgrid_control::ControlError;
use hostgrid_ledger::{DriftEvent, HealthReport};

use crate::ApiState;
use crate::response::respond_raw;

/// GET /internal/nodes/{id}/desired-state
pub async fn desired_state(State(state): State<ApiState>, Path(node_id): Path<String>) -> Response {
    respond_raw(
        state
            .plane
            .gateway()
            .desired_state(&node_id)
            .map_err(ControlError::from),
    )
}

/// POST /internal/nodes/{id}/health
pub async fn report_health(
    State(state): State<ApiState>,
    Path(node_id): Path<String>,
    Json(report): Json<HealthReport>,
) -> Response {
    respond_raw(
        state
            .plane
            .gateway()
            .report_health(&node_id, report)
            .map_err(ControlError::from),
    )
}

/// GET /internal/nodes/{id}/health
pub async fn get_health(State(state): State<ApiState>, Path(node_id): Path<String>) -> Response {
    respond_raw(state.plane.gateway().get_health(&node_id).map_err(ControlError::from))
}

/// Drift submission body.
#[derive(Debug, Deserialize)]
pub struct DriftRequest {
    #[serde(default)]
    pub events: Vec<DriftEvent>,
}

/// POST /internal/nodes/{id}/drift
pub async fn report_drift(
    State(state): State<ApiState>,
    Path(node_id): Path<String>,
    Json(req): Json<DriftRequest>,
) -> Response {
    respond_raw(
        state
            .plane
            .gateway()
            .report_drift(&node_id, req.events)
            .await
            .map_err(ControlError::from),
    )
}

/// GET /internal/nodes/{id}/drift
pub async fn list_drift(State(state): State<ApiState>, Path(node_id): Path<String>) -> Response {
    respond_raw(state.plane.gateway().list_drift(&node_id).map_err(ControlError::from))
}
