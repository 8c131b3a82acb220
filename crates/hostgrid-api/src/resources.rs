//! Resource control handlers.
//!
//! Every kind shares one surface under `/api/v1/resources/{kind}`. Anything
//! that starts a workflow answers 202 with the record as it stands before
//! the workflow completes.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use serde::Deserialize;

use hostgrid_control::{ControlError, MigrateOptions, NewResource};
use hostgrid_ledger::{Config, ResourceKind, ResourceQuery};

use crate::ApiState;
use crate::response::{control_error, respond};

fn parse_kind(kind: &str) -> Result<ResourceKind, Response> {
    kind.parse::<ResourceKind>()
        .map_err(|e| control_error(ControlError::NotFound(e)))
}

/// POST /api/v1/resources/{kind}
pub async fn create_resource(
    State(state): State<ApiState>,
    Path(kind): Path<String>,
    Json(req): Json<NewResource>,
) -> Response {
    let kind = match parse_kind(&kind) {
        Ok(kind) => kind,
        Err(resp) => return resp,
    };
    respond(state.plane.lifecycle().create(kind, req).await, StatusCode::ACCEPTED)
}

/// GET /api/v1/resources/{kind}
pub async fn list_resources(
    State(state): State<ApiState>,
    Path(kind): Path<String>,
    Query(query): Query<ResourceQuery>,
) -> Response {
    let kind = match parse_kind(&kind) {
        Ok(kind) => kind,
        Err(resp) => return resp,
    };
    respond(state.plane.lifecycle().list(kind, &query), StatusCode::OK)
}

/// GET /api/v1/resources/{kind}/{id}
pub async fn get_resource(
    State(state): State<ApiState>,
    Path((kind, id)): Path<(String, String)>,
) -> Response {
    let kind = match parse_kind(&kind) {
        Ok(kind) => kind,
        Err(resp) => return resp,
    };
    respond(state.plane.lifecycle().get(kind, &id), StatusCode::OK)
}

/// PATCH /api/v1/resources/{kind}/{id}
pub async fn update_resource(
    State(state): State<ApiState>,
    Path((kind, id)): Path<(String, String)>,
    Json(patch): Json<Config>,
) -> Response {
    let kind = match parse_kind(&kind) {
        Ok(kind) => kind,
        Err(resp) => return resp,
    };
    respond(state.plane.lifecycle().update(kind, &id, patch).await, StatusCode::ACCEPTED)
}

/// DELETE /api/v1/resources/{kind}/{id}
pub async fn delete_resource(
    State(state): State<ApiState>,
    Path((kind, id)): Path<(String, String)>,
) -> Response {
    let kind = match parse_kind(&kind) {
        Ok(kind) => kind,
        Err(resp) => return resp,
    };
    respond(state.plane.lifecycle().delete(kind, &id).await, StatusCode::ACCEPTED)
}

/// POST /api/v1/resources/{kind}/{id}/retry
pub async fn retry_resource(
    State(state): State<ApiState>,
    Path((kind, id)): Path<(String, String)>,
) -> Response {
    let kind = match parse_kind(&kind) {
        Ok(kind) => kind,
        Err(resp) => return resp,
    };
    respond(state.plane.retry(kind, &id).await, StatusCode::ACCEPTED)
}

/// Suspend request body.
#[derive(Debug, Default, Deserialize)]
pub struct SuspendRequest {
    #[serde(default)]
    pub reason: String,
}

/// POST /api/v1/resources/{kind}/{id}/suspend
pub async fn suspend_resource(
    State(state): State<ApiState>,
    Path((kind, id)): Path<(String, String)>,
    Json(req): Json<SuspendRequest>,
) -> Response {
    let kind = match parse_kind(&kind) {
        Ok(kind) => kind,
        Err(resp) => return resp,
    };
    respond(
        state.plane.lifecycle().suspend(kind, &id, &req.reason).await,
        StatusCode::ACCEPTED,
    )
}

/// POST /api/v1/resources/{kind}/{id}/unsuspend
pub async fn unsuspend_resource(
    State(state): State<ApiState>,
    Path((kind, id)): Path<(String, String)>,
) -> Response {
    let kind = match parse_kind(&kind) {
        Ok(kind) => kind,
        Err(resp) => return resp,
    };
    respond(state.plane.lifecycle().unsuspend(kind, &id).await, StatusCode::ACCEPTED)
}

/// Migrate request body.
#[derive(Debug, Deserialize)]
pub struct MigrateRequest {
    pub target_shard_id: String,
    #[serde(flatten)]
    pub options: MigrateOptions,
}

/// POST /api/v1/resources/{kind}/{id}/migrate
pub async fn migrate_resource(
    State(state): State<ApiState>,
    Path((kind, id)): Path<(String, String)>,
    Json(req): Json<MigrateRequest>,
) -> Response {
    let kind = match parse_kind(&kind) {
        Ok(kind) => kind,
        Err(resp) => return resp,
    };
    respond(
        state
            .plane
            .migrations()
            .migrate(kind, &id, &req.target_shard_id, req.options)
            .await,
        StatusCode::ACCEPTED,
    )
}

/// POST /api/v1/resources/{kind}/{id}/enable
pub async fn enable_resource(
    State(state): State<ApiState>,
    Path((kind, id)): Path<(String, String)>,
) -> Response {
    set_enabled(state, kind, id, true).await
}

/// POST /api/v1/resources/{kind}/{id}/disable
pub async fn disable_resource(
    State(state): State<ApiState>,
    Path((kind, id)): Path<(String, String)>,
) -> Response {
    set_enabled(state, kind, id, false).await
}

async fn set_enabled(state: ApiState, kind: String, id: String, enabled: bool) -> Response {
    let kind = match parse_kind(&kind) {
        Ok(kind) => kind,
        Err(resp) => return resp,
    };
    respond(
        state.plane.lifecycle().set_enabled(kind, &id, enabled).await,
        StatusCode::ACCEPTED,
    )
}

// ── Tenants ────────────────────────────────────────────────────

/// POST /api/v1/tenants/{id}/retry-failed
pub async fn retry_failed(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    respond(state.plane.retry_failed(&id).await, StatusCode::ACCEPTED)
}

/// GET /api/v1/tenants/{id}/resource-summary
pub async fn resource_summary(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    respond(state.plane.tenant_summary(&id), StatusCode::OK)
}

// ── Workflows ──────────────────────────────────────────────────

/// GET /api/v1/workflows/{key}
pub async fn workflow_status(State(state): State<ApiState>, Path(key): Path<String>) -> Response {
    respond(state.plane.workflow_status(&key).await, StatusCode::OK)
}
