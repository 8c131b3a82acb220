//! Response envelope and error mapping shared by every handler.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::warn;

use hostgrid_control::ControlError;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
pub(crate) struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub(crate) fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

pub(crate) fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

/// HTTP status for each error category.
pub(crate) fn status_for(e: &ControlError) -> StatusCode {
    match e {
        ControlError::Validation(_) => StatusCode::BAD_REQUEST,
        ControlError::NotFound(_) => StatusCode::NOT_FOUND,
        ControlError::Precondition(_) => StatusCode::CONFLICT,
        ControlError::WorkflowStart(_) => StatusCode::SERVICE_UNAVAILABLE,
        ControlError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        ControlError::Ledger(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub(crate) fn control_error(e: ControlError) -> Response {
    let status = status_for(&e);
    if status.is_server_error() {
        warn!(error = %e, %status, "request failed");
    }
    error_response(&e.to_string(), status)
}

/// Wrap a result in the envelope with `status`, or map its error.
pub(crate) fn respond<T: Serialize>(result: Result<T, ControlError>, status: StatusCode) -> Response {
    match result {
        Ok(data) => (status, ApiResponse::ok(data)).into_response(),
        Err(e) => control_error(e),
    }
}

/// Like [`respond`], but the payload is returned without the envelope.
pub(crate) fn respond_raw<T: Serialize>(result: Result<T, ControlError>) -> Response {
    match result {
        Ok(data) => Json(data).into_response(),
        Err(e) => control_error(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_map_to_statuses() {
        assert_eq!(status_for(&ControlError::Validation("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&ControlError::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&ControlError::Precondition("x".into())), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&ControlError::WorkflowStart("x".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
