//! Error-kind to HTTP-status mapping, centralized.
//!
//! Handlers return `Result<_, ApiError>`; the body always carries the
//! structured `error` kind and, for denials, the enumerated `reason`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::common::OrchestratorError;
use crate::registry::RouterError;

pub struct ApiError(pub OrchestratorError);

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, reason) = match &self.0 {
            OrchestratorError::Conflict(_) => (StatusCode::CONFLICT, None),
            OrchestratorError::NotFound(_) => (StatusCode::NOT_FOUND, None),
            OrchestratorError::AdmissionDenied(reason) => {
                (StatusCode::TOO_MANY_REQUESTS, Some(reason.to_string()))
            }
            OrchestratorError::NotLeader => (StatusCode::SERVICE_UNAVAILABLE, None),
            OrchestratorError::Expired => (StatusCode::GONE, None),
            OrchestratorError::Transient(_) => (StatusCode::INTERNAL_SERVER_ERROR, None),
            OrchestratorError::Config(_) | OrchestratorError::Fatal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, None)
            }
        };

        let body = ErrorBody {
            error: self.0.to_string(),
            reason,
        };
        (status, Json(body)).into_response()
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        ApiError(e)
    }
}

impl From<crate::store::StoreError> for ApiError {
    fn from(e: crate::store::StoreError) -> Self {
        ApiError(e.into())
    }
}

/// Router errors keep their own mapping: both lookup failures are the
/// caller's addressing problem, transport problems are gateway-shaped.
pub fn router_error_response(e: RouterError) -> Response {
    let (status, error) = match &e {
        RouterError::NoAgent(_) => (StatusCode::NOT_FOUND, "no_agent"),
        RouterError::NoTool { .. } => (StatusCode::NOT_FOUND, "no_tool"),
        RouterError::Transport { .. } => (StatusCode::BAD_GATEWAY, "transport"),
        RouterError::Timeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
    };
    (
        status,
        Json(serde_json::json!({ "error": error, "detail": e.to_string() })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::DenialReason;

    fn status_of(e: OrchestratorError) -> StatusCode {
        ApiError(e).into_response().status()
    }

    #[test]
    fn denials_are_429() {
        assert_eq!(
            status_of(OrchestratorError::AdmissionDenied(
                DenialReason::GpuPressureHigh
            )),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[test]
    fn duplicate_mismatch_is_409() {
        assert_eq!(
            status_of(OrchestratorError::Conflict("payload mismatch".into())),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn not_leader_is_503() {
        assert_eq!(
            status_of(OrchestratorError::NotLeader),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn expired_lease_is_410() {
        assert_eq!(status_of(OrchestratorError::Expired), StatusCode::GONE);
    }

    #[test]
    fn transient_is_5xx() {
        assert!(status_of(OrchestratorError::Transient("io".into()))
            .is_server_error());
    }
}
