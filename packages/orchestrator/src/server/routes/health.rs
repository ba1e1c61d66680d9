//! Liveness, readiness, and metrics exposition.

use axum::extract::Extension;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::bus::EventBus;
use crate::server::app::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    database: ComponentHealth,
    event_bus: ComponentHealth,
    leader: bool,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ComponentHealth {
    fn ok() -> Self {
        Self {
            status: "ok".to_string(),
            error: None,
        }
    }

    fn error(e: impl std::fmt::Display) -> Self {
        Self {
            status: "error".to_string(),
            error: Some(e.to_string()),
        }
    }

    fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// Liveness detail: database, bus, and leadership at a glance.
///
/// Returns 200 when both backends answer, 503 otherwise.
pub async fn health_handler(
    Extension(state): Extension<AppState>,
) -> (StatusCode, Json<HealthResponse>) {
    let database = match tokio::time::timeout(
        std::time::Duration::from_secs(5),
        state.orchestrator.store().ping(),
    )
    .await
    {
        Ok(Ok(())) => ComponentHealth::ok(),
        Ok(Err(e)) => ComponentHealth::error(e),
        Err(_) => ComponentHealth::error("query timeout (>5s)"),
    };

    let event_bus = match tokio::time::timeout(
        std::time::Duration::from_secs(5),
        state.orchestrator.bus().ping(),
    )
    .await
    {
        Ok(Ok(())) => ComponentHealth::ok(),
        Ok(Err(e)) => ComponentHealth::error(e),
        Err(_) => ComponentHealth::error("ping timeout (>5s)"),
    };

    let healthy = database.is_ok() && event_bus.is_ok();
    let response = HealthResponse {
        status: if healthy { "ok" } else { "degraded" }.to_string(),
        database,
        event_bus,
        leader: state.orchestrator.leadership().is_leader(),
    };

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(response))
}

/// Readiness gate: the store answers, the bus answers when required, and
/// the election loop has reported in recently.
pub async fn ready_handler(Extension(state): Extension<AppState>) -> StatusCode {
    if state.orchestrator.store().ping().await.is_err() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }

    if state.require_bus && state.orchestrator.bus().ping().await.is_err() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }

    let interval = state.orchestrator.store().policy().reconcile_interval_seconds;
    let window = std::time::Duration::from_secs(interval.saturating_mul(3).max(5));
    if !state.orchestrator.leadership().loop_healthy(window) {
        return StatusCode::SERVICE_UNAVAILABLE;
    }

    StatusCode::OK
}

/// Prometheus text exposition.
pub async fn metrics_handler(Extension(state): Extension<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.orchestrator.metrics().export(),
    )
}
