//! Admin control endpoints.

use axum::extract::{Extension, Query};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::server::app::AppState;
use crate::server::error::ApiError;
use crate::store::AuditEvent;

/// `POST /control/reconcile` — admin trigger; no-op on a follower.
pub async fn reconcile_handler(
    Extension(state): Extension<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let ran = state.orchestrator.reconcile_now().await?;
    Ok(Json(serde_json::json!({ "status": "ok", "ran": ran })))
}

#[derive(Deserialize)]
pub struct PoolTarget {
    pub pool_id: Uuid,
}

/// `POST /control/drain_pool` — leader-only.
pub async fn drain_pool_handler(
    Extension(state): Extension<AppState>,
    Json(body): Json<PoolTarget>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let pool = state.orchestrator.drain_pool(body.pool_id).await?;
    Ok(Json(serde_json::json!({ "status": "ok", "pool_status": pool.status })))
}

/// `POST /control/evict_pool` — leader-only, terminal.
pub async fn evict_pool_handler(
    Extension(state): Extension<AppState>,
    Json(body): Json<PoolTarget>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let pool = state.orchestrator.evict_pool(body.pool_id).await?;
    Ok(Json(serde_json::json!({ "status": "ok", "pool_status": pool.status })))
}

#[derive(Deserialize)]
pub struct AuditQuery {
    pub limit: Option<i64>,
}

/// `GET /audit` — most recent audit rows, newest first.
pub async fn recent_audit_handler(
    Extension(state): Extension<AppState>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Vec<AuditEvent>>, ApiError> {
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    let events = state.orchestrator.store().recent_audit(limit).await?;
    Ok(Json(events))
}

#[derive(Deserialize)]
pub struct DeviceTelemetryBody {
    pub index: i32,
    pub used_memory_mb: u64,
    pub utilization_pct: f64,
}

/// `POST /control/device_telemetry` — feed from the GPU monitoring agent.
pub async fn device_telemetry_handler(
    Extension(state): Extension<AppState>,
    Json(body): Json<DeviceTelemetryBody>,
) -> Json<serde_json::Value> {
    state
        .sampler
        .update(body.index, body.used_memory_mb, body.utilization_pct);
    Json(serde_json::json!({ "status": "ok" }))
}
