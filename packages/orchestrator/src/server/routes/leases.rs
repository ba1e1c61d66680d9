//! Lease grant, heartbeat, and release.

use axum::extract::{Extension, Path};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::LeaseRequest;
use crate::server::app::AppState;
use crate::server::error::ApiError;
use crate::store::LeaseMode;

#[derive(Deserialize)]
pub struct LeaseBody {
    pub agent: String,
    #[serde(default)]
    pub min_memory_mb: u64,
    pub ttl_seconds: i64,
    #[serde(default = "default_mode")]
    pub mode: LeaseModeBody,
    pub model_id: Option<String>,
    pub pool_id: Option<Uuid>,
}

#[derive(Deserialize, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum LeaseModeBody {
    Gpu,
    Cpu,
}

fn default_mode() -> LeaseModeBody {
    LeaseModeBody::Gpu
}

impl From<LeaseModeBody> for LeaseMode {
    fn from(mode: LeaseModeBody) -> Self {
        match mode {
            LeaseModeBody::Gpu => LeaseMode::Gpu,
            LeaseModeBody::Cpu => LeaseMode::Cpu,
        }
    }
}

#[derive(Serialize)]
pub struct LeaseResponse {
    pub token: Uuid,
    pub gpu_index: Option<i32>,
    pub mode: LeaseMode,
    pub expires_at: DateTime<Utc>,
}

/// `POST /leases` — run the admission chain and reserve a device slot.
pub async fn request_lease_handler(
    Extension(state): Extension<AppState>,
    Json(body): Json<LeaseBody>,
) -> Result<Json<LeaseResponse>, ApiError> {
    let request = LeaseRequest {
        agent: body.agent,
        min_memory_mb: body.min_memory_mb,
        ttl_seconds: body.ttl_seconds,
        mode: body.mode.into(),
        model_id: body.model_id,
        pool_id: body.pool_id,
    };
    let lease = state.orchestrator.lease_gpu(&request).await?;

    Ok(Json(LeaseResponse {
        token: lease.token,
        gpu_index: lease.device_index,
        mode: lease.mode,
        expires_at: lease.expires_at,
    }))
}

#[derive(Serialize)]
pub struct HeartbeatResponse {
    pub expires_at: DateTime<Utc>,
}

/// `POST /leases/{token}/heartbeat` — 410 once the lease is gone.
pub async fn heartbeat_lease_handler(
    Extension(state): Extension<AppState>,
    Path(token): Path<Uuid>,
) -> Result<Json<HeartbeatResponse>, ApiError> {
    let lease = state.orchestrator.heartbeat_lease(token).await?;
    Ok(Json(HeartbeatResponse {
        expires_at: lease.expires_at,
    }))
}

/// `POST /leases/{token}/release` — idempotent.
pub async fn release_lease_handler(
    Extension(state): Extension<AppState>,
    Path(token): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.orchestrator.release_lease(token).await?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}
