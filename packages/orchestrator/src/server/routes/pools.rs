//! Worker pool API.

use axum::extract::Extension;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::server::app::AppState;
use crate::server::error::ApiError;
use crate::store::{PoolSpec, WorkerPool};

#[derive(Deserialize)]
pub struct PoolBody {
    pub agent: String,
    pub model_id: String,
    pub adapter_id: Option<String>,
    pub desired_workers: i32,
    pub hold_seconds: Option<i64>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Serialize)]
pub struct PoolResponse {
    pub pool_id: Uuid,
}

/// `POST /workers/pool` — leader-only; a follower answers 503.
pub async fn request_pool_handler(
    Extension(state): Extension<AppState>,
    Json(body): Json<PoolBody>,
) -> Result<Json<PoolResponse>, ApiError> {
    let metadata = if body.metadata.is_null() {
        serde_json::json!({})
    } else {
        body.metadata
    };
    let spec = PoolSpec {
        agent: body.agent,
        model_id: body.model_id,
        adapter_id: body.adapter_id,
        desired_workers: body.desired_workers,
        hold_seconds: body.hold_seconds,
        metadata,
    };
    let pool = state.orchestrator.request_pool(&spec).await?;
    Ok(Json(PoolResponse { pool_id: pool.id }))
}

/// `GET /workers/pools`
pub async fn list_pools_handler(
    Extension(state): Extension<AppState>,
) -> Result<Json<Vec<WorkerPool>>, ApiError> {
    let pools = state.orchestrator.store().list_pools(None).await?;
    Ok(Json(pools))
}
