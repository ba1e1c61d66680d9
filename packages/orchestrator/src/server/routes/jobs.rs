//! Job submission and status.

use axum::extract::{Extension, Path};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::SubmitRequest;
use crate::server::app::AppState;
use crate::server::error::ApiError;
use crate::store::Job;

#[derive(Deserialize)]
pub struct SubmitBody {
    pub job_id: Option<String>,
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Rate-limit key; optional for trusted internal producers.
    pub agent: Option<String>,
    pub pool_id: Option<Uuid>,
}

#[derive(Serialize)]
pub struct SubmitResponse {
    pub status: &'static str,
    pub job_id: String,
    pub deduplicated: bool,
}

/// `POST /jobs/submit` — idempotent on job id.
pub async fn submit_job_handler(
    Extension(state): Extension<AppState>,
    Json(body): Json<SubmitBody>,
) -> Result<Json<SubmitResponse>, ApiError> {
    let request = SubmitRequest {
        job_id: body.job_id,
        job_type: body.job_type,
        payload: body.payload,
        agent: body.agent,
        pool_id: body.pool_id,
    };
    let receipt = state.orchestrator.submit_job(&request).await?;

    Ok(Json(SubmitResponse {
        status: "ok",
        job_id: receipt.job_id,
        deduplicated: receipt.deduplicated,
    }))
}

/// `GET /jobs/{id}` — current row, including terminal state and last error.
pub async fn get_job_handler(
    Extension(state): Extension<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let job = state.orchestrator.store().get_job(&job_id).await?;
    Ok(Json(job))
}
