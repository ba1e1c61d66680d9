//! Agent router API: registration and synchronous tool dispatch.

use axum::extract::Extension;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use crate::registry::{AgentInfo, ToolCall};
use crate::server::app::AppState;
use crate::server::error::router_error_response;

#[derive(Deserialize)]
pub struct RegisterBody {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub tools: Vec<String>,
}

/// `POST /register` — overwrite semantics; re-registering doubles as a
/// heartbeat.
pub async fn register_handler(
    Extension(state): Extension<AppState>,
    Json(body): Json<RegisterBody>,
) -> Json<serde_json::Value> {
    state
        .orchestrator
        .registry()
        .register(&body.name, &body.address, body.tools);
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Deserialize)]
pub struct DeregisterBody {
    pub name: String,
}

/// `POST /deregister` — idempotent removal.
pub async fn deregister_handler(
    Extension(state): Extension<AppState>,
    Json(body): Json<DeregisterBody>,
) -> Json<serde_json::Value> {
    state.orchestrator.registry().deregister(&body.name);
    Json(serde_json::json!({ "status": "ok" }))
}

/// `GET /agents`
pub async fn list_agents_handler(
    Extension(state): Extension<AppState>,
) -> Json<Vec<AgentInfo>> {
    Json(state.orchestrator.registry().list_agents())
}

#[derive(Deserialize)]
pub struct CallBody {
    #[serde(flatten)]
    pub call: ToolCall,
    pub timeout_ms: Option<u64>,
}

/// `POST /call` — exact-name routing, structured errors.
pub async fn call_handler(
    Extension(state): Extension<AppState>,
    Json(body): Json<CallBody>,
) -> Response {
    let timeout = body.timeout_ms.map(std::time::Duration::from_millis);
    match state.router.call(&body.call, timeout).await {
        Ok(result) => Json(serde_json::json!({ "status": "ok", "result": result })).into_response(),
        Err(e) => router_error_response(e),
    }
}
