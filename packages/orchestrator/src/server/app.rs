//! Application setup and router assembly.

use std::sync::Arc;

use axum::extract::Extension;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::Method;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::engine::{Orchestrator, StaticGpuSampler};
use crate::registry::AgentRouter;
use crate::server::routes::{
    call_handler, deregister_handler, device_telemetry_handler, drain_pool_handler,
    evict_pool_handler, get_job_handler, health_handler, heartbeat_lease_handler,
    list_agents_handler, list_pools_handler, metrics_handler, ready_handler,
    recent_audit_handler, reconcile_handler, register_handler, release_lease_handler,
    request_lease_handler, request_pool_handler, submit_job_handler,
};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub router: Arc<AgentRouter>,
    /// Concrete sampler handle for the telemetry feed endpoint.
    pub sampler: Arc<StaticGpuSampler>,
    pub require_bus: bool,
}

/// Build the axum application.
pub fn build_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE]);

    Router::new()
        // Submission and control API
        .route("/jobs/submit", post(submit_job_handler))
        .route("/jobs/:job_id", get(get_job_handler))
        .route("/leases", post(request_lease_handler))
        .route("/leases/:token/heartbeat", post(heartbeat_lease_handler))
        .route("/leases/:token/release", post(release_lease_handler))
        .route("/workers/pool", post(request_pool_handler))
        .route("/workers/pools", get(list_pools_handler))
        .route("/control/reconcile", post(reconcile_handler))
        .route("/control/drain_pool", post(drain_pool_handler))
        .route("/control/evict_pool", post(evict_pool_handler))
        .route("/control/device_telemetry", post(device_telemetry_handler))
        .route("/audit", get(recent_audit_handler))
        // Agent router API
        .route("/register", post(register_handler))
        .route("/deregister", post(deregister_handler))
        .route("/agents", get(list_agents_handler))
        .route("/call", post(call_handler))
        // Probes and metrics (no auth, no rate limit)
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .layer(Extension(state))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
