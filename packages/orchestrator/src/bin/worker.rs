// Worker process entry: consumes the bus and executes agent tool calls
// under leases.

use std::sync::Arc;

use orchestrator_core::bus::{EventBus, RedisEventBus};
use orchestrator_core::config::{exit_code, Config};
use orchestrator_core::engine::{GpuSampler, Metrics, Orchestrator, StaticGpuSampler};
use orchestrator_core::registry::AgentRegistry;
use orchestrator_core::store::Store;
use orchestrator_core::worker::{
    run_tool_call, HandlerRegistry, ResourceNeeds, ToolCallJob, WorkerRuntime,
    WorkerRuntimeConfig,
};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Job types this worker serves out of the box. Inference rides a GPU
/// lease; ingest events run without one.
fn build_handler_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register::<ToolCallJob, _, _>("infer", ResourceNeeds::gpu(0, None), run_tool_call);
    registry.register::<ToolCallJob, _, _>("ingest_event", ResourceNeeds::none(), run_tool_call);
    registry
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,orchestrator_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let code = run().await;
    std::process::exit(code);
}

async fn run() -> i32 {
    tracing::info!("Starting Newsdesk worker");

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "configuration error");
            return exit_code::CONFIG;
        }
    };

    let pool = match PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
    {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!(error = %e, "database unreachable");
            return exit_code::STORE_UNREACHABLE;
        }
    };

    let bus: Arc<dyn EventBus> = match RedisEventBus::connect(&config.redis_url).await {
        Ok(bus) => Arc::new(bus),
        Err(e) => {
            tracing::error!(error = %e, "event bus unreachable");
            return if config.policy.require_bus {
                exit_code::BUS_UNREACHABLE
            } else {
                exit_code::TRANSIENT
            };
        }
    };

    let store = Store::new(pool, config.policy.clone());
    let sampler = Arc::new(StaticGpuSampler::from_specs(&config.devices));
    let registry = Arc::new(AgentRegistry::new());
    let metrics = Arc::new(Metrics::new());
    // The worker embeds a follower engine: any orchestrator may grant or
    // extend leases, only the leader enforces pools.
    let orchestrator = Arc::new(Orchestrator::new(
        store,
        bus,
        registry,
        sampler as Arc<dyn GpuSampler>,
        metrics,
        &config,
    ));

    let handlers = Arc::new(build_handler_registry());
    let worker_config = WorkerRuntimeConfig {
        lease_ttl_seconds: config.policy.max_lease_ttl_seconds.min(300) as i64,
        ..WorkerRuntimeConfig::default()
    };
    tracing::info!(
        worker_id = %worker_config.worker_id,
        job_types = ?handlers.registered_types(),
        "worker configured"
    );

    let runtime = WorkerRuntime::new(orchestrator, handlers, worker_config);

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            shutdown.cancel();
        }
    });

    match runtime.run(shutdown).await {
        Ok(()) => exit_code::OK,
        Err(e) => {
            tracing::error!(error = %e, "worker runtime failed");
            exit_code::TRANSIENT
        }
    }
}
