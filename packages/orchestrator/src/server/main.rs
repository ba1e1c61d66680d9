// Main entry point for the orchestrator server.

use std::sync::Arc;

use orchestrator_core::bus::{EventBus, RedisEventBus, Stream};
use orchestrator_core::config::{exit_code, Config};
use orchestrator_core::engine::{GpuSampler, Metrics, Orchestrator, Reconciler, StaticGpuSampler};
use orchestrator_core::registry::{AgentRegistry, AgentRouter};
use orchestrator_core::server::{build_app, AppState};
use orchestrator_core::store::Store;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

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
    tracing::info!("Starting Newsdesk GPU orchestrator");

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "configuration error");
            return exit_code::CONFIG;
        }
    };
    tracing::info!(node_id = %config.node_id, devices = config.devices.len(), "configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = match PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
    {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!(error = %e, "database unreachable");
            return exit_code::STORE_UNREACHABLE;
        }
    };

    tracing::info!("Running database migrations...");
    if let Err(e) = sqlx::migrate!("./migrations").run(&pool).await {
        tracing::error!(error = %e, "migrations failed");
        return exit_code::STORE_UNREACHABLE;
    }

    tracing::info!("Connecting to event bus...");
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
    for stream in Stream::ALL {
        if let Err(e) = bus.ensure_group(stream, stream.default_group(), true).await {
            tracing::error!(stream = %stream, error = %e, "failed to ensure consumer group");
            return if config.policy.require_bus {
                exit_code::BUS_UNREACHABLE
            } else {
                exit_code::TRANSIENT
            };
        }
    }

    let store = Store::new(pool, config.policy.clone());
    let sampler = Arc::new(StaticGpuSampler::from_specs(&config.devices));
    let registry = Arc::new(AgentRegistry::new());
    let metrics = Arc::new(Metrics::new());
    let orchestrator = Arc::new(Orchestrator::new(
        store,
        bus,
        registry,
        Arc::clone(&sampler) as Arc<dyn GpuSampler>,
        metrics,
        &config,
    ));
    let router = Arc::new(AgentRouter::new(Arc::clone(orchestrator.registry())));

    let shutdown = CancellationToken::new();
    let reconciler = Reconciler::new(Arc::clone(&orchestrator));
    let reconciler_handle = tokio::spawn(reconciler.run(shutdown.child_token()));

    let state = AppState {
        orchestrator,
        router,
        sampler,
        require_bus: config.policy.require_bus,
    };
    let app = build_app(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "failed to bind");
            return exit_code::TRANSIENT;
        }
    };
    tracing::info!("Listening on {}", addr);
    tracing::info!("Readiness probe: http://localhost:{}/ready", config.port);
    tracing::info!("Metrics: http://localhost:{}/metrics", config.port);

    let serve = axum::serve(listener, app).with_graceful_shutdown({
        let shutdown = shutdown.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            shutdown.cancel();
        }
    });

    let code = match serve.await {
        Ok(()) => exit_code::OK,
        Err(e) => {
            tracing::error!(error = %e, "server error");
            exit_code::TRANSIENT
        }
    };

    shutdown.cancel();
    let _ = reconciler_handle.await;
    code
}
