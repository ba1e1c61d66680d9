//! Test harness with testcontainers for integration testing.
//!
//! Containers are started once per test binary and shared; every test gets
//! its own Postgres database (created on the shared instance) and its own
//! Redis logical database, so stream keys and the leader lock never bleed
//! between tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use orchestrator_core::bus::{EventBus, RedisEventBus};
use orchestrator_core::config::{Config, DeviceSpec, Policy};
use orchestrator_core::engine::{GpuSampler, Metrics, Orchestrator, StaticGpuSampler};
use orchestrator_core::registry::AgentRegistry;
use orchestrator_core::store::{JobStatus, Store};
use orchestrator_core::worker::{HandlerRegistry, WorkerRuntime, WorkerRuntimeConfig};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use test_context::AsyncTestContext;
use testcontainers::core::{ContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};
use testcontainers_modules::redis::Redis;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

/// Shared test infrastructure that persists across all tests in a binary.
struct SharedTestInfra {
    pg_base_url: String,
    redis_base_url: String,
    // Keep containers alive for the entire test run
    _postgres: ContainerAsync<GenericImage>,
    _redis: ContainerAsync<Redis>,
}

static SHARED_INFRA: OnceCell<SharedTestInfra> = OnceCell::const_new();

/// Per-binary sequence for database names and Redis logical db indices.
/// Test binaries run one at a time, so indices never collide across them.
static TEST_SEQ: AtomicUsize = AtomicUsize::new(0);

impl SharedTestInfra {
    async fn init() -> Result<Self> {
        // Respect RUST_LOG when debugging tests; ignore double-init.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let postgres = GenericImage::new("postgres", "16")
            .with_wait_for(WaitFor::message_on_stderr(
                "database system is ready to accept connections",
            ))
            .with_exposed_port(ContainerPort::Tcp(5432))
            .with_env_var("POSTGRES_PASSWORD", "postgres")
            .with_env_var("POSTGRES_USER", "postgres")
            .with_env_var("POSTGRES_DB", "postgres")
            .start()
            .await
            .context("Failed to start Postgres container")?;

        let pg_host = postgres.get_host().await?;
        let pg_port = postgres.get_host_port_ipv4(5432).await?;
        let pg_base_url = format!("postgresql://postgres:postgres@{}:{}", pg_host, pg_port);

        let redis = Redis::default()
            .start()
            .await
            .context("Failed to start Redis container")?;

        let redis_host = redis.get_host().await?;
        let redis_port = redis.get_host_port_ipv4(6379).await?;
        let redis_base_url = format!("redis://{}:{}", redis_host, redis_port);

        Ok(Self {
            pg_base_url,
            redis_base_url,
            _postgres: postgres,
            _redis: redis,
        })
    }

    async fn get() -> &'static Self {
        SHARED_INFRA
            .get_or_init(|| async {
                Self::init()
                    .await
                    .expect("Failed to initialize shared test infrastructure")
            })
            .await
    }
}

/// One test's isolated slice of the shared infrastructure.
pub struct TestHarness {
    pub config: Config,
    pub pool: PgPool,
    pub store: Store,
    pub bus: Arc<dyn EventBus>,
    pub sampler: Arc<StaticGpuSampler>,
    pub orchestrator: Arc<Orchestrator>,
}

impl TestHarness {
    /// Default policy, one 24 GiB device.
    pub async fn new() -> Result<Self> {
        Self::with_policy(test_policy(), vec![device(0, 24_576)], Vec::new()).await
    }

    /// Custom policy/inventory/model store.
    pub async fn with_policy(
        policy: Policy,
        devices: Vec<DeviceSpec>,
        available_models: Vec<String>,
    ) -> Result<Self> {
        let infra = SharedTestInfra::get().await;
        let seq = TEST_SEQ.fetch_add(1, Ordering::SeqCst);

        // Fresh database on the shared instance.
        let db_name = format!("orchestrator_test_{}", seq);
        let admin = PgPoolOptions::new()
            .max_connections(1)
            .connect(&format!("{}/postgres", infra.pg_base_url))
            .await
            .context("Failed to connect for database creation")?;
        sqlx::query(&format!("CREATE DATABASE {}", db_name))
            .execute(&admin)
            .await
            .context("Failed to create test database")?;

        let database_url = format!("{}/{}", infra.pg_base_url, db_name);
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&database_url)
            .await
            .context("Failed to connect to test database")?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Failed to run migrations")?;

        // Fresh Redis logical database, flushed in case of index reuse.
        let redis_url = format!("{}/{}", infra.redis_base_url, seq % 16);
        let client = redis::Client::open(redis_url.as_str())?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        let _: String = redis::cmd("FLUSHDB").query_async(&mut conn).await?;

        let config = Config {
            database_url,
            redis_url: redis_url.clone(),
            port: 0,
            node_id: format!("test-node-{}", seq),
            devices,
            available_models,
            policy,
        };

        let bus: Arc<dyn EventBus> = Arc::new(RedisEventBus::connect(&redis_url).await?);
        let store = Store::new(pool.clone(), config.policy.clone());
        let sampler = Arc::new(StaticGpuSampler::from_specs(&config.devices));
        let orchestrator = build_orchestrator(&config, &store, &bus, &sampler, None);

        Ok(Self {
            config,
            pool,
            store,
            bus,
            sampler,
            orchestrator,
        })
    }

    /// A second engine on the same store/bus, e.g. the failover peer.
    pub fn peer_orchestrator(&self, node_id: &str) -> Arc<Orchestrator> {
        build_orchestrator(
            &self.config,
            &self.store,
            &self.bus,
            &self.sampler,
            Some(node_id),
        )
    }
}

fn build_orchestrator(
    config: &Config,
    store: &Store,
    bus: &Arc<dyn EventBus>,
    sampler: &Arc<StaticGpuSampler>,
    node_id: Option<&str>,
) -> Arc<Orchestrator> {
    let mut config = config.clone();
    if let Some(node_id) = node_id {
        config.node_id = node_id.to_string();
    }
    Arc::new(Orchestrator::new(
        store.clone(),
        Arc::clone(bus),
        Arc::new(AgentRegistry::new()),
        Arc::clone(sampler) as Arc<dyn GpuSampler>,
        Arc::new(Metrics::new()),
        &config,
    ))
}

impl AsyncTestContext for TestHarness {
    async fn setup() -> Self {
        TestHarness::new()
            .await
            .expect("Failed to set up test harness")
    }

    async fn teardown(self) {
        self.pool.close().await;
    }
}

/// Policy with intervals tightened for tests.
pub fn test_policy() -> Policy {
    Policy {
        max_lease_ttl_seconds: 60,
        lease_heartbeat_grace_seconds: 6,
        job_claim_idle_ms: 500,
        job_max_attempts: 3,
        per_agent_rate: 100.0,
        per_agent_burst: 100.0,
        pool_hold_seconds_default: 60,
        pool_drain_grace_seconds: 5,
        leader_lock_ttl_seconds: 2,
        reconcile_interval_seconds: 1,
        ..Policy::default()
    }
}

pub fn device(index: i32, total_memory_mb: u64) -> DeviceSpec {
    DeviceSpec {
        index,
        total_memory_mb,
    }
}

/// Spawn a worker runtime on its own task; cancel the token to stop it.
pub fn spawn_worker(
    orchestrator: Arc<Orchestrator>,
    handlers: HandlerRegistry,
    worker_id: &str,
) -> (CancellationToken, tokio::task::JoinHandle<Result<()>>) {
    let config = WorkerRuntimeConfig {
        block: Duration::from_millis(200),
        lease_ttl_seconds: 30,
        ..WorkerRuntimeConfig::with_worker_id(worker_id)
    };
    spawn_worker_with_config(orchestrator, handlers, config)
}

/// Spawn a worker scoped to one pool's inference consumer group.
pub fn spawn_pool_worker(
    orchestrator: Arc<Orchestrator>,
    handlers: HandlerRegistry,
    worker_id: &str,
    pool_id: uuid::Uuid,
) -> (CancellationToken, tokio::task::JoinHandle<Result<()>>) {
    let config = WorkerRuntimeConfig {
        streams: vec![orchestrator_core::bus::Stream::InferenceJobs],
        block: Duration::from_millis(200),
        lease_ttl_seconds: 30,
        pool_scope: Some(pool_id),
        ..WorkerRuntimeConfig::with_worker_id(worker_id)
    };
    spawn_worker_with_config(orchestrator, handlers, config)
}

fn spawn_worker_with_config(
    orchestrator: Arc<Orchestrator>,
    handlers: HandlerRegistry,
    config: WorkerRuntimeConfig,
) -> (CancellationToken, tokio::task::JoinHandle<Result<()>>) {
    let runtime = WorkerRuntime::new(orchestrator, Arc::new(handlers), config);
    let token = CancellationToken::new();
    let handle = tokio::spawn(runtime.run(token.clone()));
    (token, handle)
}

/// Poll until the job reaches the wanted status or the deadline passes.
pub async fn wait_for_job_status(
    store: &Store,
    job_id: &str,
    status: JobStatus,
    timeout: Duration,
) -> Result<orchestrator_core::store::Job> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(job) = store.find_job(job_id).await? {
            if job.status == status {
                return Ok(job);
            }
            if job.status.is_terminal() && job.status != status {
                bail!(
                    "job '{}' terminated as {} while waiting for {}",
                    job_id,
                    job.status,
                    status
                );
            }
        }
        if Instant::now() >= deadline {
            bail!("timed out waiting for job '{}' to reach {}", job_id, status);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
