use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;

/// Process exit codes used by the binaries.
///
/// A supervisor treats `TRANSIENT` as retryable and everything else as a
/// configuration or dependency problem that needs operator attention.
pub mod exit_code {
    pub const OK: i32 = 0;
    pub const CONFIG: i32 = 64;
    pub const BUS_UNREACHABLE: i32 = 69;
    pub const STORE_UNREACHABLE: i32 = 70;
    pub const TRANSIENT: i32 = 75;
}

/// Scheduling policy knobs, loaded once at startup.
///
/// Every field has a default; operators override via environment. Readers
/// take the whole struct by reference — it is immutable after load.
#[derive(Debug, Clone)]
pub struct Policy {
    /// Upper bound on any lease's lifetime, counted from creation.
    pub max_lease_ttl_seconds: u64,
    /// Idle threshold after which an unheartbeated lease is reclaimable.
    pub lease_heartbeat_grace_seconds: u64,
    /// Idle threshold for pending bus entries before reclaim.
    pub job_claim_idle_ms: u64,
    /// Delivery attempts before a job is dead-lettered.
    pub job_max_attempts: i32,
    /// Admission gate closes when any device utilization crosses this.
    pub global_gpu_pressure_high_pct: f64,
    /// Admission gate reopens when all devices drop below this.
    pub global_gpu_pressure_low_pct: f64,
    /// Token-bucket steady rate per agent (tokens per second).
    pub per_agent_rate: f64,
    /// Token-bucket burst capacity per agent.
    pub per_agent_burst: f64,
    pub pool_hold_seconds_default: u64,
    pub pool_drain_grace_seconds: u64,
    pub leader_lock_ttl_seconds: u64,
    pub reconcile_interval_seconds: u64,
    /// When set, startup blocks on event-bus reachability.
    pub require_bus: bool,
    /// When set, lease requests fail if the required model is not loadable.
    pub strict_model_store: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_lease_ttl_seconds: 900,
            lease_heartbeat_grace_seconds: 60,
            job_claim_idle_ms: 60_000,
            job_max_attempts: 3,
            global_gpu_pressure_high_pct: 90.0,
            global_gpu_pressure_low_pct: 75.0,
            per_agent_rate: 5.0,
            per_agent_burst: 10.0,
            pool_hold_seconds_default: 300,
            pool_drain_grace_seconds: 30,
            leader_lock_ttl_seconds: 15,
            reconcile_interval_seconds: 5,
            require_bus: false,
            strict_model_store: false,
        }
    }
}

impl Policy {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs((self.lease_heartbeat_grace_seconds / 3).max(1))
    }

    pub fn leader_renew_interval(&self) -> Duration {
        Duration::from_secs((self.leader_lock_ttl_seconds / 3).max(1))
    }

    /// Outer watchdog for handlers that never check their cancellation flag.
    pub fn handler_watchdog(&self) -> Duration {
        Duration::from_secs(self.max_lease_ttl_seconds * 2)
    }
}

/// A GPU known to this orchestrator, as declared in `GPU_DEVICES`.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSpec {
    pub index: i32,
    pub total_memory_mb: u64,
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub port: u16,
    /// Stable identity for this orchestrator process (leader-lock holder).
    pub node_id: String,
    /// Declared GPU inventory, e.g. `GPU_DEVICES=0:24576,1:24576`.
    pub devices: Vec<DeviceSpec>,
    /// Models the lease path may require when `strict_model_store` is on.
    pub available_models: Vec<String>,
    pub policy: Policy,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Missing required keys are startup errors; unknown keys are ignored.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let policy = Policy {
            max_lease_ttl_seconds: parse_env("MAX_LEASE_TTL_SECONDS", 900)?,
            lease_heartbeat_grace_seconds: parse_env("LEASE_HEARTBEAT_GRACE_SECONDS", 60)?,
            job_claim_idle_ms: parse_env("JOB_CLAIM_IDLE_MS", 60_000)?,
            job_max_attempts: parse_env("JOB_MAX_ATTEMPTS", 3)?,
            global_gpu_pressure_high_pct: parse_env("GLOBAL_GPU_PRESSURE_HIGH_PCT", 90.0)?,
            global_gpu_pressure_low_pct: parse_env("GLOBAL_GPU_PRESSURE_LOW_PCT", 75.0)?,
            per_agent_rate: parse_env("PER_AGENT_RATE", 5.0)?,
            per_agent_burst: parse_env("PER_AGENT_BURST", 10.0)?,
            pool_hold_seconds_default: parse_env("POOL_HOLD_SECONDS_DEFAULT", 300)?,
            pool_drain_grace_seconds: parse_env("POOL_DRAIN_GRACE_SECONDS", 30)?,
            leader_lock_ttl_seconds: parse_env("LEADER_LOCK_TTL_SECONDS", 15)?,
            reconcile_interval_seconds: parse_env("RECONCILE_INTERVAL_SECONDS", 5)?,
            require_bus: parse_bool_env("REQUIRE_BUS", false)?,
            strict_model_store: parse_bool_env("STRICT_MODEL_STORE", false)?,
        };

        if policy.global_gpu_pressure_low_pct >= policy.global_gpu_pressure_high_pct {
            anyhow::bail!(
                "GLOBAL_GPU_PRESSURE_LOW_PCT ({}) must be below GLOBAL_GPU_PRESSURE_HIGH_PCT ({})",
                policy.global_gpu_pressure_low_pct,
                policy.global_gpu_pressure_high_pct
            );
        }

        if policy.job_max_attempts < 1 {
            anyhow::bail!("JOB_MAX_ATTEMPTS must be at least 1");
        }

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("PORT must be a valid number")?,
            node_id: env::var("NODE_ID")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| format!("orchestrator-{}", std::process::id())),
            devices: parse_devices(env::var("GPU_DEVICES").ok().as_deref())?,
            available_models: env::var("AVAILABLE_MODELS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            policy,
        })
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid {} value '{}': {}", name, value, e)),
        Err(_) => Ok(default),
    }
}

fn parse_bool_env(name: &str, default: bool) -> Result<bool> {
    match env::var(name) {
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            other => anyhow::bail!("invalid {} value '{}'", name, other),
        },
        Err(_) => Ok(default),
    }
}

/// Parse `GPU_DEVICES` of the form `index:total_mb,index:total_mb,...`.
///
/// An unset or empty variable means no GPUs; the orchestrator then only
/// grants CPU-mode leases.
fn parse_devices(raw: Option<&str>) -> Result<Vec<DeviceSpec>> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };

    let mut devices = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (index, total) = part
            .split_once(':')
            .with_context(|| format!("GPU_DEVICES entry '{}' must be index:total_mb", part))?;
        let index: i32 = index
            .trim()
            .parse()
            .with_context(|| format!("invalid device index in GPU_DEVICES entry '{}'", part))?;
        let total_memory_mb: u64 = total
            .trim()
            .parse()
            .with_context(|| format!("invalid memory in GPU_DEVICES entry '{}'", part))?;
        if devices.iter().any(|d: &DeviceSpec| d.index == index) {
            anyhow::bail!("duplicate device index {} in GPU_DEVICES", index);
        }
        devices.push(DeviceSpec {
            index,
            total_memory_mb,
        });
    }
    Ok(devices)
}
