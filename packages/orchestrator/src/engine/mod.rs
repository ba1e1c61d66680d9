//! Orchestrator engine.
//!
//! Owns admission policy, the lease path, pool lifecycle (leader-gated),
//! job submission, and the reconciliation loop. State lives in the store;
//! work rides the bus; this module decides.

pub mod admission;
pub mod devices;
pub mod metrics;
pub mod reconciler;

pub use admission::Admission;
pub use devices::{select_device, DeviceSnapshot, GpuSampler, StaticGpuSampler};
pub use metrics::Metrics;
pub use reconciler::Reconciler;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::bus::{BusEntry, BusError, EventBus, Stream};
use crate::common::{ids, DenialReason, OrchestratorError};
use crate::config::Config;
use crate::registry::AgentRegistry;
use crate::store::{
    Lease, LeaseMode, LeaseSpec, LockHandle, PoolSpec, PoolStatus, Store, StoreError, WorkerPool,
};

impl From<StoreError> for OrchestratorError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(m) => OrchestratorError::Conflict(m),
            StoreError::Unknown => OrchestratorError::NotFound("row not found".to_string()),
            StoreError::Expired => OrchestratorError::Expired,
            StoreError::AlreadyClaimed { status } => {
                OrchestratorError::Conflict(format!("job already claimed (status {})", status))
            }
            StoreError::IllegalTransition(m) => OrchestratorError::Conflict(m),
            StoreError::Transient(e) => OrchestratorError::Transient(e.to_string()),
            StoreError::Fatal(m) => OrchestratorError::Fatal(m),
        }
    }
}

impl From<BusError> for OrchestratorError {
    fn from(e: BusError) -> Self {
        match e {
            BusError::Transient(m) => OrchestratorError::Transient(m),
            BusError::Encoding(m) => OrchestratorError::Transient(format!("bad bus entry: {}", m)),
            BusError::Config(m) => OrchestratorError::Fatal(m),
        }
    }
}

/// Leadership state shared between the election loop and the API surface.
///
/// The handle is only touched by the election loop; the flag is the fast
/// path every leader-gated operation reads.
#[derive(Default)]
pub struct Leadership {
    handle: Mutex<Option<LockHandle>>,
    flag: AtomicBool,
    last_loop_at: Mutex<Option<Instant>>,
}

impl Leadership {
    pub fn is_leader(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub(crate) fn assume(&self, handle: LockHandle) {
        *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        self.flag.store(true, Ordering::SeqCst);
    }

    pub(crate) fn resign(&self) -> Option<LockHandle> {
        self.flag.store(false, Ordering::SeqCst);
        self.handle.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub(crate) fn handle(&self) -> Option<LockHandle> {
        self.handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn touch_loop(&self) {
        *self.last_loop_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
    }

    /// Whether the election loop has reported in recently.
    pub fn loop_healthy(&self, within: std::time::Duration) -> bool {
        self.last_loop_at
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map(|at| at.elapsed() <= within)
            .unwrap_or(false)
    }
}

/// A lease request as it arrives from an agent.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct LeaseRequest {
    pub agent: String,
    #[builder(default = 0)]
    pub min_memory_mb: u64,
    pub ttl_seconds: i64,
    #[builder(default = LeaseMode::Gpu)]
    pub mode: LeaseMode,
    #[builder(default, setter(strip_option))]
    pub model_id: Option<String>,
    #[builder(default, setter(strip_option))]
    pub pool_id: Option<Uuid>,
}

/// A job submission.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct SubmitRequest {
    /// Caller-supplied stable id; generated when absent.
    #[builder(default, setter(strip_option))]
    pub job_id: Option<String>,
    pub job_type: String,
    pub payload: serde_json::Value,
    /// Rate-limit key; anonymous submitters share one bucket.
    #[builder(default, setter(strip_option))]
    pub agent: Option<String>,
    #[builder(default, setter(strip_option))]
    pub pool_id: Option<Uuid>,
}

/// What a successful submit returns.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitReceipt {
    pub job_id: String,
    /// True when an identical submission already existed.
    pub deduplicated: bool,
    /// Bus message id of this delivery.
    pub msg_id: String,
}

/// The scheduler.
pub struct Orchestrator {
    store: Store,
    bus: Arc<dyn EventBus>,
    registry: Arc<AgentRegistry>,
    sampler: Arc<dyn GpuSampler>,
    admission: Admission,
    metrics: Arc<Metrics>,
    leadership: Leadership,
    node_id: String,
    strict_model_store: bool,
    available_models: HashSet<String>,
    /// Admission + device selection critical section. The store is the
    /// final authority, but serializing here keeps selection stable under
    /// concurrent requests in one process.
    scheduling: tokio::sync::Mutex<()>,
}

impl Orchestrator {
    pub fn new(
        store: Store,
        bus: Arc<dyn EventBus>,
        registry: Arc<AgentRegistry>,
        sampler: Arc<dyn GpuSampler>,
        metrics: Arc<Metrics>,
        config: &Config,
    ) -> Self {
        Self {
            admission: Admission::new(config.policy.clone()),
            store,
            bus,
            registry,
            sampler,
            metrics,
            leadership: Leadership::default(),
            node_id: config.node_id.clone(),
            strict_model_store: config.policy.strict_model_store,
            available_models: config.available_models.iter().cloned().collect(),
            scheduling: tokio::sync::Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn leadership(&self) -> &Leadership {
        &self.leadership
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    fn deny(&self, reason: DenialReason) -> OrchestratorError {
        self.metrics
            .admission_denials
            .with_label_values(&[reason.as_str()])
            .inc();
        OrchestratorError::AdmissionDenied(reason)
    }

    fn require_leader(&self) -> Result<(), OrchestratorError> {
        if self.leadership.is_leader() {
            Ok(())
        } else {
            Err(OrchestratorError::NotLeader)
        }
    }

    fn check_model(&self, model_id: Option<&str>) -> Result<(), DenialReason> {
        if !self.strict_model_store {
            return Ok(());
        }
        match model_id {
            Some(model) if !self.available_models.contains(model) => {
                Err(DenialReason::ModelUnavailable)
            }
            _ => Ok(()),
        }
    }

    /// Grant a lease, applying the admission chain in order: agent rate,
    /// global pressure, model availability, device selection, store insert.
    ///
    /// CPU-mode requests skip the device-related checks entirely.
    pub async fn lease_gpu(&self, req: &LeaseRequest) -> Result<Lease, OrchestratorError> {
        let _guard = self.scheduling.lock().await;

        self.admission
            .check_rate(&req.agent)
            .map_err(|r| self.deny(r))?;

        let device_index = match req.mode {
            LeaseMode::Cpu => {
                self.check_model(req.model_id.as_deref())
                    .map_err(|r| self.deny(r))?;
                None
            }
            LeaseMode::Gpu => {
                let devices = self.sampler.sample();
                let max_utilization = devices
                    .iter()
                    .map(|d| d.utilization_pct)
                    .fold(0.0_f64, f64::max);
                self.admission
                    .check_pressure(max_utilization)
                    .map_err(|r| self.deny(r))?;

                self.check_model(req.model_id.as_deref())
                    .map_err(|r| self.deny(r))?;

                let lease_counts = self.store.active_lease_counts_by_device().await?;
                let selected = select_device(&devices, &lease_counts, req.min_memory_mb)
                    .ok_or_else(|| self.deny(DenialReason::NoDeviceAvailable))?;
                Some(selected)
            }
        };

        let spec = LeaseSpec {
            agent: req.agent.clone(),
            device_index,
            mode: req.mode,
            ttl_seconds: req.ttl_seconds,
            pool_id: req.pool_id,
            model_id: req.model_id.clone(),
            metadata: serde_json::json!({}),
        };

        let lease = match self.store.put_lease(&spec).await {
            Ok(lease) => lease,
            // The slot is already held by this agent: a quota problem, not
            // a transport one.
            Err(StoreError::Conflict(_)) => return Err(self.deny(DenialReason::QuotaExceeded)),
            Err(e) => return Err(e.into()),
        };

        self.metrics.leases_granted.inc();
        info!(
            token = %lease.token,
            agent = %lease.agent,
            device = ?lease.device_index,
            mode = ?lease.mode,
            "lease granted"
        );
        Ok(lease)
    }

    /// Refresh a lease; `Expired` tells the caller to abort its work.
    pub async fn heartbeat_lease(&self, token: Uuid) -> Result<Lease, OrchestratorError> {
        match self.store.extend_lease(token).await {
            Ok(lease) => Ok(lease),
            Err(StoreError::Unknown) => Err(OrchestratorError::NotFound(format!(
                "no lease with token {}",
                token
            ))),
            Err(StoreError::Expired) => Err(OrchestratorError::Expired),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn release_lease(&self, token: Uuid) -> Result<(), OrchestratorError> {
        self.store.release_lease(token).await.map_err(Into::into)
    }

    /// Persist and dispatch a job. Idempotent on job id: an identical
    /// resubmission appends another delivery but never a second row.
    pub async fn submit_job(&self, req: &SubmitRequest) -> Result<SubmitReceipt, OrchestratorError> {
        let submitter = req.agent.as_deref().unwrap_or("anonymous");
        self.admission
            .check_rate(submitter)
            .map_err(|r| self.deny(r))?;

        if let Some(pool_id) = req.pool_id {
            let pool = self
                .store
                .find_pool(pool_id)
                .await?
                .ok_or_else(|| OrchestratorError::NotFound(format!("no pool {}", pool_id)))?;
            if !pool.status.accepts_jobs() {
                return Err(OrchestratorError::Conflict(format!(
                    "pool {} is {} and accepts no new jobs",
                    pool_id, pool.status
                )));
            }
        }

        let job_id = req
            .job_id
            .clone()
            .unwrap_or_else(ids::new_job_id);

        let outcome = self
            .store
            .put_job(&job_id, &req.job_type, &req.payload, req.pool_id)
            .await?;
        let job = outcome.job();

        let mut entry = BusEntry::job(&job_id, &req.job_type, req.payload.clone());
        entry.attempts = job.attempts;
        entry.pool_id = req.pool_id;
        let stream = stream_for_job_type(&req.job_type);

        // A pool-addressed delivery is consumed from the pool's own group;
        // create it before appending so the entry cannot slip past it.
        if let Some(pool_id) = req.pool_id {
            if stream == Stream::InferenceJobs {
                self.bus
                    .ensure_group(stream, &Stream::pool_group(pool_id), false)
                    .await?;
            }
        }

        let msg_id = self.bus.append(stream, &entry).await?;

        if outcome.is_created() {
            self.metrics.jobs_submitted.inc();
        }
        info!(
            job_id = %job_id,
            job_type = %req.job_type,
            stream = %stream,
            deduplicated = !outcome.is_created(),
            "job submitted"
        );

        Ok(SubmitReceipt {
            job_id,
            deduplicated: !outcome.is_created(),
            msg_id,
        })
    }

    /// Create a pool and ask workers to preload its model. Leader-only:
    /// pool lifecycle has a single writer.
    pub async fn request_pool(&self, spec: &PoolSpec) -> Result<WorkerPool, OrchestratorError> {
        self.require_leader()?;

        let pool = self.store.create_pool(spec).await?;
        self.bus
            .ensure_group(Stream::InferenceJobs, &Stream::pool_group(pool.id), false)
            .await?;
        self.bus
            .append(Stream::Preloads, &preload_entry(&pool, pool.desired_workers))
            .await?;

        info!(pool_id = %pool.id, model = %pool.model_id, "pool requested");
        Ok(pool)
    }

    pub async fn drain_pool(&self, pool_id: Uuid) -> Result<WorkerPool, OrchestratorError> {
        self.require_leader()?;
        let pool = self.store.set_pool_status(pool_id, PoolStatus::Draining).await?;
        info!(pool_id = %pool_id, "pool draining");
        Ok(pool)
    }

    pub async fn evict_pool(&self, pool_id: Uuid) -> Result<WorkerPool, OrchestratorError> {
        self.require_leader()?;
        let pool = self.store.set_pool_status(pool_id, PoolStatus::Evicted).await?;
        warn!(pool_id = %pool_id, "pool evicted");
        Ok(pool)
    }

    /// One election attempt: take the cluster lock if it is free or
    /// expired. Returns whether this node is now the leader.
    pub async fn try_become_leader(&self) -> Result<bool, OrchestratorError> {
        if self.leadership.is_leader() {
            return Ok(true);
        }
        let ttl = self.store.policy().leader_lock_ttl_seconds;
        match self
            .store
            .try_acquire_lock(crate::store::LEADER_LOCK_NAME, &self.node_id, ttl)
            .await?
        {
            Some(handle) => {
                info!(node_id = %self.node_id, "leadership acquired");
                self.leadership.assume(handle);
                self.metrics.is_leader.set(1);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Voluntary step-down: release the lock and stop enforcing.
    pub async fn step_down(&self) -> Result<(), OrchestratorError> {
        if let Some(handle) = self.leadership.resign() {
            self.metrics.is_leader.set(0);
            self.store.release_lock(&handle).await?;
            info!(node_id = %self.node_id, "stepped down");
        }
        Ok(())
    }

    /// Admin trigger for one reconciliation pass. No-op on a follower;
    /// returns whether a pass ran.
    pub async fn reconcile_now(&self) -> Result<bool, OrchestratorError> {
        if !self.leadership.is_leader() {
            return Ok(false);
        }
        reconciler::tick(self).await?;
        Ok(true)
    }
}

/// Dispatch partition for a job type.
pub fn stream_for_job_type(job_type: &str) -> Stream {
    if job_type.starts_with("ingest") {
        Stream::IngestEvents
    } else {
        Stream::InferenceJobs
    }
}

pub(crate) fn preload_entry(pool: &WorkerPool, deficit: i32) -> BusEntry {
    BusEntry::control(
        "preload",
        serde_json::json!({
            "pool_id": pool.id,
            "model_id": pool.model_id,
            "adapter_id": pool.adapter_id,
            "workers": deficit,
        }),
    )
}
