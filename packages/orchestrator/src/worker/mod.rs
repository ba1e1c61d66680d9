//! Worker runtime.
//!
//! Stateless consumers that read the bus, move jobs through
//! `claimed -> running -> done|failed`, and hold a lease while agent code
//! runs. Duplicate deliveries are detected at the claim and acked without
//! work; retryable lease denials leave the message pending so the
//! reclaimer redrives it later.

pub mod handlers;

pub use handlers::{
    run_tool_call, HandlerRegistry, LeaseNeeds, ResourceNeeds, ToolCallJob, WorkerContext,
};

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{BusEntry, BusMessage, EventBus, Stream};
use crate::common::{ids, OrchestratorError};
use crate::engine::{LeaseRequest, Orchestrator};
use crate::registry::AgentRouter;
use crate::store::{Job, JobStatus, StoreError};

/// Configuration for one worker process.
#[derive(Debug, Clone)]
pub struct WorkerRuntimeConfig {
    /// Consumer name inside the group; must be unique per logical worker.
    pub worker_id: String,
    /// Streams this worker consumes.
    pub streams: Vec<Stream>,
    /// Maximum messages per read.
    pub batch_size: usize,
    /// Bounded block per read.
    pub block: Duration,
    /// TTL requested for execution leases.
    pub lease_ttl_seconds: i64,
    /// When set, inference deliveries are consumed from this pool's own
    /// consumer group, and only deliveries addressed to the pool are
    /// executed; everything else is acked untouched.
    pub pool_scope: Option<Uuid>,
}

impl Default for WorkerRuntimeConfig {
    fn default() -> Self {
        Self {
            worker_id: ids::new_worker_id(),
            streams: vec![Stream::InferenceJobs, Stream::IngestEvents, Stream::Preloads],
            batch_size: 10,
            block: Duration::from_secs(1),
            lease_ttl_seconds: 300,
            pool_scope: None,
        }
    }
}

impl WorkerRuntimeConfig {
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }

    /// Consumer group for one stream: the pool's own inference group when
    /// this worker is pool-scoped, the shared group otherwise.
    pub fn group_for(&self, stream: Stream) -> String {
        match (stream, self.pool_scope) {
            (Stream::InferenceJobs, Some(pool_id)) => Stream::pool_group(pool_id),
            _ => stream.default_group().to_string(),
        }
    }
}

/// Long-running consumer loop.
pub struct WorkerRuntime {
    orchestrator: Arc<Orchestrator>,
    handlers: Arc<HandlerRegistry>,
    router: Arc<AgentRouter>,
    config: WorkerRuntimeConfig,
}

impl WorkerRuntime {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        handlers: Arc<HandlerRegistry>,
        config: WorkerRuntimeConfig,
    ) -> Self {
        let router = Arc::new(AgentRouter::new(Arc::clone(orchestrator.registry())));
        Self {
            orchestrator,
            handlers,
            router,
            config,
        }
    }

    fn group_for(&self, stream: Stream) -> String {
        self.config.group_for(stream)
    }

    /// Run until shutdown is requested.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        for stream in &self.config.streams {
            let group = self.group_for(*stream);
            // Shared groups start from the beginning of the stream; a pool
            // group only cares about entries appended after its creation.
            let from_start = group == stream.default_group();
            self.orchestrator
                .bus()
                .ensure_group(*stream, &group, from_start)
                .await
                .map_err(|e| anyhow::anyhow!("failed to ensure group on {}: {}", stream, e))?;
        }

        info!(
            worker_id = %self.config.worker_id,
            streams = self.config.streams.len(),
            batch_size = self.config.batch_size,
            pool_scope = ?self.config.pool_scope,
            "worker runtime starting"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            for stream in self.config.streams.clone() {
                if shutdown.is_cancelled() {
                    break;
                }

                let group = self.group_for(stream);
                let messages = match self
                    .orchestrator
                    .bus()
                    .read_group(
                        stream,
                        &group,
                        &self.config.worker_id,
                        self.config.batch_size,
                        self.config.block,
                    )
                    .await
                {
                    Ok(messages) => messages,
                    Err(e) => {
                        error!(stream = %stream, error = %e, "failed to read from bus");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };

                for message in messages {
                    if let Err(e) = self.process_message(stream, message, &shutdown).await {
                        error!(stream = %stream, error = %e, "message processing failed");
                    }
                }
            }
        }

        info!(worker_id = %self.config.worker_id, "worker runtime stopped");
        Ok(())
    }

    async fn process_message(
        &self,
        stream: Stream,
        message: BusMessage,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let Some(job_id) = message.entry.job_id.clone() else {
            return self.handle_control(stream, &message).await;
        };

        // Groups broadcast the whole stream, so deliveries addressed to a
        // different pool scope are not this worker's to claim.
        if stream == Stream::InferenceJobs && message.entry.pool_id != self.config.pool_scope {
            debug!(
                job_id = %job_id,
                addressed_to = ?message.entry.pool_id,
                scope = ?self.config.pool_scope,
                "delivery for another pool scope acked"
            );
            self.ack(stream, &message.id).await;
            return Ok(());
        }

        let store = self.orchestrator.store().clone();
        let job = match store.claim_job(&job_id, &self.config.worker_id).await {
            Ok(job) => job,
            Err(StoreError::AlreadyClaimed { status }) => {
                // Duplicate delivery; someone else owns or finished it.
                debug!(job_id = %job_id, status = %status, "duplicate delivery acked");
                self.ack(stream, &message.id).await;
                return Ok(());
            }
            Err(StoreError::Unknown) => {
                warn!(job_id = %job_id, "delivery for unknown job acked");
                self.ack(stream, &message.id).await;
                return Ok(());
            }
            Err(e) if e.is_transient() => {
                // Leave the delivery pending; it will be retried or
                // reclaimed once the store is back.
                warn!(job_id = %job_id, error = %e, "claim failed transiently, leaving pending");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        debug!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempts,
            "job claimed"
        );

        let Some(needs) = self.handlers.needs(&job.job_type).cloned() else {
            warn!(job_id = %job.id, job_type = %job.job_type, "no handler registered");
            self.fail_permanently(stream, &message, &job, "no handler registered for job type")
                .await;
            return Ok(());
        };

        // Lease what the handler declared it needs.
        let lease_token = match &needs.lease {
            None => None,
            Some(lease_needs) => {
                let request = LeaseRequest {
                    agent: self.config.worker_id.clone(),
                    min_memory_mb: lease_needs.min_memory_mb,
                    ttl_seconds: self.config.lease_ttl_seconds,
                    mode: lease_needs.mode,
                    model_id: lease_needs.model_id.clone(),
                    pool_id: job.pool_id,
                };
                match self.orchestrator.lease_gpu(&request).await {
                    Ok(lease) => Some(lease.token),
                    Err(OrchestratorError::AdmissionDenied(reason)) if reason.is_retryable() => {
                        // Do not ack: the pending entry is the retry signal.
                        debug!(job_id = %job.id, reason = %reason, "lease denied, leaving delivery pending");
                        return Ok(());
                    }
                    Err(OrchestratorError::AdmissionDenied(reason)) => {
                        if self
                            .finalize_failed(&job, &format!("admission denied: {}", reason))
                            .await
                        {
                            self.ack(stream, &message.id).await;
                        }
                        return Ok(());
                    }
                    Err(e) => {
                        warn!(job_id = %job.id, error = %e, "lease request failed, leaving delivery pending");
                        return Ok(());
                    }
                }
            }
        };

        if let Err(e) = store
            .mark_job_running(&job.id, &self.config.worker_id)
            .await
        {
            warn!(job_id = %job.id, error = %e, "could not mark job running");
            self.release(lease_token).await;
            // Transient: leave the delivery pending for the reclaimer.
            if !e.is_transient() {
                self.ack(stream, &message.id).await;
            }
            return Ok(());
        }

        // Cancellation is cooperative: lease heartbeat failures flip this
        // token and the handler aborts at its next checkpoint.
        let cancel = shutdown.child_token();
        let heartbeat = lease_token.map(|token| self.spawn_heartbeat(token, cancel.clone()));

        let ctx = WorkerContext {
            job: job.clone(),
            cancel: cancel.clone(),
            store: store.clone(),
            router: Arc::clone(&self.router),
        };

        let watchdog = self.orchestrator.store().policy().handler_watchdog();
        let outcome = tokio::time::timeout(
            watchdog,
            self.handlers
                .execute(&job.job_type, message.entry.payload.clone(), ctx),
        )
        .await;

        cancel.cancel();
        if let Some(handle) = heartbeat {
            let _ = handle.await;
        }

        match outcome {
            Ok(Ok(())) => {
                let finalized = self.finalize_done(&job).await;
                self.release(lease_token).await;
                // An unfinalized job must stay pending so the reclaimer can
                // redrive it; handlers are idempotent by contract.
                if finalized {
                    self.ack(stream, &message.id).await;
                }
            }
            Ok(Err(e)) => {
                warn!(job_id = %job.id, error = %e, "handler failed");
                self.release(lease_token).await;
                if is_permanent_error(&e) {
                    self.fail_permanently(stream, &message, &job, &e.to_string())
                        .await;
                } else {
                    self.retry_or_dead_letter(stream, &message, &job, &e.to_string())
                        .await;
                }
            }
            Err(_) => {
                warn!(job_id = %job.id, watchdog_s = watchdog.as_secs(), "handler hit watchdog timeout");
                self.release(lease_token).await;
                self.retry_or_dead_letter(stream, &message, &job, "handler watchdog timeout")
                    .await;
            }
        }

        Ok(())
    }

    /// Preload and other control entries.
    async fn handle_control(&self, stream: Stream, message: &BusMessage) -> Result<()> {
        if message.entry.entry_type != "preload" {
            debug!(entry_type = %message.entry.entry_type, "unhandled control entry acked");
            self.ack(stream, &message.id).await;
            return Ok(());
        }

        let store = self.orchestrator.store();
        let pool_id = message
            .entry
            .payload
            .get("pool_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok());
        let requested = message
            .entry
            .payload
            .get("workers")
            .and_then(|v| v.as_i64())
            .unwrap_or(1) as i32;

        let Some(pool_id) = pool_id else {
            warn!(msg_id = %message.id, "preload entry without pool_id acked");
            self.ack(stream, &message.id).await;
            return Ok(());
        };

        match store.find_pool(pool_id).await {
            Ok(Some(pool)) if pool.status.accepts_jobs() => {
                // Attach at most the remaining deficit; over-asked preloads
                // must not push spawned past desired.
                let deficit = (pool.desired_workers - pool.spawned_workers).max(0);
                let joining = requested.min(deficit);
                if joining > 0 {
                    if let Err(e) = store.adjust_spawned_workers(pool_id, joining).await {
                        warn!(pool_id = %pool_id, error = %e, "failed to record pool workers, leaving pending");
                        return Ok(());
                    }
                    info!(pool_id = %pool_id, joining, "workers attached to pool");
                }
                self.ack(stream, &message.id).await;
            }
            Ok(_) => {
                // Unknown, draining, or terminal pool: nothing to spawn.
                self.ack(stream, &message.id).await;
            }
            Err(e) if e.is_transient() => {
                warn!(pool_id = %pool_id, error = %e, "pool lookup failed transiently, leaving pending");
            }
            Err(e) => {
                warn!(pool_id = %pool_id, error = %e, "pool lookup failed, acking preload");
                self.ack(stream, &message.id).await;
            }
        }
        Ok(())
    }

    /// Heartbeat the lease at a third of the grace period. Three
    /// consecutive transient failures, or one definitive expiry, cancel
    /// the handler cooperatively.
    fn spawn_heartbeat(
        &self,
        token: Uuid,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let orchestrator = Arc::clone(&self.orchestrator);
        let interval = orchestrator.store().policy().heartbeat_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // skip the immediate tick
            let mut misses = 0u32;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match orchestrator.heartbeat_lease(token).await {
                            Ok(_) => misses = 0,
                            Err(OrchestratorError::Expired) | Err(OrchestratorError::NotFound(_)) => {
                                warn!(token = %token, "lease gone, cancelling handler");
                                cancel.cancel();
                                break;
                            }
                            Err(e) => {
                                misses += 1;
                                warn!(token = %token, misses, error = %e, "lease heartbeat failed");
                                if misses >= 3 {
                                    cancel.cancel();
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        })
    }

    async fn finalize_done(&self, job: &Job) -> bool {
        let store = self.orchestrator.store();
        match store.finalize_job(&job.id, JobStatus::Done, None).await {
            Ok(finalized) => {
                let latency = (finalized.updated_at - job.created_at)
                    .num_milliseconds()
                    .max(0) as f64
                    / 1000.0;
                self.orchestrator.metrics().job_latency.observe(latency);
                self.orchestrator
                    .metrics()
                    .jobs_finalized
                    .with_label_values(&["done"])
                    .inc();
                info!(job_id = %job.id, job_type = %job.job_type, "job done");
                true
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "failed to finalize job as done");
                false
            }
        }
    }

    async fn finalize_failed(&self, job: &Job, reason: &str) -> bool {
        let store = self.orchestrator.store();
        if let Err(e) = store
            .finalize_job(&job.id, JobStatus::Failed, Some(reason))
            .await
        {
            error!(job_id = %job.id, error = %e, "failed to finalize job as failed");
            return false;
        }
        self.orchestrator
            .metrics()
            .jobs_finalized
            .with_label_values(&["failed"])
            .inc();
        true
    }

    /// Failure with attempts left: record it and append a fresh delivery.
    /// Budget gone: move to the dead-letter partition.
    async fn retry_or_dead_letter(
        &self,
        stream: Stream,
        message: &BusMessage,
        job: &Job,
        reason: &str,
    ) {
        if !self.finalize_failed(job, reason).await {
            // Leave the delivery pending; the reclaimer redrives it.
            return;
        }

        if job.attempts < job.max_attempts {
            let mut entry = BusEntry::job(&job.id, &job.job_type, message.entry.payload.clone());
            entry.attempts = job.attempts;
            entry.pool_id = job.pool_id;
            entry.origin_msg_id = Some(message.id.clone());
            if let Err(e) = self.orchestrator.bus().append(stream, &entry).await {
                // The failed row is still claimable; the reclaimer will
                // redrive it from the unacked original instead.
                warn!(job_id = %job.id, error = %e, "failed to append retry delivery, leaving original pending");
                return;
            }
        } else {
            self.dead_letter(message, job, reason).await;
        }
        self.ack(stream, &message.id).await;
    }

    /// Permanent failure: no retry regardless of remaining attempts.
    async fn fail_permanently(
        &self,
        stream: Stream,
        message: &BusMessage,
        job: &Job,
        reason: &str,
    ) {
        if !self.finalize_failed(job, reason).await {
            return;
        }
        self.dead_letter(message, job, reason).await;
        self.ack(stream, &message.id).await;
    }

    async fn dead_letter(&self, message: &BusMessage, job: &Job, reason: &str) {
        let mut entry = BusEntry::job(&job.id, &job.job_type, message.entry.payload.clone());
        entry.attempts = job.attempts;
        entry.pool_id = job.pool_id;
        entry.origin_msg_id = Some(message.id.clone());
        if let Err(e) = self.orchestrator.bus().append(Stream::Dlq, &entry).await {
            error!(job_id = %job.id, error = %e, "failed to append dead-letter entry");
        }
        if let Err(e) = self
            .orchestrator
            .store()
            .finalize_job(&job.id, JobStatus::DeadLetter, Some(reason))
            .await
        {
            error!(job_id = %job.id, error = %e, "failed to finalize job as dead_letter");
        }
        self.orchestrator.metrics().dead_letters.inc();
        self.orchestrator
            .metrics()
            .jobs_finalized
            .with_label_values(&["dead_letter"])
            .inc();
        warn!(job_id = %job.id, reason, "job dead-lettered");
    }

    async fn release(&self, token: Option<Uuid>) {
        if let Some(token) = token {
            if let Err(e) = self.orchestrator.release_lease(token).await {
                warn!(token = %token, error = %e, "lease release failed");
            }
        }
    }

    async fn ack(&self, stream: Stream, msg_id: &str) {
        let group = self.group_for(stream);
        if let Err(e) = self.orchestrator.bus().ack(stream, &group, msg_id).await {
            warn!(stream = %stream, msg_id = %msg_id, error = %e, "ack failed");
        }
    }
}

/// Permanent errors never retry: bad payloads and unknown types will fail
/// identically on every delivery.
fn is_permanent_error(error: &anyhow::Error) -> bool {
    let text = error.to_string().to_lowercase();
    text.contains("deserialize")
        || text.contains("parse")
        || text.contains("unknown job type")
        || text.contains("invalid payload")
}
