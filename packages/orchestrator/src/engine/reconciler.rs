//! Leader election and the reconciliation loop.
//!
//! One logical task per process: every interval it acquires or renews the
//! leader lock, and while leader it purges expired leases, reclaims idle
//! pending bus entries, and converges worker pools. A follower only
//! watches the lock. After a failed renewal no write is issued until the
//! lock is re-acquired.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{preload_entry, Orchestrator};
use crate::bus::{BusMessage, EventBus, Stream};
use crate::common::OrchestratorError;
use crate::store::{JobStatus, PoolStatus, StoreError};

/// Streams the reclaimer watches for idle pending entries.
const RECLAIMED_STREAMS: [Stream; 3] = [
    Stream::InferenceJobs,
    Stream::IngestEvents,
    Stream::Preloads,
];

pub struct Reconciler {
    orchestrator: Arc<Orchestrator>,
}

impl Reconciler {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Run until shutdown. Never exits on a tick failure; those are logged
    /// and counted, and the next interval tries again.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let policy = self.orchestrator.store().policy().clone();
        let interval = Duration::from_secs(policy.reconcile_interval_seconds);

        if policy.reconcile_interval_seconds * 3 > policy.leader_lock_ttl_seconds {
            warn!(
                interval_s = policy.reconcile_interval_seconds,
                ttl_s = policy.leader_lock_ttl_seconds,
                "reconcile interval exceeds a third of the leader lock TTL; renewal margin is thin"
            );
        }

        info!(
            node_id = %self.orchestrator.node_id(),
            interval_s = policy.reconcile_interval_seconds,
            "reconciler starting"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            self.step().await;
        }

        // Voluntary step-down so a follower can take over immediately.
        if let Err(e) = self.orchestrator.step_down().await {
            warn!(error = %e, "failed to release leader lock on shutdown");
        }

        info!(node_id = %self.orchestrator.node_id(), "reconciler stopped");
        Ok(())
    }

    async fn step(&self) {
        let orchestrator = &self.orchestrator;
        orchestrator.leadership().touch_loop();

        if !orchestrator.leadership().is_leader() {
            match orchestrator.try_become_leader().await {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => {
                    warn!(error = %e, "leader lock acquisition failed");
                    return;
                }
            }
        }

        if let Err(e) = tick(orchestrator).await {
            error!(error = %e, "reconcile tick failed");
            orchestrator
                .metrics()
                .errors
                .with_label_values(&[e.kind()])
                .inc();
        }
    }
}

/// One reconciliation pass. Step order matters: the lock renewal comes
/// first, and a renewal failure ends the pass before any write.
pub(crate) async fn tick(orchestrator: &Orchestrator) -> Result<(), OrchestratorError> {
    let store = orchestrator.store();
    let metrics = orchestrator.metrics();

    // 1. Renew the lock; on loss, drop to follower and enforce nothing.
    let Some(handle) = orchestrator.leadership().handle() else {
        return Ok(());
    };
    match store
        .renew_lock(&handle, store.policy().leader_lock_ttl_seconds)
        .await
    {
        Ok(_) => {}
        Err(StoreError::Expired) => {
            warn!(node_id = %orchestrator.node_id(), "leader lock lost");
            orchestrator.leadership().resign();
            metrics.is_leader.set(0);
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    }

    // 2. Purge expired leases. Marks only: in-flight compute is not
    //    cancelled, the holder aborts at its next heartbeat.
    let expired = store.purge_expired_leases().await?;
    if !expired.is_empty() {
        debug!(count = expired.len(), "expired leases purged");
        metrics.leases_expired.inc_by(expired.len() as u64);
    }

    // 3. Reclaim idle pending entries, retrying or dead-lettering. Pool
    //    groups on the inference stream get the same sweep as the shared
    //    groups.
    for stream in RECLAIMED_STREAMS {
        reclaim_group(orchestrator, stream, stream.default_group(), None).await?;
    }
    for pool in store.list_pools(None).await? {
        if pool.status.is_terminal() {
            continue;
        }
        let group = Stream::pool_group(pool.id);
        orchestrator
            .bus()
            .ensure_group(Stream::InferenceJobs, &group, false)
            .await?;
        reclaim_group(orchestrator, Stream::InferenceJobs, &group, Some(pool.id)).await?;
    }

    // 4. Converge worker pools.
    converge_pools(orchestrator).await?;

    metrics
        .leases_active
        .set(store.count_active_leases().await?);
    metrics.reconcile_ticks.inc();
    Ok(())
}

/// Inspect one group's pending entries and redrive everything idle past
/// the claim threshold. `scope` is the pool the group belongs to, `None`
/// for the shared groups.
async fn reclaim_group(
    orchestrator: &Orchestrator,
    stream: Stream,
    group: &str,
    scope: Option<Uuid>,
) -> Result<(), OrchestratorError> {
    let bus = orchestrator.bus();
    let idle = Duration::from_millis(orchestrator.store().policy().job_claim_idle_ms);

    let pending = bus.pending(stream, group, idle).await?;
    if pending.is_empty() {
        return Ok(());
    }

    let ids: Vec<String> = pending.iter().map(|p| p.id.clone()).collect();
    let consumer = format!("reconciler-{}", orchestrator.node_id());
    let messages = bus.reclaim(stream, group, &consumer, &ids, idle).await?;

    for message in messages {
        redrive_message(orchestrator, stream, group, scope, message).await?;
    }
    Ok(())
}

/// Retry or dead-letter one reclaimed message.
async fn redrive_message(
    orchestrator: &Orchestrator,
    stream: Stream,
    group: &str,
    scope: Option<Uuid>,
    message: BusMessage,
) -> Result<(), OrchestratorError> {
    let store = orchestrator.store();
    let bus = orchestrator.bus();
    let metrics = orchestrator.metrics();
    let max_attempts = store.policy().job_max_attempts;

    // A delivery addressed outside this group's scope was never this
    // group's to run; a worker would have acked it untouched, so the
    // reclaimer does the same.
    if stream == Stream::InferenceJobs && message.entry.pool_id != scope {
        bus.ack(stream, group, &message.id).await?;
        return Ok(());
    }

    let Some(job_id) = message.entry.job_id.clone() else {
        // Control entries (preloads) retry on their own counter.
        if message.entry.attempts < max_attempts {
            let mut entry = message.entry.clone();
            entry.attempts += 1;
            entry.origin_msg_id = Some(message.id.clone());
            bus.append(stream, &entry).await?;
            metrics.reclaims.inc();
        } else {
            let mut entry = message.entry.clone();
            entry.origin_msg_id = Some(message.id.clone());
            bus.append(Stream::Dlq, &entry).await?;
            metrics.dead_letters.inc();
        }
        bus.ack(stream, group, &message.id).await?;
        return Ok(());
    };

    match store.find_job(&job_id).await? {
        // Row gone or already terminal: the delivery is stale, drop it.
        None => {
            warn!(job_id = %job_id, msg_id = %message.id, "pending entry for unknown job dropped");
            bus.ack(stream, group, &message.id).await?;
        }
        Some(job) if job.status.is_terminal() => {
            bus.ack(stream, group, &message.id).await?;
        }
        Some(job) if job.attempts < max_attempts => {
            store.reset_job_for_retry(&job_id).await?;

            let mut entry = message.entry.clone();
            entry.attempts = job.attempts;
            entry.origin_msg_id = Some(message.id.clone());
            bus.append(stream, &entry).await?;
            bus.ack(stream, group, &message.id).await?;

            info!(
                job_id = %job_id,
                attempts = job.attempts,
                msg_id = %message.id,
                "idle delivery reclaimed and re-appended"
            );
            metrics.reclaims.inc();
        }
        Some(job) => {
            let mut entry = message.entry.clone();
            entry.attempts = job.attempts;
            entry.origin_msg_id = Some(message.id.clone());
            bus.append(Stream::Dlq, &entry).await?;
            store.finalize_job(
                &job_id,
                JobStatus::DeadLetter,
                Some("attempt budget exhausted after reclaim"),
            )
            .await?;
            bus.ack(stream, group, &message.id).await?;

            warn!(job_id = %job_id, attempts = job.attempts, "job dead-lettered");
            metrics.dead_letters.inc();
            metrics
                .jobs_finalized
                .with_label_values(&["dead_letter"])
                .inc();
        }
    }
    Ok(())
}

/// Drive every pool toward its desired shape.
async fn converge_pools(orchestrator: &Orchestrator) -> Result<(), OrchestratorError> {
    let store = orchestrator.store();
    let bus = orchestrator.bus();
    let metrics = orchestrator.metrics();
    let hold_grace = chrono::Duration::seconds(store.policy().pool_drain_grace_seconds as i64);
    let now = chrono::Utc::now();

    for pool in store.list_pools(None).await? {
        let pool_label = pool.id.to_string();
        metrics
            .pool_workers
            .with_label_values(&[&pool_label, "desired"])
            .set(pool.desired_workers as i64);
        metrics
            .pool_workers
            .with_label_values(&[&pool_label, "spawned"])
            .set(pool.spawned_workers as i64);

        match pool.status {
            PoolStatus::Starting | PoolStatus::Running => {
                if pool.status == PoolStatus::Starting
                    && pool.spawned_workers >= pool.desired_workers
                {
                    store.set_pool_status(pool.id, PoolStatus::Running).await?;
                    continue;
                }

                if pool.spawned_workers < pool.desired_workers {
                    let deficit = pool.desired_workers - pool.spawned_workers;
                    bus.append(Stream::Preloads, &preload_entry(&pool, deficit))
                        .await?;
                    debug!(pool_id = %pool.id, deficit, "preload published for under-filled pool");
                }

                // Hold expired and nothing references the pool: wind down.
                let hold_elapsed =
                    now - pool.started_at >= chrono::Duration::seconds(pool.hold_seconds);
                if pool.status == PoolStatus::Running && hold_elapsed {
                    let open_jobs = store.count_open_jobs_for_pool(pool.id).await?;
                    let live_leases = store.active_lease_count_for_pool(pool.id).await?;
                    if open_jobs == 0 && live_leases == 0 {
                        info!(pool_id = %pool.id, "pool hold elapsed with no references, draining");
                        store.set_pool_status(pool.id, PoolStatus::Draining).await?;
                    }
                }
            }
            PoolStatus::Draining => {
                let live_leases = store.active_lease_count_for_pool(pool.id).await?;
                if live_leases == 0 {
                    info!(pool_id = %pool.id, "drained pool stopped");
                    store.set_pool_status(pool.id, PoolStatus::Stopped).await?;
                } else if let Some(drained_at) = pool.drained_at {
                    if now - drained_at > hold_grace {
                        warn!(
                            pool_id = %pool.id,
                            live_leases,
                            "pool still referenced past its drain grace"
                        );
                    }
                }
            }
            PoolStatus::Stopped | PoolStatus::Evicted => {}
        }
    }
    Ok(())
}
