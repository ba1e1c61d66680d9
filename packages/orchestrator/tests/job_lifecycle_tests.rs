//! End-to-end job lifecycle: submit, execute, finalize, dead-letter.

mod common;

use std::time::Duration;

use common::{spawn_worker, wait_for_job_status, TestHarness};
use orchestrator_core::bus::{EventBus, Stream};
use orchestrator_core::common::OrchestratorError;
use orchestrator_core::engine::SubmitRequest;
use orchestrator_core::store::{AuditEventType, JobStatus};
use orchestrator_core::worker::{HandlerRegistry, ResourceNeeds};

fn submit(job_id: &str, job_type: &str, payload: serde_json::Value) -> SubmitRequest {
    SubmitRequest {
        job_id: Some(job_id.to_string()),
        job_type: job_type.to_string(),
        payload,
        agent: Some("producer".to_string()),
        pool_id: None,
    }
}

fn succeeding_handlers() -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();
    handlers.register::<serde_json::Value, _, _>(
        "infer",
        ResourceNeeds::gpu(0, None),
        |_payload, _ctx| async { Ok(()) },
    );
    handlers
}

fn failing_handlers() -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();
    handlers.register::<serde_json::Value, _, _>(
        "infer",
        ResourceNeeds::gpu(0, None),
        |_payload, _ctx| async { anyhow::bail!("model exploded") },
    );
    handlers
}

async fn wait_for_zero_active_leases(harness: &TestHarness, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if harness.store.count_active_leases().await.unwrap_or(1) == 0 {
            return true;
        }
        if std::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

async fn wait_for_no_pending(harness: &TestHarness, stream: Stream, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        let drained = harness
            .bus
            .pending(stream, stream.default_group(), Duration::ZERO)
            .await
            .map(|p| p.is_empty())
            .unwrap_or(false);
        if drained {
            return true;
        }
        if std::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn happy_path_single_job_runs_to_done() {
    let harness = TestHarness::new().await.unwrap();
    let orchestrator = &harness.orchestrator;

    let receipt = orchestrator
        .submit_job(&submit("j1", "infer", serde_json::json!({"model": "m1"})))
        .await
        .unwrap();
    assert_eq!(receipt.job_id, "j1");
    assert!(!receipt.deduplicated);

    let (stop, handle) = spawn_worker(orchestrator.clone(), succeeding_handlers(), "worker-hp");
    let job = wait_for_job_status(&harness.store, "j1", JobStatus::Done, Duration::from_secs(15))
        .await
        .unwrap();
    assert_eq!(job.attempts, 1);

    // One audit row per transition.
    let events: Vec<AuditEventType> = harness
        .store
        .audit_for_entity("j1")
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(
        events,
        vec![
            AuditEventType::JobSubmitted,
            AuditEventType::JobClaimed,
            AuditEventType::JobRunning,
            AuditEventType::JobFinalized,
        ]
    );

    // Lease released and the delivery acknowledged.
    assert!(
        wait_for_zero_active_leases(&harness, Duration::from_secs(10)).await,
        "lease was not released"
    );
    assert!(
        wait_for_no_pending(&harness, Stream::InferenceJobs, Duration::from_secs(10)).await,
        "delivery was not acknowledged"
    );

    // Latency observation recorded.
    let text = orchestrator.metrics().export();
    assert!(text.contains("gpu_orchestrator_job_latency_seconds_count 1"));

    stop.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn duplicate_submission_is_idempotent() {
    let harness = TestHarness::new().await.unwrap();
    let orchestrator = &harness.orchestrator;
    let payload = serde_json::json!({"model": "m1"});

    let first = orchestrator
        .submit_job(&submit("dup-1", "infer", payload.clone()))
        .await
        .unwrap();
    let second = orchestrator
        .submit_job(&submit("dup-1", "infer", payload))
        .await
        .unwrap();
    assert!(!first.deduplicated);
    assert!(second.deduplicated);

    let (stop, handle) = spawn_worker(orchestrator.clone(), succeeding_handlers(), "worker-dup");
    wait_for_job_status(&harness.store, "dup-1", JobStatus::Done, Duration::from_secs(15))
        .await
        .unwrap();
    stop.cancel();
    handle.await.unwrap().unwrap();

    // One row, one real claim; the duplicate delivery was acked untouched.
    let events = harness.store.audit_for_entity("dup-1").await.unwrap();
    let submitted = events
        .iter()
        .filter(|e| e.event_type == AuditEventType::JobSubmitted)
        .count();
    let claimed = events
        .iter()
        .filter(|e| e.event_type == AuditEventType::JobClaimed)
        .count();
    assert_eq!(submitted, 1);
    assert_eq!(claimed, 1);
}

#[tokio::test]
async fn duplicate_with_different_payload_is_a_conflict() {
    let harness = TestHarness::new().await.unwrap();
    let orchestrator = &harness.orchestrator;

    orchestrator
        .submit_job(&submit("dup-2", "infer", serde_json::json!({"model": "m1"})))
        .await
        .unwrap();
    let err = orchestrator
        .submit_job(&submit("dup-2", "infer", serde_json::json!({"model": "m2"})))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Conflict(_)));
}

#[tokio::test]
async fn dead_letter_after_max_attempts() {
    let harness = TestHarness::new().await.unwrap();
    let orchestrator = &harness.orchestrator;

    orchestrator
        .submit_job(&submit("j6", "infer", serde_json::json!({"model": "m1"})))
        .await
        .unwrap();

    let (stop, handle) = spawn_worker(orchestrator.clone(), failing_handlers(), "worker-dlq");
    let job = wait_for_job_status(
        &harness.store,
        "j6",
        JobStatus::DeadLetter,
        Duration::from_secs(20),
    )
    .await
    .unwrap();
    stop.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(job.attempts, harness.config.policy.job_max_attempts);
    assert!(job.last_error.is_some());

    // Exactly one DLQ entry, pointing back at the final delivery.
    harness
        .bus
        .ensure_group(Stream::Dlq, Stream::Dlq.default_group(), true)
        .await
        .unwrap();
    let dlq = harness
        .bus
        .read_group(
            Stream::Dlq,
            Stream::Dlq.default_group(),
            "inspector",
            16,
            Duration::from_millis(200),
        )
        .await
        .unwrap();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].entry.job_id.as_deref(), Some("j6"));
    assert!(dlq[0].entry.origin_msg_id.is_some());
}

#[tokio::test]
async fn submit_claim_finalize_leaves_nothing_pending() {
    let harness = TestHarness::new().await.unwrap();
    let orchestrator = &harness.orchestrator;

    orchestrator
        .submit_job(&submit("rt-1", "infer", serde_json::json!({})))
        .await
        .unwrap();

    let group = Stream::InferenceJobs.default_group();
    harness
        .bus
        .ensure_group(Stream::InferenceJobs, group, true)
        .await
        .unwrap();
    let messages = harness
        .bus
        .read_group(
            Stream::InferenceJobs,
            group,
            "manual-worker",
            1,
            Duration::from_millis(200),
        )
        .await
        .unwrap();
    assert_eq!(messages.len(), 1);

    harness.store.claim_job("rt-1", "manual-worker").await.unwrap();
    harness
        .store
        .mark_job_running("rt-1", "manual-worker")
        .await
        .unwrap();
    harness
        .store
        .finalize_job("rt-1", JobStatus::Done, None)
        .await
        .unwrap();
    harness
        .bus
        .ack(Stream::InferenceJobs, group, &messages[0].id)
        .await
        .unwrap();

    let pending = harness
        .bus
        .pending(Stream::InferenceJobs, group, Duration::ZERO)
        .await
        .unwrap();
    assert!(pending.is_empty());
    let job = harness.store.get_job("rt-1").await.unwrap();
    assert_eq!(job.status, JobStatus::Done);
}
