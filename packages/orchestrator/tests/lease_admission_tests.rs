//! Lease lifecycle and the admission chain.

mod common;

use std::time::Duration;

use common::{device, test_policy, TestHarness};
use orchestrator_core::common::{DenialReason, OrchestratorError};
use orchestrator_core::config::Policy;
use orchestrator_core::engine::LeaseRequest;
use orchestrator_core::store::{AuditEventType, LeaseMode, LeaseSpec, StoreError};

fn gpu_request(agent: &str) -> LeaseRequest {
    LeaseRequest {
        agent: agent.to_string(),
        min_memory_mb: 1024,
        ttl_seconds: 30,
        mode: LeaseMode::Gpu,
        model_id: None,
        pool_id: None,
    }
}

fn assert_denied(result: Result<orchestrator_core::store::Lease, OrchestratorError>, reason: DenialReason) {
    match result {
        Err(OrchestratorError::AdmissionDenied(r)) => assert_eq!(r, reason),
        other => panic!("expected denial {:?}, got {:?}", reason, other.map(|l| l.token)),
    }
}

#[tokio::test]
async fn release_restores_capacity() {
    let harness = TestHarness::new().await.unwrap();
    let orchestrator = &harness.orchestrator;

    let lease = orchestrator.lease_gpu(&gpu_request("scout")).await.unwrap();
    assert_eq!(lease.device_index, Some(0));

    // The slot is taken for this agent.
    assert_denied(
        orchestrator.lease_gpu(&gpu_request("scout")).await,
        DenialReason::QuotaExceeded,
    );

    orchestrator.release_lease(lease.token).await.unwrap();
    let again = orchestrator.lease_gpu(&gpu_request("scout")).await.unwrap();
    assert_eq!(again.device_index, Some(0));
}

#[tokio::test]
async fn different_agents_share_a_device() {
    let harness = TestHarness::new().await.unwrap();
    let orchestrator = &harness.orchestrator;

    let a = orchestrator.lease_gpu(&gpu_request("scout")).await.unwrap();
    let b = orchestrator.lease_gpu(&gpu_request("analyst")).await.unwrap();
    assert_eq!(a.device_index, b.device_index);
}

#[tokio::test]
async fn heartbeat_after_expiry_is_rejected() {
    let harness = TestHarness::new().await.unwrap();

    let spec = LeaseSpec::builder()
        .agent("scout".to_string())
        .mode(LeaseMode::Cpu)
        .ttl_seconds(1i64)
        .build();
    let lease = harness.store.put_lease(&spec).await.unwrap();

    tokio::time::sleep(Duration::from_millis(1200)).await;
    let err = harness.store.extend_lease(lease.token).await.unwrap_err();
    assert!(matches!(err, StoreError::Expired));

    // Engine surfaces the same boundary as Expired, which aborts the caller.
    let err = harness.orchestrator.heartbeat_lease(lease.token).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Expired));
}

#[tokio::test]
async fn extension_never_passes_the_creation_cap() {
    let policy = Policy {
        max_lease_ttl_seconds: 2,
        ..test_policy()
    };
    let harness = TestHarness::with_policy(policy, vec![device(0, 24_576)], Vec::new())
        .await
        .unwrap();

    // Requested 60s, clamped to the 2s cap.
    let lease = harness
        .orchestrator
        .lease_gpu(&LeaseRequest {
            ttl_seconds: 60,
            ..gpu_request("scout")
        })
        .await
        .unwrap();
    let cap = lease.created_at + chrono::Duration::seconds(2);
    assert!(lease.expires_at <= cap + chrono::Duration::milliseconds(100));

    let extended = harness.store.extend_lease(lease.token).await.unwrap();
    assert!(extended.expires_at <= cap + chrono::Duration::milliseconds(100));
    assert!(extended.last_heartbeat_at >= lease.last_heartbeat_at);
}

#[tokio::test]
async fn purge_marks_expired_leases() {
    let harness = TestHarness::new().await.unwrap();

    let spec = LeaseSpec::builder()
        .agent("scout".to_string())
        .mode(LeaseMode::Cpu)
        .ttl_seconds(1i64)
        .build();
    let lease = harness.store.put_lease(&spec).await.unwrap();

    tokio::time::sleep(Duration::from_millis(1200)).await;
    let purged = harness.store.purge_expired_leases().await.unwrap();
    assert!(purged.contains(&lease.token));
    assert_eq!(harness.store.count_active_leases().await.unwrap(), 0);

    let row = harness.store.find_lease(lease.token).await.unwrap().unwrap();
    assert!(!row.is_active(chrono::Utc::now()));

    let events = harness
        .store
        .audit_for_entity(&lease.token.to_string())
        .await
        .unwrap();
    assert!(events
        .iter()
        .any(|e| e.event_type == AuditEventType::LeaseExpired));
}

#[tokio::test]
async fn pressure_denial_recovers_with_hysteresis() {
    let harness = TestHarness::new().await.unwrap();
    let orchestrator = &harness.orchestrator;

    // Utilization 92% on the only device: gate closes.
    harness.sampler.update(0, 0, 92.0);
    assert_denied(
        orchestrator.lease_gpu(&gpu_request("scout")).await,
        DenialReason::GpuPressureHigh,
    );

    // Between watermarks the latch stays closed.
    harness.sampler.update(0, 0, 80.0);
    assert_denied(
        orchestrator.lease_gpu(&gpu_request("scout")).await,
        DenialReason::GpuPressureHigh,
    );

    // Under the low watermark the identical request succeeds.
    harness.sampler.update(0, 0, 74.0);
    orchestrator.lease_gpu(&gpu_request("scout")).await.unwrap();
}

#[tokio::test]
async fn cpu_mode_bypasses_device_checks() {
    let harness = TestHarness::new().await.unwrap();
    harness.sampler.update(0, 0, 95.0);

    let lease = harness
        .orchestrator
        .lease_gpu(&LeaseRequest {
            mode: LeaseMode::Cpu,
            ..gpu_request("scout")
        })
        .await
        .unwrap();
    assert!(lease.device_index.is_none());
    assert!(matches!(lease.mode, LeaseMode::Cpu));
}

#[tokio::test]
async fn agent_rate_limit_denies_with_reason() {
    let policy = Policy {
        per_agent_rate: 0.001,
        per_agent_burst: 1.0,
        ..test_policy()
    };
    let harness = TestHarness::with_policy(policy, vec![device(0, 24_576)], Vec::new())
        .await
        .unwrap();

    let lease = harness.orchestrator.lease_gpu(&gpu_request("greedy")).await.unwrap();
    harness.orchestrator.release_lease(lease.token).await.unwrap();

    assert_denied(
        harness.orchestrator.lease_gpu(&gpu_request("greedy")).await,
        DenialReason::RateLimited,
    );
}

#[tokio::test]
async fn strict_model_store_rejects_missing_models() {
    let policy = Policy {
        strict_model_store: true,
        ..test_policy()
    };
    let harness = TestHarness::with_policy(
        policy,
        vec![device(0, 24_576)],
        vec!["m1".to_string()],
    )
    .await
    .unwrap();

    assert_denied(
        harness
            .orchestrator
            .lease_gpu(&LeaseRequest {
                model_id: Some("m2".to_string()),
                ..gpu_request("scout")
            })
            .await,
        DenialReason::ModelUnavailable,
    );

    harness
        .orchestrator
        .lease_gpu(&LeaseRequest {
            model_id: Some("m1".to_string()),
            ..gpu_request("scout")
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn oversized_requests_find_no_device() {
    let harness = TestHarness::new().await.unwrap();

    assert_denied(
        harness
            .orchestrator
            .lease_gpu(&LeaseRequest {
                min_memory_mb: 1_000_000,
                ..gpu_request("scout")
            })
            .await,
        DenialReason::NoDeviceAvailable,
    );
}
