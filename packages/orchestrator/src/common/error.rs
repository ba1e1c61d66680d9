//! Process-wide error taxonomy.
//!
//! Adapters recover transient I/O locally (bounded retries); everything else
//! surfaces here with a structured reason. The HTTP layer maps these kinds to
//! status codes; nothing in the core returns an opaque string where an enum
//! is defined.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Enumerated admission denial reasons.
///
/// The string forms are the wire contract (`reason` field in 429 bodies and
/// the `reason` label on denial counters).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    RateLimited,
    GpuPressureHigh,
    NoDeviceAvailable,
    ModelUnavailable,
    QuotaExceeded,
}

impl DenialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenialReason::RateLimited => "rate_limited",
            DenialReason::GpuPressureHigh => "gpu_pressure_high",
            DenialReason::NoDeviceAvailable => "no_device_available",
            DenialReason::ModelUnavailable => "model_unavailable",
            DenialReason::QuotaExceeded => "quota_exceeded",
        }
    }

    /// Whether a worker should leave the triggering message pending for
    /// reclaim rather than failing the job outright.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DenialReason::RateLimited
                | DenialReason::GpuPressureHigh
                | DenialReason::NoDeviceAvailable
        )
    }
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error kinds surfaced by the orchestrator engine and HTTP layer.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Fatal configuration problem; aborts startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Transient I/O that survived the adapter's retry budget. Callers may
    /// retry with the same job id; submission is idempotent.
    #[error("transient backend error: {0}")]
    Transient(String),

    /// Duplicate id with mismatched content.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("admission denied: {0}")]
    AdmissionDenied(DenialReason),

    /// Leader-gated operation invoked on a follower.
    #[error("this node is not the leader")]
    NotLeader,

    /// Lease-specific: the reservation is gone; the caller must abort.
    #[error("lease expired")]
    Expired,

    /// Schema or invariant violation; the process should not continue.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl OrchestratorError {
    /// Label used on error counters.
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::Config(_) => "config",
            OrchestratorError::Transient(_) => "transient",
            OrchestratorError::Conflict(_) => "conflict",
            OrchestratorError::NotFound(_) => "not_found",
            OrchestratorError::AdmissionDenied(_) => "admission_denied",
            OrchestratorError::NotLeader => "not_leader",
            OrchestratorError::Expired => "expired",
            OrchestratorError::Fatal(_) => "fatal",
        }
    }
}
