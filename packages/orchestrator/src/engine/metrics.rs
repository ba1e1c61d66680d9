//! Prometheus instruments for the orchestrator.
//!
//! Every surfaced error lands in either an audit row or one of these
//! counters; denial counters carry the enumerated `reason` label from the
//! admission contract.

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

pub struct Metrics {
    registry: Registry,

    pub admission_denials: IntCounterVec,
    pub leases_granted: IntCounter,
    pub leases_active: IntGauge,
    pub leases_expired: IntCounter,
    pub jobs_submitted: IntCounter,
    pub jobs_finalized: IntCounterVec,
    pub job_latency: Histogram,
    pub reclaims: IntCounter,
    pub dead_letters: IntCounter,
    pub pool_workers: IntGaugeVec,
    pub is_leader: IntGauge,
    pub reconcile_ticks: IntCounter,
    pub errors: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let admission_denials = IntCounterVec::new(
            Opts::new(
                "gpu_orchestrator_admission_denials_total",
                "Lease/submit admissions denied, by reason",
            ),
            &["reason"],
        )
        .unwrap();

        let leases_granted = IntCounter::new(
            "gpu_orchestrator_leases_granted_total",
            "Leases granted since start",
        )
        .unwrap();

        let leases_active = IntGauge::new(
            "gpu_orchestrator_leases_active",
            "Currently active (unreleased, unexpired) leases",
        )
        .unwrap();

        let leases_expired = IntCounter::new(
            "gpu_orchestrator_leases_expired_total",
            "Leases marked expired by the reconciler",
        )
        .unwrap();

        let jobs_submitted = IntCounter::new(
            "gpu_orchestrator_jobs_submitted_total",
            "Jobs accepted by submit",
        )
        .unwrap();

        let jobs_finalized = IntCounterVec::new(
            Opts::new(
                "gpu_orchestrator_jobs_finalized_total",
                "Jobs finalized, by terminal status",
            ),
            &["status"],
        )
        .unwrap();

        let job_latency = Histogram::with_opts(
            HistogramOpts::new(
                "gpu_orchestrator_job_latency_seconds",
                "Submit-to-finalize latency",
            )
            .buckets(vec![
                0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0,
            ]),
        )
        .unwrap();

        let reclaims = IntCounter::new(
            "gpu_orchestrator_reclaims_total",
            "Idle pending bus entries reclaimed",
        )
        .unwrap();

        let dead_letters = IntCounter::new(
            "gpu_orchestrator_dead_letters_total",
            "Jobs moved to the dead-letter partition",
        )
        .unwrap();

        let pool_workers = IntGaugeVec::new(
            Opts::new(
                "gpu_orchestrator_pool_workers",
                "Desired and spawned workers per pool",
            ),
            &["pool_id", "kind"],
        )
        .unwrap();

        let is_leader = IntGauge::new(
            "gpu_orchestrator_is_leader",
            "1 when this process holds the leader lock",
        )
        .unwrap();

        let reconcile_ticks = IntCounter::new(
            "gpu_orchestrator_reconcile_ticks_total",
            "Completed reconciliation passes",
        )
        .unwrap();

        let errors = IntCounterVec::new(
            Opts::new("gpu_orchestrator_errors_total", "Surfaced errors, by kind"),
            &["kind"],
        )
        .unwrap();

        for collector in [
            Box::new(admission_denials.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(leases_granted.clone()),
            Box::new(leases_active.clone()),
            Box::new(leases_expired.clone()),
            Box::new(jobs_submitted.clone()),
            Box::new(jobs_finalized.clone()),
            Box::new(job_latency.clone()),
            Box::new(reclaims.clone()),
            Box::new(dead_letters.clone()),
            Box::new(pool_workers.clone()),
            Box::new(is_leader.clone()),
            Box::new(reconcile_ticks.clone()),
            Box::new(errors.clone()),
        ] {
            registry.register(collector).unwrap();
        }

        Self {
            registry,
            admission_denials,
            leases_granted,
            leases_active,
            leases_expired,
            jobs_submitted,
            jobs_finalized,
            job_latency,
            reclaims,
            dead_letters,
            pool_workers,
            is_leader,
            reconcile_ticks,
            errors,
        }
    }

    /// Prometheus text exposition.
    pub fn export(&self) -> String {
        let encoder = TextEncoder::new();
        encoder
            .encode_to_string(&self.registry.gather())
            .unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_contains_registered_families() {
        let metrics = Metrics::new();
        metrics.leases_granted.inc();
        metrics
            .admission_denials
            .with_label_values(&["gpu_pressure_high"])
            .inc();

        let text = metrics.export();
        assert!(text.contains("gpu_orchestrator_leases_granted_total 1"));
        assert!(text.contains("reason=\"gpu_pressure_high\""));
    }

    #[test]
    fn latency_histogram_observes() {
        let metrics = Metrics::new();
        metrics.job_latency.observe(0.3);
        assert!(metrics
            .export()
            .contains("gpu_orchestrator_job_latency_seconds_count 1"));
    }
}
