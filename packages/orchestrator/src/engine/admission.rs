//! Admission control: per-agent token buckets and the global pressure gate.
//!
//! Denials are values, not exceptions — callers get the enumerated reason
//! and decide whether the triggering message stays pending or fails.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use crate::common::DenialReason;
use crate::config::Policy;

/// Classic token bucket: `rate` tokens/second up to `burst`.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(burst: f64, now: Instant) -> Self {
        Self {
            tokens: burst,
            last_refill: now,
        }
    }

    fn try_take(&mut self, rate: f64, burst: f64, now: Instant) -> bool {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(burst);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Hysteresis latch over device utilization.
///
/// Closes when any device crosses the high watermark and stays closed until
/// every device is back under the low watermark, so admission does not
/// flap around a single threshold.
#[derive(Debug, Default)]
struct PressureGate {
    closed: bool,
}

impl PressureGate {
    fn observe(&mut self, max_utilization_pct: f64, high: f64, low: f64) -> bool {
        if self.closed {
            if max_utilization_pct <= low {
                self.closed = false;
            }
        } else if max_utilization_pct >= high {
            self.closed = true;
        }
        self.closed
    }
}

/// Admission state for one orchestrator process.
///
/// One mutex guards both structures; the engine already serializes
/// admission + device selection, so there is no finer-grained contention
/// worth optimizing for.
pub struct Admission {
    policy: Policy,
    buckets: Mutex<HashMap<String, TokenBucket>>,
    gate: Mutex<PressureGate>,
}

impl Admission {
    pub fn new(policy: Policy) -> Self {
        Self {
            policy,
            buckets: Mutex::new(HashMap::new()),
            gate: Mutex::new(PressureGate::default()),
        }
    }

    /// Rate check for one agent. `Err` carries `rate_limited`.
    pub fn check_rate(&self, agent: &str) -> Result<(), DenialReason> {
        self.check_rate_at(agent, Instant::now())
    }

    pub(crate) fn check_rate_at(&self, agent: &str, now: Instant) -> Result<(), DenialReason> {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = buckets
            .entry(agent.to_string())
            .or_insert_with(|| TokenBucket::new(self.policy.per_agent_burst, now));

        if bucket.try_take(self.policy.per_agent_rate, self.policy.per_agent_burst, now) {
            Ok(())
        } else {
            Err(DenialReason::RateLimited)
        }
    }

    /// Feed the latest utilization sample into the gate. `Err` carries
    /// `gpu_pressure_high` while the latch is closed.
    pub fn check_pressure(&self, max_utilization_pct: f64) -> Result<(), DenialReason> {
        let mut gate = self.gate.lock().unwrap_or_else(|e| e.into_inner());
        if gate.observe(
            max_utilization_pct,
            self.policy.global_gpu_pressure_high_pct,
            self.policy.global_gpu_pressure_low_pct,
        ) {
            Err(DenialReason::GpuPressureHigh)
        } else {
            Ok(())
        }
    }
}
