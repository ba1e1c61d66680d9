//! GPU inventory and device selection.
//!
//! Utilization and memory figures come from a sampler behind a trait; the
//! orchestrator core never talks to a driver directly. The default sampler
//! serves a copy-on-write snapshot seeded from config and updated by
//! whatever telemetry feed the deployment wires in.

use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::config::DeviceSpec;

/// One device's latest observed state.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub index: i32,
    pub total_memory_mb: u64,
    pub used_memory_mb: u64,
    pub utilization_pct: f64,
}

impl DeviceSnapshot {
    pub fn free_memory_mb(&self) -> u64 {
        self.total_memory_mb.saturating_sub(self.used_memory_mb)
    }
}

/// Source of device state for admission and selection.
pub trait GpuSampler: Send + Sync {
    fn sample(&self) -> Vec<DeviceSnapshot>;
}

/// Sampler backed by a mutable snapshot.
///
/// Seeded idle from the configured inventory; `update` replaces one
/// device's figures (telemetry push or test setup). Readers clone an Arc,
/// so sampling never blocks on a writer.
pub struct StaticGpuSampler {
    devices: RwLock<Arc<Vec<DeviceSnapshot>>>,
}

impl StaticGpuSampler {
    pub fn from_specs(specs: &[DeviceSpec]) -> Self {
        let devices = specs
            .iter()
            .map(|spec| DeviceSnapshot {
                index: spec.index,
                total_memory_mb: spec.total_memory_mb,
                used_memory_mb: 0,
                utilization_pct: 0.0,
            })
            .collect();
        Self {
            devices: RwLock::new(Arc::new(devices)),
        }
    }

    /// Replace one device's observed figures; unknown indices are ignored.
    pub fn update(&self, index: i32, used_memory_mb: u64, utilization_pct: f64) {
        let mut guard = self.devices.write().unwrap_or_else(|e| e.into_inner());
        let mut next = Vec::clone(&guard);
        if let Some(device) = next.iter_mut().find(|d| d.index == index) {
            device.used_memory_mb = used_memory_mb;
            device.utilization_pct = utilization_pct;
        }
        *guard = Arc::new(next);
    }
}

impl GpuSampler for StaticGpuSampler {
    fn sample(&self) -> Vec<DeviceSnapshot> {
        Vec::clone(&self.devices.read().unwrap_or_else(|e| e.into_inner()))
    }
}

/// Pick the device for a lease request.
///
/// Candidates need `free_memory_mb >= min_memory_mb`; ranking is free
/// memory descending, then active-lease count ascending, then index
/// ascending. `None` means `no_device_available`.
pub fn select_device(
    devices: &[DeviceSnapshot],
    active_leases: &[(i32, i64)],
    min_memory_mb: u64,
) -> Option<i32> {
    let lease_count = |index: i32| -> i64 {
        active_leases
            .iter()
            .find(|(device, _)| *device == index)
            .map(|(_, count)| *count)
            .unwrap_or(0)
    };

    devices
        .iter()
        .filter(|d| d.free_memory_mb() >= min_memory_mb)
        .min_by(|a, b| {
            b.free_memory_mb()
                .cmp(&a.free_memory_mb())
                .then(lease_count(a.index).cmp(&lease_count(b.index)))
                .then(a.index.cmp(&b.index))
        })
        .map(|d| d.index)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(index: i32, total: u64, used: u64) -> DeviceSnapshot {
        DeviceSnapshot {
            index,
            total_memory_mb: total,
            used_memory_mb: used,
            utilization_pct: 0.0,
        }
    }

    #[test]
    fn picks_most_free_memory() {
        let devices = vec![device(0, 24576, 20000), device(1, 24576, 1000)];
        assert_eq!(select_device(&devices, &[], 2048), Some(1));
    }

    #[test]
    fn insufficient_memory_everywhere_yields_none() {
        let devices = vec![device(0, 8192, 7000), device(1, 8192, 7500)];
        assert_eq!(select_device(&devices, &[], 4096), None);
    }

    #[test]
    fn lease_count_breaks_free_memory_ties() {
        let devices = vec![device(0, 24576, 0), device(1, 24576, 0)];
        assert_eq!(select_device(&devices, &[(0, 3), (1, 1)], 1024), Some(1));
    }

    #[test]
    fn index_breaks_remaining_ties() {
        let devices = vec![device(1, 24576, 0), device(0, 24576, 0)];
        assert_eq!(select_device(&devices, &[], 1024), Some(0));
    }

    #[test]
    fn empty_inventory_yields_none() {
        assert_eq!(select_device(&[], &[], 0), None);
    }

    #[test]
    fn sampler_update_replaces_figures() {
        let sampler = StaticGpuSampler::from_specs(&[DeviceSpec {
            index: 0,
            total_memory_mb: 24576,
        }]);
        sampler.update(0, 12000, 92.0);

        let snapshot = sampler.sample();
        assert_eq!(snapshot[0].used_memory_mb, 12000);
        assert_eq!(snapshot[0].free_memory_mb(), 12576);
        assert!((snapshot[0].utilization_pct - 92.0).abs() < f64::EPSILON);
    }
}
