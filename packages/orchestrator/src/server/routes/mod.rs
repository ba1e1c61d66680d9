pub mod agents;
pub mod control;
pub mod health;
pub mod jobs;
pub mod leases;
pub mod pools;

pub use agents::{call_handler, deregister_handler, list_agents_handler, register_handler};
pub use control::{
    device_telemetry_handler, drain_pool_handler, evict_pool_handler, recent_audit_handler,
    reconcile_handler,
};
pub use health::{health_handler, metrics_handler, ready_handler};
pub use jobs::{get_job_handler, submit_job_handler};
pub use leases::{heartbeat_lease_handler, release_lease_handler, request_lease_handler};
pub use pools::{list_pools_handler, request_pool_handler};
