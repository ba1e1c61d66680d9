pub mod harness;

pub use harness::{
    device, spawn_pool_worker, spawn_worker, test_policy, wait_for_job_status, TestHarness,
};
