// Newsdesk Orchestration Core
//
// This crate provides the GPU/resource orchestrator for the multi-agent news
// analysis platform: admission control, GPU leases, worker pools, durable job
// dispatch over Redis Streams, leader-elected reconciliation, and the agent
// registry/router that agents use to address one another.
//
// Agents themselves are opaque workloads; crawlers, extractors, and dashboards
// talk to this crate through the HTTP surface in `server/`.

pub mod bus;
pub mod common;
pub mod config;
pub mod engine;
pub mod registry;
pub mod server;
pub mod store;
pub mod worker;

pub use config::{Config, Policy};
