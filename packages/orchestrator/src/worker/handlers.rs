//! Handler registry for job execution.
//!
//! Maps job type strings to the agent code that runs them, together with
//! the resources that code needs. The runtime claims a job from the bus,
//! looks its type up here, leases what the registration demands, and
//! dispatches without knowing any concrete payload type.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::registry::AgentRouter;
use crate::store::{Job, LeaseMode, Store};

/// What a handler needs before it may run.
#[derive(Debug, Clone)]
pub struct ResourceNeeds {
    /// `None` means the handler runs without any lease.
    pub lease: Option<LeaseNeeds>,
}

#[derive(Debug, Clone)]
pub struct LeaseNeeds {
    pub mode: LeaseMode,
    pub min_memory_mb: u64,
    pub model_id: Option<String>,
}

impl ResourceNeeds {
    pub fn none() -> Self {
        Self { lease: None }
    }

    pub fn gpu(min_memory_mb: u64, model_id: Option<String>) -> Self {
        Self {
            lease: Some(LeaseNeeds {
                mode: LeaseMode::Gpu,
                min_memory_mb,
                model_id,
            }),
        }
    }

    pub fn cpu_slot(model_id: Option<String>) -> Self {
        Self {
            lease: Some(LeaseNeeds {
                mode: LeaseMode::Cpu,
                min_memory_mb: 0,
                model_id,
            }),
        }
    }
}

/// Everything a handler may touch while running.
///
/// Handlers must consult the job row before side-effecting external
/// systems: deliveries are at-least-once and a duplicate must not commit
/// twice. The cancellation token flips when lease heartbeats fail; long
/// handlers are expected to check it between checkpoints.
pub struct WorkerContext {
    pub job: Job,
    pub cancel: CancellationToken,
    pub store: Store,
    pub router: Arc<AgentRouter>,
}

type BoxedHandler = Box<
    dyn Fn(serde_json::Value, WorkerContext) -> Pin<Box<dyn Future<Output = Result<()>> + Send>>
        + Send
        + Sync,
>;

struct HandlerRegistration {
    needs: ResourceNeeds,
    handler: BoxedHandler,
}

/// Registry that maps job types to handlers and their resource needs.
#[derive(Default)]
pub struct HandlerRegistry {
    registrations: HashMap<&'static str, HandlerRegistration>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            registrations: HashMap::new(),
        }
    }

    /// Register a job type.
    ///
    /// The payload is deserialized to `J` before the handler runs; a
    /// payload that does not parse is a permanent failure.
    pub fn register<J, F, Fut>(&mut self, job_type: &'static str, needs: ResourceNeeds, handler: F)
    where
        J: DeserializeOwned + Send + 'static,
        F: Fn(J, WorkerContext) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let boxed: BoxedHandler = Box::new(move |value, ctx| {
            let handler = handler.clone();
            Box::pin(async move {
                let payload: J = serde_json::from_value(value)
                    .map_err(|e| anyhow!("failed to deserialize {} payload: {}", job_type, e))?;
                handler(payload, ctx).await
            })
        });

        self.registrations.insert(
            job_type,
            HandlerRegistration {
                needs,
                handler: boxed,
            },
        );
    }

    pub fn needs(&self, job_type: &str) -> Option<&ResourceNeeds> {
        self.registrations.get(job_type).map(|r| &r.needs)
    }

    pub fn is_registered(&self, job_type: &str) -> bool {
        self.registrations.contains_key(job_type)
    }

    pub fn registered_types(&self) -> Vec<&'static str> {
        let mut types: Vec<&'static str> = self.registrations.keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Run the handler for a claimed job.
    pub async fn execute(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        ctx: WorkerContext,
    ) -> Result<()> {
        let registration = self
            .registrations
            .get(job_type)
            .ok_or_else(|| anyhow!("unknown job type: {}", job_type))?;
        (registration.handler)(payload, ctx).await
    }
}

/// The canonical job payload: invoke one tool on one agent.
///
/// Inference and ingest jobs are tool calls routed through the agent
/// registry; the lease the runtime acquired stays held for the duration.
#[derive(Debug, serde::Deserialize)]
pub struct ToolCallJob {
    pub agent: String,
    pub tool: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    #[serde(default)]
    pub kwargs: serde_json::Map<String, serde_json::Value>,
    pub timeout_ms: Option<u64>,
}

/// Standard handler body for [`ToolCallJob`] payloads.
pub async fn run_tool_call(job: ToolCallJob, ctx: WorkerContext) -> Result<()> {
    if ctx.cancel.is_cancelled() {
        return Err(anyhow!("cancelled before dispatch"));
    }

    let call = crate::registry::ToolCall {
        agent: job.agent,
        tool: job.tool,
        args: job.args,
        kwargs: job.kwargs,
    };
    let timeout = job.timeout_ms.map(std::time::Duration::from_millis);

    ctx.router
        .call(&call, timeout)
        .await
        .map(|_| ())
        .map_err(|e| anyhow!(e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Noop {}

    fn registry_with_noop() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register::<Noop, _, _>("noop", ResourceNeeds::none(), |_job, _ctx| async {
            Ok(())
        });
        registry
    }

    #[test]
    fn registered_types_are_listed() {
        let registry = registry_with_noop();
        assert!(registry.is_registered("noop"));
        assert!(!registry.is_registered("mystery"));
        assert_eq!(registry.registered_types(), vec!["noop"]);
    }

    #[test]
    fn gpu_needs_carry_memory_floor() {
        let needs = ResourceNeeds::gpu(8192, Some("m1".to_string()));
        let lease = needs.lease.unwrap();
        assert!(matches!(lease.mode, LeaseMode::Gpu));
        assert_eq!(lease.min_memory_mb, 8192);
    }

    #[test]
    fn none_needs_no_lease() {
        assert!(ResourceNeeds::none().lease.is_none());
    }
}
