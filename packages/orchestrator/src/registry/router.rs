//! Synchronous tool dispatch.
//!
//! Routing is exact-name with no fallback: an unknown agent or an
//! undeclared tool surfaces to the caller as a structured error instead of
//! being forwarded anywhere. Arguments travel as structured JSON values
//! (positional `args` plus named `kwargs`), never as opaque strings.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::AgentRegistry;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("no agent named '{0}' is registered")]
    NoAgent(String),

    #[error("agent '{agent}' does not declare tool '{tool}'")]
    NoTool { agent: String, tool: String },

    #[error("transport error calling '{agent}': {detail}")]
    Transport { agent: String, detail: String },

    #[error("call to '{agent}' timed out after {timeout:?}")]
    Timeout { agent: String, timeout: Duration },
}

/// A tool invocation addressed to one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub agent: String,
    pub tool: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    #[serde(default)]
    pub kwargs: serde_json::Map<String, serde_json::Value>,
}

/// Body posted to the agent's endpoint.
#[derive(Debug, Serialize)]
struct ToolRequest<'a> {
    args: &'a [serde_json::Value],
    kwargs: &'a serde_json::Map<String, serde_json::Value>,
}

/// Forwards tool calls to registered agents over HTTP.
pub struct AgentRouter {
    registry: Arc<AgentRegistry>,
    http: reqwest::Client,
    default_timeout: Duration,
}

impl AgentRouter {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self {
            registry,
            http: reqwest::Client::new(),
            default_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Validate against the registry snapshot, then POST
    /// `{address}/{tool}` with the structured arguments.
    ///
    /// A successful round trip doubles as an agent heartbeat.
    pub async fn call(
        &self,
        call: &ToolCall,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, RouterError> {
        let agent = self
            .registry
            .get(&call.agent)
            .ok_or_else(|| RouterError::NoAgent(call.agent.clone()))?;

        if !agent.declares_tool(&call.tool) {
            return Err(RouterError::NoTool {
                agent: call.agent.clone(),
                tool: call.tool.clone(),
            });
        }

        let timeout = timeout.unwrap_or(self.default_timeout);
        let url = format!("{}/{}", agent.address, call.tool);
        debug!(agent = %call.agent, tool = %call.tool, url = %url, "dispatching tool call");

        let response = self
            .http
            .post(&url)
            .timeout(timeout)
            .json(&ToolRequest {
                args: &call.args,
                kwargs: &call.kwargs,
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RouterError::Timeout {
                        agent: call.agent.clone(),
                        timeout,
                    }
                } else {
                    RouterError::Transport {
                        agent: call.agent.clone(),
                        detail: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(RouterError::Transport {
                agent: call.agent.clone(),
                detail: format!("agent returned status {}: {}", status.as_u16(), body),
            });
        }

        let value = response.json::<serde_json::Value>().await.map_err(|e| {
            RouterError::Transport {
                agent: call.agent.clone(),
                detail: format!("bad response body: {}", e),
            }
        })?;

        self.registry.heartbeat(&call.agent);
        Ok(value)
    }
}
