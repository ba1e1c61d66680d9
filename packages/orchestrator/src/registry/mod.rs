//! Agent registry and synchronous tool router.
//!
//! The registry is the process-wide map of live agents and the tools they
//! declare. Writers go through explicit register/deregister; readers take a
//! copy-on-write snapshot so a registration mid-request never tears a
//! routing decision.

mod router;

pub use router::{AgentRouter, RouterError, ToolCall};

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A live agent: its callable address and declared tool set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub name: String,
    /// Base URL the router dispatches tool calls to.
    pub address: String,
    pub tools: BTreeSet<String>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

impl AgentInfo {
    pub fn declares_tool(&self, tool: &str) -> bool {
        self.tools.contains(tool)
    }
}

/// Process-wide agent table with copy-on-write snapshots.
#[derive(Default)]
pub struct AgentRegistry {
    agents: RwLock<Arc<HashMap<String, AgentInfo>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or overwrite an agent. Re-registering is how agents
    /// heartbeat, so `last_heartbeat_at` always refreshes; the original
    /// `registered_at` survives an overwrite.
    pub fn register(&self, name: &str, address: &str, tools: impl IntoIterator<Item = String>) {
        let now = Utc::now();
        let mut guard = self.agents.write().unwrap_or_else(|e| e.into_inner());
        let mut next = HashMap::clone(&guard);
        let registered_at = next
            .get(name)
            .map(|existing| existing.registered_at)
            .unwrap_or(now);
        next.insert(
            name.to_string(),
            AgentInfo {
                name: name.to_string(),
                address: address.trim_end_matches('/').to_string(),
                tools: tools.into_iter().collect(),
                registered_at,
                last_heartbeat_at: now,
            },
        );
        *guard = Arc::new(next);
    }

    /// Idempotent removal.
    pub fn deregister(&self, name: &str) {
        let mut guard = self.agents.write().unwrap_or_else(|e| e.into_inner());
        if !guard.contains_key(name) {
            return;
        }
        let mut next = HashMap::clone(&guard);
        next.remove(name);
        *guard = Arc::new(next);
    }

    /// Refresh the agent's heartbeat; unknown names are ignored.
    pub fn heartbeat(&self, name: &str) {
        let mut guard = self.agents.write().unwrap_or_else(|e| e.into_inner());
        if !guard.contains_key(name) {
            return;
        }
        let mut next = HashMap::clone(&guard);
        if let Some(info) = next.get_mut(name) {
            info.last_heartbeat_at = Utc::now();
        }
        *guard = Arc::new(next);
    }

    /// Immutable view; unaffected by later registrations.
    pub fn snapshot(&self) -> Arc<HashMap<String, AgentInfo>> {
        Arc::clone(&self.agents.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn get(&self, name: &str) -> Option<AgentInfo> {
        self.snapshot().get(name).cloned()
    }

    pub fn list_agents(&self) -> Vec<AgentInfo> {
        let mut agents: Vec<AgentInfo> = self.snapshot().values().cloned().collect();
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        agents
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }
}
