//! Durable event bus.
//!
//! A partitioned, append-only log with consumer groups, per-message
//! acknowledgement, pending-entry inspection, and reclaim by id. Delivery is
//! at-least-once; consumer-group ownership is the exclusive-use token for an
//! in-flight message. Job dispatch, preload requests, control commands, and
//! the dead-letter partition all ride on it.

mod redis_bus;
pub mod testing;

pub use redis_bus::RedisEventBus;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// The orchestrator's partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stream {
    Preloads,
    InferenceJobs,
    IngestEvents,
    Control,
    Dlq,
}

impl Stream {
    pub const ALL: [Stream; 5] = [
        Stream::Preloads,
        Stream::InferenceJobs,
        Stream::IngestEvents,
        Stream::Control,
        Stream::Dlq,
    ];

    /// Redis key / partition name.
    pub fn key(&self) -> &'static str {
        match self {
            Stream::Preloads => "stream:orchestrator:preloads",
            Stream::InferenceJobs => "stream:orchestrator:inference_jobs",
            Stream::IngestEvents => "stream:orchestrator:ingest_events",
            Stream::Control => "stream:orchestrator:control",
            Stream::Dlq => "stream:orchestrator:dlq",
        }
    }

    /// Default consumer group per partition.
    pub fn default_group(&self) -> &'static str {
        match self {
            Stream::Preloads => "cg:preloads:workers",
            Stream::InferenceJobs => "cg:inference:workers",
            Stream::IngestEvents => "cg:ingest:workers",
            Stream::Control => "cg:control:workers",
            Stream::Dlq => "cg:dlq:inspectors",
        }
    }

    /// Group name for a pool-scoped inference consumer.
    pub fn pool_group(pool_id: Uuid) -> String {
        format!("cg:inference:pool-{}", pool_id)
    }
}

impl std::fmt::Display for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// Fields carried by every bus entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEntry {
    /// Job id where applicable (dispatch and DLQ entries).
    pub job_id: Option<String>,
    /// Entry discriminator, e.g. the job type or a control verb.
    pub entry_type: String,
    pub payload: serde_json::Value,
    /// Delivery attempts already spent on this logical message.
    pub attempts: i32,
    /// Pool the delivery is addressed to. Consumer groups broadcast, so
    /// workers outside this scope ack the delivery without claiming it.
    pub pool_id: Option<Uuid>,
    /// Original message id, set when the reclaimer re-appends or moves an
    /// entry to the dead-letter partition.
    pub origin_msg_id: Option<String>,
}

impl BusEntry {
    pub fn job(job_id: impl Into<String>, entry_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            job_id: Some(job_id.into()),
            entry_type: entry_type.into(),
            payload,
            attempts: 0,
            pool_id: None,
            origin_msg_id: None,
        }
    }

    pub fn control(entry_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            job_id: None,
            entry_type: entry_type.into(),
            payload,
            attempts: 0,
            pool_id: None,
            origin_msg_id: None,
        }
    }

    /// Flatten into the string field pairs stored on the stream.
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("type", self.entry_type.clone()),
            ("payload", self.payload.to_string()),
            ("attempts", self.attempts.to_string()),
        ];
        if let Some(job_id) = &self.job_id {
            fields.push(("job_id", job_id.clone()));
        }
        if let Some(pool_id) = &self.pool_id {
            fields.push(("pool_id", pool_id.to_string()));
        }
        if let Some(origin) = &self.origin_msg_id {
            fields.push(("origin_msg_id", origin.clone()));
        }
        fields
    }

    /// Rebuild from stream fields; missing or malformed fields are an
    /// encoding error, not a panic.
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, BusError> {
        let entry_type = fields
            .get("type")
            .cloned()
            .ok_or_else(|| BusError::Encoding("entry missing 'type' field".to_string()))?;
        let payload = match fields.get("payload") {
            Some(raw) => serde_json::from_str(raw)
                .map_err(|e| BusError::Encoding(format!("bad payload json: {}", e)))?,
            None => serde_json::Value::Null,
        };
        let attempts = fields
            .get("attempts")
            .map(|raw| raw.parse::<i32>())
            .transpose()
            .map_err(|e| BusError::Encoding(format!("bad attempts field: {}", e)))?
            .unwrap_or(0);
        let pool_id = fields
            .get("pool_id")
            .map(|raw| Uuid::parse_str(raw))
            .transpose()
            .map_err(|e| BusError::Encoding(format!("bad pool_id field: {}", e)))?;

        Ok(Self {
            job_id: fields.get("job_id").cloned(),
            entry_type,
            payload,
            attempts,
            pool_id,
            origin_msg_id: fields.get("origin_msg_id").cloned(),
        })
    }
}

/// A delivered message: stream id plus decoded entry.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub id: String,
    pub entry: BusEntry,
}

/// An unacknowledged delivery, from pending-entries inspection.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub id: String,
    pub consumer: String,
    pub idle: Duration,
    pub delivery_count: u64,
}

#[derive(Debug, Error)]
pub enum BusError {
    /// Retry-safe I/O failure.
    #[error("transient bus error: {0}")]
    Transient(String),

    /// Malformed entry on the stream.
    #[error("bus encoding error: {0}")]
    Encoding(String),

    /// Misconfiguration (bad URL, missing stream/group).
    #[error("bus configuration error: {0}")]
    Config(String),
}

impl BusError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BusError::Transient(_))
    }
}

pub type BusResult<T> = Result<T, BusError>;

/// Durable FIFO-per-partition log with consumer groups.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Append an entry; returns the assigned message id.
    async fn append(&self, stream: Stream, entry: &BusEntry) -> BusResult<String>;

    /// Deliver up to `count` never-delivered (or explicitly reclaimed)
    /// messages to `consumer`, blocking at most `block`.
    async fn read_group(
        &self,
        stream: Stream,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> BusResult<Vec<BusMessage>>;

    /// Acknowledge one message. Idempotent.
    async fn ack(&self, stream: Stream, group: &str, msg_id: &str) -> BusResult<()>;

    /// Entries delivered but unacked for at least `idle`.
    async fn pending(
        &self,
        stream: Stream,
        group: &str,
        idle: Duration,
    ) -> BusResult<Vec<PendingEntry>>;

    /// Transfer ownership of the given ids to `consumer`, provided they have
    /// been idle at least `idle`. Returns the reclaimed messages.
    async fn reclaim(
        &self,
        stream: Stream,
        group: &str,
        consumer: &str,
        msg_ids: &[String],
        idle: Duration,
    ) -> BusResult<Vec<BusMessage>>;

    /// Create the consumer group if it does not exist.
    async fn ensure_group(&self, stream: Stream, group: &str, from_start: bool) -> BusResult<()>;

    /// Reachability probe for `/ready` and `require_bus` startup gating.
    async fn ping(&self) -> BusResult<()>;
}
