//! Redis Streams implementation of the event bus.
//!
//! One stream per partition, `XADD`/`XREADGROUP`/`XACK` for the delivery
//! cycle, `XPENDING IDLE` + `XCLAIM` for the reclaimer. The connection
//! manager transparently reconnects; transient command failures additionally
//! go through the shared retry policy.

use std::collections::HashMap;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::streams::{StreamClaimReply, StreamId, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;

use super::{BusEntry, BusError, BusMessage, BusResult, EventBus, PendingEntry, Stream};
use crate::common::RetryPolicy;

/// Upper bound on one pending-entries inspection batch.
const PENDING_BATCH: usize = 1024;

pub struct RedisEventBus {
    conn: ConnectionManager,
    retry: RetryPolicy,
}

impl RedisEventBus {
    /// Connect and hold a managed connection.
    pub async fn connect(redis_url: &str) -> BusResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| BusError::Config(format!("invalid redis url: {}", e)))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(classify)?;

        Ok(Self {
            conn,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn decode(id: StreamId) -> BusResult<BusMessage> {
        let mut fields = HashMap::with_capacity(id.map.len());
        for (key, value) in &id.map {
            let text: String = redis::from_redis_value(value).map_err(|e| {
                BusError::Encoding(format!("field '{}' is not a string: {}", key, e))
            })?;
            fields.insert(key.clone(), text);
        }
        Ok(BusMessage {
            id: id.id,
            entry: BusEntry::from_fields(&fields)?,
        })
    }
}

fn classify(e: redis::RedisError) -> BusError {
    if e.code() == Some("NOGROUP") {
        return BusError::Config(format!("consumer group missing: {}", e));
    }
    match e.kind() {
        redis::ErrorKind::TypeError => BusError::Encoding(e.to_string()),
        redis::ErrorKind::InvalidClientConfig => BusError::Config(e.to_string()),
        _ => BusError::Transient(e.to_string()),
    }
}

#[async_trait::async_trait]
impl EventBus for RedisEventBus {
    async fn append(&self, stream: Stream, entry: &BusEntry) -> BusResult<String> {
        let fields = entry.to_fields();
        self.retry
            .run("bus.append", BusError::is_transient, || {
                let mut conn = self.conn.clone();
                let fields = fields.clone();
                async move {
                    let id: String = conn
                        .xadd(stream.key(), "*", &fields)
                        .await
                        .map_err(classify)?;
                    Ok(id)
                }
            })
            .await
    }

    async fn read_group(
        &self,
        stream: Stream,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> BusResult<Vec<BusMessage>> {
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block.as_millis() as usize);

        let mut conn = self.conn.clone();
        let reply: StreamReadReply = conn
            .xread_options(&[stream.key()], &[">"], &opts)
            .await
            .map_err(classify)?;

        let mut messages = Vec::new();
        for key in reply.keys {
            for id in key.ids {
                messages.push(Self::decode(id)?);
            }
        }
        Ok(messages)
    }

    async fn ack(&self, stream: Stream, group: &str, msg_id: &str) -> BusResult<()> {
        self.retry
            .run("bus.ack", BusError::is_transient, || {
                let mut conn = self.conn.clone();
                async move {
                    let _: i64 = conn
                        .xack(stream.key(), group, &[msg_id])
                        .await
                        .map_err(classify)?;
                    Ok(())
                }
            })
            .await
    }

    async fn pending(
        &self,
        stream: Stream,
        group: &str,
        idle: Duration,
    ) -> BusResult<Vec<PendingEntry>> {
        self.retry
            .run("bus.pending", BusError::is_transient, || {
                let mut conn = self.conn.clone();
                async move {
                    let reply: redis::streams::StreamPendingCountReply = redis::cmd("XPENDING")
                        .arg(stream.key())
                        .arg(group)
                        .arg("IDLE")
                        .arg(idle.as_millis() as u64)
                        .arg("-")
                        .arg("+")
                        .arg(PENDING_BATCH)
                        .query_async(&mut conn)
                        .await
                        .map_err(classify)?;

                    Ok(reply
                        .ids
                        .into_iter()
                        .map(|p| PendingEntry {
                            id: p.id,
                            consumer: p.consumer,
                            idle: Duration::from_millis(p.last_delivered_ms as u64),
                            delivery_count: p.times_delivered as u64,
                        })
                        .collect())
                }
            })
            .await
    }

    async fn reclaim(
        &self,
        stream: Stream,
        group: &str,
        consumer: &str,
        msg_ids: &[String],
        idle: Duration,
    ) -> BusResult<Vec<BusMessage>> {
        if msg_ids.is_empty() {
            return Ok(Vec::new());
        }

        let reply: StreamClaimReply = self
            .retry
            .run("bus.reclaim", BusError::is_transient, || {
                let mut conn = self.conn.clone();
                async move {
                    conn.xclaim(
                        stream.key(),
                        group,
                        consumer,
                        idle.as_millis() as usize,
                        msg_ids,
                    )
                    .await
                    .map_err(classify)
                }
            })
            .await?;

        reply.ids.into_iter().map(Self::decode).collect()
    }

    async fn ensure_group(&self, stream: Stream, group: &str, from_start: bool) -> BusResult<()> {
        let start_id = if from_start { "0" } else { "$" };
        self.retry
            .run("bus.ensure_group", BusError::is_transient, || {
                let mut conn = self.conn.clone();
                async move {
                    let created: Result<String, redis::RedisError> = conn
                        .xgroup_create_mkstream(stream.key(), group, start_id)
                        .await;
                    match created {
                        Ok(_) => Ok(()),
                        // Group already exists; creation is idempotent.
                        Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
                        Err(e) => Err(classify(e)),
                    }
                }
            })
            .await
    }

    async fn ping(&self) -> BusResult<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(classify)?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(BusError::Transient(format!("unexpected ping reply: {}", pong)))
        }
    }
}
