//! In-memory event bus for unit tests.
//!
//! Mirrors the consumer-group semantics the reclaimer and worker rely on:
//! never-delivered messages go to readers, delivered-but-unacked messages sit
//! pending with an idle clock, reclaim transfers ownership. Blocking reads
//! return immediately when the stream is drained.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use super::{BusEntry, BusMessage, BusResult, EventBus, PendingEntry, Stream};

#[derive(Debug, Clone)]
struct PendingState {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u64,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Index of the next never-delivered entry.
    cursor: usize,
    pending: HashMap<String, PendingState>,
}

#[derive(Debug, Default)]
struct StreamState {
    seq: u64,
    entries: Vec<(String, BusEntry)>,
    groups: HashMap<String, GroupState>,
}

/// Test double for [`EventBus`].
#[derive(Default)]
pub struct InMemoryEventBus {
    streams: Mutex<HashMap<&'static str, StreamState>>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total entries ever appended to a stream.
    pub async fn len(&self, stream: Stream) -> usize {
        self.streams
            .lock()
            .await
            .get(stream.key())
            .map(|s| s.entries.len())
            .unwrap_or(0)
    }

    pub async fn is_empty(&self, stream: Stream) -> bool {
        self.len(stream).await == 0
    }

    /// Entry bodies for assertions, in append order.
    pub async fn entries(&self, stream: Stream) -> Vec<BusEntry> {
        self.streams
            .lock()
            .await
            .get(stream.key())
            .map(|s| s.entries.iter().map(|(_, e)| e.clone()).collect())
            .unwrap_or_default()
    }

    /// Force a pending entry's idle clock back, standing in for wall time.
    pub async fn age_pending(&self, stream: Stream, group: &str, msg_id: &str, by: Duration) {
        let mut streams = self.streams.lock().await;
        if let Some(pending) = streams
            .get_mut(stream.key())
            .and_then(|s| s.groups.get_mut(group))
            .and_then(|g| g.pending.get_mut(msg_id))
        {
            pending.delivered_at -= by;
        }
    }
}

#[async_trait::async_trait]
impl EventBus for InMemoryEventBus {
    async fn append(&self, stream: Stream, entry: &BusEntry) -> BusResult<String> {
        let mut streams = self.streams.lock().await;
        let state = streams.entry(stream.key()).or_default();
        state.seq += 1;
        let id = format!("{}-0", state.seq);
        state.entries.push((id.clone(), entry.clone()));
        Ok(id)
    }

    async fn read_group(
        &self,
        stream: Stream,
        group: &str,
        consumer: &str,
        count: usize,
        _block: Duration,
    ) -> BusResult<Vec<BusMessage>> {
        let mut streams = self.streams.lock().await;
        let state = streams.entry(stream.key()).or_default();
        let group_state = state.groups.entry(group.to_string()).or_default();

        let mut delivered = Vec::new();
        while delivered.len() < count && group_state.cursor < state.entries.len() {
            let (id, entry) = &state.entries[group_state.cursor];
            group_state.cursor += 1;
            group_state.pending.insert(
                id.clone(),
                PendingState {
                    consumer: consumer.to_string(),
                    delivered_at: Instant::now(),
                    delivery_count: 1,
                },
            );
            delivered.push(BusMessage {
                id: id.clone(),
                entry: entry.clone(),
            });
        }
        Ok(delivered)
    }

    async fn ack(&self, stream: Stream, group: &str, msg_id: &str) -> BusResult<()> {
        let mut streams = self.streams.lock().await;
        if let Some(group_state) = streams
            .get_mut(stream.key())
            .and_then(|s| s.groups.get_mut(group))
        {
            group_state.pending.remove(msg_id);
        }
        Ok(())
    }

    async fn pending(
        &self,
        stream: Stream,
        group: &str,
        idle: Duration,
    ) -> BusResult<Vec<PendingEntry>> {
        let streams = self.streams.lock().await;
        let Some(group_state) = streams.get(stream.key()).and_then(|s| s.groups.get(group)) else {
            return Ok(Vec::new());
        };

        let mut entries: Vec<PendingEntry> = group_state
            .pending
            .iter()
            .filter(|(_, p)| p.delivered_at.elapsed() >= idle)
            .map(|(id, p)| PendingEntry {
                id: id.clone(),
                consumer: p.consumer.clone(),
                idle: p.delivered_at.elapsed(),
                delivery_count: p.delivery_count,
            })
            .collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entries)
    }

    async fn reclaim(
        &self,
        stream: Stream,
        group: &str,
        consumer: &str,
        msg_ids: &[String],
        idle: Duration,
    ) -> BusResult<Vec<BusMessage>> {
        let mut streams = self.streams.lock().await;
        let Some(state) = streams.get_mut(stream.key()) else {
            return Ok(Vec::new());
        };
        let entries = state.entries.clone();
        let Some(group_state) = state.groups.get_mut(group) else {
            return Ok(Vec::new());
        };

        let mut reclaimed = Vec::new();
        for msg_id in msg_ids {
            let Some(pending) = group_state.pending.get_mut(msg_id) else {
                continue;
            };
            if pending.delivered_at.elapsed() < idle {
                continue;
            }
            pending.consumer = consumer.to_string();
            pending.delivered_at = Instant::now();
            pending.delivery_count += 1;
            if let Some((id, entry)) = entries.iter().find(|(id, _)| id == msg_id) {
                reclaimed.push(BusMessage {
                    id: id.clone(),
                    entry: entry.clone(),
                });
            }
        }
        Ok(reclaimed)
    }

    async fn ensure_group(&self, stream: Stream, group: &str, _from_start: bool) -> BusResult<()> {
        let mut streams = self.streams.lock().await;
        streams
            .entry(stream.key())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn ping(&self) -> BusResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(job_id: &str) -> BusEntry {
        BusEntry::job(job_id, "infer", serde_json::json!({}))
    }

    #[tokio::test]
    async fn delivered_once_until_reclaimed() {
        let bus = InMemoryEventBus::new();
        bus.append(Stream::InferenceJobs, &entry("j1")).await.unwrap();

        let first = bus
            .read_group(Stream::InferenceJobs, "g", "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        let second = bus
            .read_group(Stream::InferenceJobs, "g", "c2", 10, Duration::ZERO)
            .await
            .unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn ack_clears_pending() {
        let bus = InMemoryEventBus::new();
        bus.append(Stream::InferenceJobs, &entry("j1")).await.unwrap();
        let messages = bus
            .read_group(Stream::InferenceJobs, "g", "c1", 1, Duration::ZERO)
            .await
            .unwrap();
        bus.ack(Stream::InferenceJobs, "g", &messages[0].id)
            .await
            .unwrap();

        let pending = bus
            .pending(Stream::InferenceJobs, "g", Duration::ZERO)
            .await
            .unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn ack_is_idempotent() {
        let bus = InMemoryEventBus::new();
        bus.append(Stream::InferenceJobs, &entry("j1")).await.unwrap();
        let messages = bus
            .read_group(Stream::InferenceJobs, "g", "c1", 1, Duration::ZERO)
            .await
            .unwrap();
        bus.ack(Stream::InferenceJobs, "g", &messages[0].id)
            .await
            .unwrap();
        bus.ack(Stream::InferenceJobs, "g", &messages[0].id)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reclaim_respects_idle_threshold() {
        let bus = InMemoryEventBus::new();
        bus.append(Stream::InferenceJobs, &entry("j1")).await.unwrap();
        let messages = bus
            .read_group(Stream::InferenceJobs, "g", "c1", 1, Duration::ZERO)
            .await
            .unwrap();
        let ids = vec![messages[0].id.clone()];

        // Too fresh to steal.
        let reclaimed = bus
            .reclaim(Stream::InferenceJobs, "g", "c2", &ids, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(reclaimed.is_empty());

        bus.age_pending(
            Stream::InferenceJobs,
            "g",
            &ids[0],
            Duration::from_secs(120),
        )
        .await;
        let reclaimed = bus
            .reclaim(Stream::InferenceJobs, "g", "c2", &ids, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 1);

        let pending = bus
            .pending(Stream::InferenceJobs, "g", Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(pending[0].consumer, "c2");
        assert_eq!(pending[0].delivery_count, 2);
    }

    #[tokio::test]
    async fn groups_consume_independently() {
        let bus = InMemoryEventBus::new();
        bus.append(Stream::Preloads, &entry("j1")).await.unwrap();

        let a = bus
            .read_group(Stream::Preloads, "ga", "c", 1, Duration::ZERO)
            .await
            .unwrap();
        let b = bus
            .read_group(Stream::Preloads, "gb", "c", 1, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
    }
}
