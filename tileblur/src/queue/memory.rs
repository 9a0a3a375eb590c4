//! In-process durable queue.
//!
//! Implements the full consumer-group contract (claim, pending ledger,
//! visibility-timeout reclaim, dead-lettering) over in-memory state. This
//! backs the single-process execution modes and the test suite; its
//! semantics mirror the Redis Streams backend so the pipeline components
//! cannot tell the transports apart.

use super::{dlq_stream, Delivery, MessageId, QueueError, WorkQueue, DEFAULT_MAX_DELIVERIES};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};

/// In-memory multi-stream queue with consumer groups.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct MemoryQueue {
    inner: Arc<Inner>,
}

struct Inner {
    streams: Mutex<HashMap<String, StreamState>>,
    notify: Notify,
    max_deliveries: u32,
}

#[derive(Default)]
struct StreamState {
    next_seq: u64,
    entries: Vec<Entry>,
    groups: HashMap<String, GroupState>,
}

struct Entry {
    id: MessageId,
    payload: Vec<u8>,
}

struct GroupState {
    /// Index of the next never-delivered entry for this group.
    next_index: usize,
    /// Delivered-but-unacked messages.
    pending: HashMap<MessageId, PendingEntry>,
}

struct PendingEntry {
    entry_index: usize,
    consumer: String,
    delivered_at: Instant,
    deliveries: u32,
}

impl MemoryQueue {
    /// Creates an empty queue with the default dead-letter cap.
    pub fn new() -> Self {
        Self::with_max_deliveries(DEFAULT_MAX_DELIVERIES)
    }

    /// Creates an empty queue that dead-letters messages after
    /// `max_deliveries` deliveries.
    pub fn with_max_deliveries(max_deliveries: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                streams: Mutex::new(HashMap::new()),
                notify: Notify::new(),
                max_deliveries,
            }),
        }
    }

    /// Total number of messages ever published to a stream.
    pub async fn stream_len(&self, stream: &str) -> usize {
        let streams = self.inner.streams.lock().await;
        streams.get(stream).map(|s| s.entries.len()).unwrap_or(0)
    }

    /// Number of messages a group has had delivered at least once.
    pub async fn delivered_count(&self, stream: &str, group: &str) -> usize {
        let streams = self.inner.streams.lock().await;
        streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.next_index)
            .unwrap_or(0)
    }

    /// Number of delivered-but-unacked messages for a group.
    pub async fn pending_count(&self, stream: &str, group: &str) -> usize {
        let streams = self.inner.streams.lock().await;
        streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len())
            .unwrap_or(0)
    }

    /// Attempts to claim the next undelivered entry without blocking.
    async fn try_claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Option<Delivery>, QueueError> {
        let mut streams = self.inner.streams.lock().await;
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| no_such_group(stream, group))?;
        let StreamState {
            entries, groups, ..
        } = state;
        let grp = groups
            .get_mut(group)
            .ok_or_else(|| no_such_group(stream, group))?;

        if grp.next_index >= entries.len() {
            return Ok(None);
        }

        let idx = grp.next_index;
        grp.next_index += 1;
        let entry = &entries[idx];
        grp.pending.insert(
            entry.id.clone(),
            PendingEntry {
                entry_index: idx,
                consumer: consumer.to_string(),
                delivered_at: Instant::now(),
                deliveries: 1,
            },
        );

        Ok(Some(Delivery {
            id: entry.id.clone(),
            payload: entry.payload.clone(),
        }))
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn no_such_group(stream: &str, group: &str) -> QueueError {
    QueueError::NoSuchGroup {
        stream: stream.to_string(),
        group: group.to_string(),
    }
}

impl WorkQueue for MemoryQueue {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), QueueError> {
        let mut streams = self.inner.streams.lock().await;
        let state = streams.entry(stream.to_string()).or_default();
        let start = state.entries.len();
        state.groups.entry(group.to_string()).or_insert(GroupState {
            next_index: start,
            pending: HashMap::new(),
        });
        Ok(())
    }

    async fn publish(&self, stream: &str, payload: Vec<u8>) -> Result<MessageId, QueueError> {
        let id = {
            let mut streams = self.inner.streams.lock().await;
            let state = streams.entry(stream.to_string()).or_default();
            let seq = state.next_seq;
            state.next_seq += 1;
            let id = MessageId::new(format!("{seq}-0"));
            state.entries.push(Entry {
                id: id.clone(),
                payload,
            });
            id
        };
        self.inner.notify.notify_waiters();
        Ok(id)
    }

    async fn read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<Delivery>, QueueError> {
        let deadline = tokio::time::Instant::now() + block;
        loop {
            // Register for wakeups before checking, so a publish between
            // the check and the wait cannot be missed.
            let notified = self.inner.notify.notified();

            if let Some(delivery) = self.try_claim(stream, group, consumer).await? {
                return Ok(Some(delivery));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: &MessageId) -> Result<(), QueueError> {
        let mut streams = self.inner.streams.lock().await;
        if let Some(state) = streams.get_mut(stream) {
            if let Some(grp) = state.groups.get_mut(group) {
                grp.pending.remove(id);
            }
        }
        Ok(())
    }

    async fn reclaim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        max_count: usize,
    ) -> Result<Vec<Delivery>, QueueError> {
        let now = Instant::now();
        let mut streams = self.inner.streams.lock().await;

        let (reclaimed, dead) = {
            let state = streams
                .get_mut(stream)
                .ok_or_else(|| no_such_group(stream, group))?;
            let StreamState {
                entries, groups, ..
            } = state;
            let grp = groups
                .get_mut(group)
                .ok_or_else(|| no_such_group(stream, group))?;

            let mut stale: Vec<MessageId> = grp
                .pending
                .iter()
                .filter(|(_, p)| now.duration_since(p.delivered_at) >= min_idle)
                .map(|(id, _)| id.clone())
                .collect();
            stale.sort();
            stale.truncate(max_count);

            let max_deliveries = self.inner.max_deliveries;
            let mut reclaimed = Vec::new();
            let mut dead = Vec::new();
            for id in stale {
                let Some(pending) = grp.pending.get_mut(&id) else {
                    continue;
                };
                let payload = entries[pending.entry_index].payload.clone();
                if pending.deliveries >= max_deliveries {
                    grp.pending.remove(&id);
                    dead.push((id, payload));
                } else {
                    pending.consumer = consumer.to_string();
                    pending.delivered_at = now;
                    pending.deliveries += 1;
                    reclaimed.push(Delivery { id, payload });
                }
            }
            (reclaimed, dead)
        };

        if !dead.is_empty() {
            let dlq = streams.entry(dlq_stream(stream)).or_default();
            for (id, payload) in dead {
                tracing::warn!(
                    stream,
                    group,
                    message_id = %id,
                    "delivery cap exceeded, moving message to dead-letter stream"
                );
                let seq = dlq.next_seq;
                dlq.next_seq += 1;
                dlq.entries.push(Entry {
                    id: MessageId::new(format!("{seq}-0")),
                    payload,
                });
            }
        }

        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK: Duration = Duration::from_millis(20);

    async fn queue_with_group() -> MemoryQueue {
        let queue = MemoryQueue::new();
        queue.ensure_group("jobs", "workers").await.unwrap();
        queue
    }

    #[tokio::test]
    async fn test_publish_read_ack() {
        let queue = queue_with_group().await;
        queue.publish("jobs", b"payload".to_vec()).await.unwrap();

        let delivery = queue
            .read("jobs", "workers", "w1", BLOCK)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.payload, b"payload");
        assert_eq!(queue.pending_count("jobs", "workers").await, 1);

        queue.ack("jobs", "workers", &delivery.id).await.unwrap();
        assert_eq!(queue.pending_count("jobs", "workers").await, 0);
    }

    #[tokio::test]
    async fn test_read_times_out_when_empty() {
        let queue = queue_with_group().await;
        let result = queue.read("jobs", "workers", "w1", BLOCK).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_read_without_group_errors() {
        let queue = MemoryQueue::new();
        queue.publish("jobs", b"x".to_vec()).await.unwrap();
        let result = queue.read("jobs", "nobody", "w1", BLOCK).await;
        assert!(matches!(result, Err(QueueError::NoSuchGroup { .. })));
    }

    #[tokio::test]
    async fn test_group_sees_only_new_messages() {
        let queue = MemoryQueue::new();
        queue.publish("jobs", b"old".to_vec()).await.unwrap();
        queue.ensure_group("jobs", "workers").await.unwrap();
        queue.publish("jobs", b"new".to_vec()).await.unwrap();

        let delivery = queue
            .read("jobs", "workers", "w1", BLOCK)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.payload, b"new");
        assert!(queue
            .read("jobs", "workers", "w1", BLOCK)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_each_message_delivered_to_one_consumer() {
        let queue = queue_with_group().await;
        for i in 0..4u8 {
            queue.publish("jobs", vec![i]).await.unwrap();
        }

        let mut seen = Vec::new();
        for consumer in ["a", "b", "a", "b"] {
            let d = queue
                .read("jobs", "workers", consumer, BLOCK)
                .await
                .unwrap()
                .unwrap();
            seen.push(d.payload[0]);
        }
        seen.sort();
        assert_eq!(seen, [0, 1, 2, 3]);
        assert!(queue
            .read("jobs", "workers", "a", BLOCK)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_blocked_read_wakes_on_publish() {
        let queue = queue_with_group().await;
        let reader = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .read("jobs", "workers", "w1", Duration::from_secs(5))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.publish("jobs", b"wake".to_vec()).await.unwrap();

        let delivery = reader.await.unwrap().unwrap().unwrap();
        assert_eq!(delivery.payload, b"wake");
    }

    #[tokio::test]
    async fn test_unacked_message_is_reclaimable_after_idle() {
        let queue = queue_with_group().await;
        queue.publish("jobs", b"job".to_vec()).await.unwrap();

        // Consumer reads but never acks (simulated crash).
        let first = queue
            .read("jobs", "workers", "crashed", BLOCK)
            .await
            .unwrap()
            .unwrap();

        // Not yet stale.
        let early = queue
            .reclaim_stale("jobs", "workers", "survivor", Duration::from_secs(60), 10)
            .await
            .unwrap();
        assert!(early.is_empty());

        tokio::time::sleep(Duration::from_millis(30)).await;
        let reclaimed = queue
            .reclaim_stale("jobs", "workers", "survivor", Duration::from_millis(20), 10)
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, first.id);
        assert_eq!(reclaimed[0].payload, b"job");
    }

    #[tokio::test]
    async fn test_acked_message_is_not_reclaimable() {
        let queue = queue_with_group().await;
        queue.publish("jobs", b"job".to_vec()).await.unwrap();
        let d = queue
            .read("jobs", "workers", "w1", BLOCK)
            .await
            .unwrap()
            .unwrap();
        queue.ack("jobs", "workers", &d.id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        let reclaimed = queue
            .reclaim_stale("jobs", "workers", "w2", Duration::from_millis(1), 10)
            .await
            .unwrap();
        assert!(reclaimed.is_empty());
    }

    #[tokio::test]
    async fn test_delivery_cap_moves_message_to_dlq() {
        let queue = MemoryQueue::with_max_deliveries(2);
        queue.ensure_group("jobs", "workers").await.unwrap();
        queue.publish("jobs", b"poison".to_vec()).await.unwrap();

        // First delivery.
        queue
            .read("jobs", "workers", "w1", BLOCK)
            .await
            .unwrap()
            .unwrap();

        // Second delivery via reclaim.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let reclaimed = queue
            .reclaim_stale("jobs", "workers", "w2", Duration::from_millis(1), 10)
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 1);

        // Cap reached: the next reclaim dead-letters instead of returning.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let reclaimed = queue
            .reclaim_stale("jobs", "workers", "w3", Duration::from_millis(1), 10)
            .await
            .unwrap();
        assert!(reclaimed.is_empty());
        assert_eq!(queue.pending_count("jobs", "workers").await, 0);
        assert_eq!(queue.stream_len("jobs:dlq").await, 1);
    }
}
