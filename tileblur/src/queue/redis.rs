//! Redis Streams queue backend.
//!
//! Maps the [`WorkQueue`] contract onto Redis Streams primitives:
//! `XADD` to publish, `XREADGROUP` to claim, `XACK` to acknowledge, and
//! `XPENDING` + `XCLAIM` to reclaim stale deliveries. Stream keys are
//! namespaced by run id so concurrent runs can share one Redis instance.

use super::{dlq_stream, Delivery, MessageId, QueueError, WorkQueue, DEFAULT_MAX_DELIVERIES};
use redis::aio::ConnectionManager;
use redis::streams::{StreamClaimReply, StreamPendingCountReply, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::time::Duration;

/// Field name under which message payloads are stored in stream entries.
const PAYLOAD_FIELD: &str = "data";

/// Client-side poll interval for reads with no pending messages.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Durable queue over Redis Streams.
///
/// Cheap to clone; clones share the underlying multiplexed connection.
#[derive(Clone)]
pub struct RedisQueue {
    conn: ConnectionManager,
    namespace: String,
    max_deliveries: u32,
}

impl RedisQueue {
    /// Connects to Redis and verifies the server is reachable.
    ///
    /// `namespace` (typically the run id) prefixes every stream key.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Unavailable`] if the server cannot be
    /// reached; startup should surface this as a fatal diagnostic.
    pub async fn connect(addr: &str, namespace: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(addr)
            .map_err(|e| QueueError::Unavailable(format!("invalid redis address: {e}")))?;
        let mut conn = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;

        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;

        Ok(Self {
            conn,
            namespace: namespace.to_string(),
            max_deliveries: DEFAULT_MAX_DELIVERIES,
        })
    }

    /// Overrides the dead-letter delivery cap.
    pub fn with_max_deliveries(mut self, max_deliveries: u32) -> Self {
        self.max_deliveries = max_deliveries;
        self
    }

    fn key(&self, stream: &str) -> String {
        format!("{}:{}", self.namespace, stream)
    }
}

fn backend_err(e: redis::RedisError) -> QueueError {
    if e.is_connection_refusal() || e.is_io_error() || e.is_timeout() {
        QueueError::Unavailable(e.to_string())
    } else {
        QueueError::Backend(e.to_string())
    }
}

/// Extracts the payload field from one stream entry.
fn entry_payload(map: &std::collections::HashMap<String, redis::Value>) -> Option<Vec<u8>> {
    map.get(PAYLOAD_FIELD)
        .and_then(|v| redis::from_redis_value::<Vec<u8>>(v).ok())
}

impl WorkQueue for RedisQueue {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        // "$" so the group only consumes messages published after creation.
        let result: Result<String, redis::RedisError> = conn
            .xgroup_create_mkstream(self.key(stream), group, "$")
            .await;
        match result {
            Ok(_) => Ok(()),
            // Group already exists: idempotent success.
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(backend_err(e)),
        }
    }

    async fn publish(&self, stream: &str, payload: Vec<u8>) -> Result<MessageId, QueueError> {
        let mut conn = self.conn.clone();
        let id: String = conn
            .xadd(self.key(stream), "*", &[(PAYLOAD_FIELD, payload)])
            .await
            .map_err(backend_err)?;
        Ok(MessageId::new(id))
    }

    async fn read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<Delivery>, QueueError> {
        // The connection is multiplexed across all workers, so a
        // server-side blocking XREADGROUP would stall every other command
        // on it. Poll without BLOCK and wait client-side instead.
        let deadline = tokio::time::Instant::now() + block;
        let options = StreamReadOptions::default().group(group, consumer).count(1);

        loop {
            let mut conn = self.conn.clone();
            let reply: StreamReadReply = conn
                .xread_options(&[self.key(stream)], &[">"], &options)
                .await
                .map_err(|e| {
                    if e.code() == Some("NOGROUP") {
                        QueueError::NoSuchGroup {
                            stream: stream.to_string(),
                            group: group.to_string(),
                        }
                    } else {
                        backend_err(e)
                    }
                })?;

            let entry = reply
                .keys
                .into_iter()
                .next()
                .and_then(|key| key.ids.into_iter().next());

            if let Some(entry) = entry {
                let payload = match entry_payload(&entry.map) {
                    Some(payload) => payload,
                    // Entry without a payload field: surface it as an
                    // empty payload so the consumer's malformed-message
                    // path acks it.
                    None => Vec::new(),
                };
                return Ok(Some(Delivery {
                    id: MessageId::new(entry.id),
                    payload,
                }));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: &MessageId) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _acked: i64 = conn
            .xack(self.key(stream), group, &[id.as_str()])
            .await
            .map_err(backend_err)?;
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
        let mut conn = self.conn.clone();
        let key = self.key(stream);

        let pending: StreamPendingCountReply = conn
            .xpending_count(&key, group, "-", "+", max_count)
            .await
            .map_err(backend_err)?;

        let min_idle_ms = min_idle.as_millis() as usize;
        let mut claimable: Vec<String> = Vec::new();
        let mut dead: Vec<String> = Vec::new();
        for entry in pending.ids {
            if entry.last_delivered_ms < min_idle_ms {
                continue;
            }
            if entry.times_delivered >= self.max_deliveries as usize {
                dead.push(entry.id);
            } else {
                claimable.push(entry.id);
            }
        }

        // Dead-letter messages over the delivery cap: claim them to take
        // ownership, copy to the DLQ stream, then ack them away.
        if !dead.is_empty() {
            let claimed: StreamClaimReply = conn
                .xclaim(&key, group, consumer, min_idle_ms, &dead)
                .await
                .map_err(backend_err)?;
            let dlq_key = self.key(&dlq_stream(stream));
            for entry in claimed.ids {
                tracing::warn!(
                    stream,
                    group,
                    message_id = %entry.id,
                    "delivery cap exceeded, moving message to dead-letter stream"
                );
                if let Some(payload) = entry_payload(&entry.map) {
                    let _id: String = conn
                        .xadd(&dlq_key, "*", &[(PAYLOAD_FIELD, payload)])
                        .await
                        .map_err(backend_err)?;
                }
                let _acked: i64 = conn
                    .xack(&key, group, &[entry.id.as_str()])
                    .await
                    .map_err(backend_err)?;
            }
        }

        if claimable.is_empty() {
            return Ok(Vec::new());
        }

        let claimed: StreamClaimReply = conn
            .xclaim(&key, group, consumer, min_idle_ms, &claimable)
            .await
            .map_err(backend_err)?;

        let deliveries = claimed
            .ids
            .into_iter()
            .filter_map(|entry| {
                let payload = entry_payload(&entry.map)?;
                Some(Delivery {
                    id: MessageId::new(entry.id),
                    payload,
                })
            })
            .collect();

        Ok(deliveries)
    }
}
