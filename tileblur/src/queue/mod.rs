//! Durable work queue with consumer-group semantics.
//!
//! The pipeline's only transport is an ordered, persistent, multi-consumer
//! message stream: each published message is delivered to exactly one
//! consumer within a named group, stays "pending" until acknowledged, and
//! becomes reclaimable by other consumers once it has been idle past a
//! visibility timeout. A consumer that crashes between read and ack
//! therefore loses nothing — the message is redelivered, which is why every
//! consumer in the pipeline is written idempotently.
//!
//! Two implementations share the [`WorkQueue`] contract:
//!
//! - [`MemoryQueue`] — in-process, used by the single-process execution
//!   modes and by tests.
//! - [`RedisQueue`] — Redis Streams, used by the distributed deployment.
//!
//! Swapping the transport is the only difference between the local and
//! distributed pipelines.

mod memory;
mod redis;

pub use self::redis::RedisQueue;
pub use memory::MemoryQueue;

use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Default cap on deliveries before a message is dead-lettered during
/// reclaim.
pub const DEFAULT_MAX_DELIVERIES: u32 = 5;

/// Suffix appended to a stream name to form its dead-letter stream.
pub const DLQ_SUFFIX: &str = ":dlq";

/// Identifier of one message within a stream (e.g. `"42-0"`).
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct MessageId(String);

impl MessageId {
    /// Creates a message id from its string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string form of this id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message claimed from a stream: its id plus the raw payload.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: MessageId,
    pub payload: Vec<u8>,
}

/// Queue errors.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The backing store cannot be reached.
    #[error("queue backend unavailable: {0}")]
    Unavailable(String),

    /// The backing store rejected an operation.
    #[error("queue backend error: {0}")]
    Backend(String),

    /// The consumer group does not exist on this stream.
    #[error("no consumer group {group:?} on stream {stream:?}")]
    NoSuchGroup { stream: String, group: String },
}

/// An ordered, persistent, multi-consumer message channel.
///
/// Contract (see module docs): at-least-once delivery within a consumer
/// group, redelivery of unacknowledged messages via [`reclaim_stale`],
/// and no silent drops once [`publish`] returns.
///
/// [`publish`]: WorkQueue::publish
/// [`reclaim_stale`]: WorkQueue::reclaim_stale
pub trait WorkQueue: Clone + Send + Sync + 'static {
    /// Creates the stream and consumer group if they do not exist.
    ///
    /// Idempotent; a group that already exists is left untouched. Only
    /// messages published after group creation are visible to the group.
    fn ensure_group(
        &self,
        stream: &str,
        group: &str,
    ) -> impl Future<Output = Result<(), QueueError>> + Send;

    /// Appends a message to the stream.
    ///
    /// Fails only if the backing store is unavailable; never blocks
    /// indefinitely.
    fn publish(
        &self,
        stream: &str,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<MessageId, QueueError>> + Send;

    /// Claims the next unclaimed message for this group, blocking up to
    /// `block` if none is pending.
    ///
    /// The returned message is marked pending (delivered but unacked) for
    /// `consumer` until [`WorkQueue::ack`] is called or the message is
    /// reclaimed.
    fn read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> impl Future<Output = Result<Option<Delivery>, QueueError>> + Send;

    /// Removes a delivered message from the group's pending set.
    ///
    /// Must be called only after the work's side effects are durable.
    /// Acknowledging an unknown or already-acked id is a no-op.
    fn ack(
        &self,
        stream: &str,
        group: &str,
        id: &MessageId,
    ) -> impl Future<Output = Result<(), QueueError>> + Send;

    /// Re-delivers messages pending longer than `min_idle`, reassigning
    /// ownership to `consumer`, up to `max_count` of them.
    ///
    /// This is the sole failure-recovery mechanism: jobs abandoned by a
    /// crashed consumer are picked up here by a survivor. Messages whose
    /// delivery count exceeds the backend's dead-letter cap are moved to
    /// the `<stream>:dlq` stream and acknowledged instead of returned.
    fn reclaim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        max_count: usize,
    ) -> impl Future<Output = Result<Vec<Delivery>, QueueError>> + Send;
}

/// Dead-letter stream name for a stream.
pub(crate) fn dlq_stream(stream: &str) -> String {
    format!("{stream}{DLQ_SUFFIX}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_display() {
        let id = MessageId::new("17-0");
        assert_eq!(id.as_str(), "17-0");
        assert_eq!(format!("{}", id), "17-0");
    }

    #[test]
    fn test_dlq_stream_name() {
        assert_eq!(dlq_stream("jobs"), "jobs:dlq");
    }
}
