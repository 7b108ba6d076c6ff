//! Durable message state machine over a table, with optimistic concurrency.

use crate::error::Result;
use async_trait::async_trait;
use rq_common::{Message, QueueKey, Topic};
use std::time::Duration;

/// Outcome of a single `process()` invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// No subscriber was available, or another peer already owns the
    /// message; no attempt was counted.
    Skipped,
    /// The subscriber callback ran and returned success; the row and body
    /// are deleted.
    Succeeded,
    /// The subscriber callback ran and returned failure (or threw); the
    /// message was re-queued (or moved to `Failed` if attempts exhausted).
    Failed,
}

/// Invoked by `process()` once the message has been marked `Processing`.
/// Implementations run the registered subscriber callback(s) for the
/// message's queue and report whether delivery succeeded.
#[async_trait]
pub trait SubscriberInvoker: Send + Sync {
    /// Whether this peer has any subscriber registered for `queue_key`.
    /// Checked before the message is touched at all, so an unsubscribed
    /// peer never counts an attempt.
    fn has_subscriber(&self, queue_key: &QueueKey) -> bool;

    /// Run the subscriber callback and report whether delivery succeeded.
    /// Implementations must catch a panicking callback themselves and
    /// translate it to `false`; `process()` never guards against an unwind
    /// out of `invoke()`.
    async fn invoke(&self, queue_key: &QueueKey, message: &Message) -> bool;
}

/// Re-enqueues a notification for a message that was reverted to `Queued`
/// after a failed delivery attempt. Implemented by the sender so the state
/// store never depends on the send path directly.
#[async_trait]
pub trait NotificationResender: Send + Sync {
    async fn resend(&self, queue_key: &QueueKey, message: &Message) -> Result<()>;
}

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Insert a new row in state `New`. Idempotent by (partitionKey, rowKey).
    /// Returns the persisted row with its assigned sequence and eTag.
    async fn add(&self, queue_key: &QueueKey, message: Message, timeout: Duration) -> Result<Message>;

    /// Merge-update the row to state `Queued`.
    async fn queue(&self, queue_key: &QueueKey, message: Message, timeout: Duration) -> Result<Message>;

    /// All rows with state `Queued` for the given topic, sorted by the
    /// message ordering comparator.
    async fn get_queued_in_topic(
        &self,
        queue_key: &QueueKey,
        topic: &Topic,
        this_process_identity: &str,
        timeout: Duration,
    ) -> Result<Vec<Message>>;

    /// Distinct topic identifiers with any row present, in storage-timestamp
    /// order. Used to recover orphaned work when a queue's first subscriber
    /// registers.
    async fn get_live_topics(&self, queue_key: &QueueKey, timeout: Duration) -> Result<Vec<Topic>>;

    /// The core transition engine: refetch, advance to Processing, invoke
    /// the subscriber, then delete on success or re-queue on failure.
    async fn process(
        &self,
        queue_key: &QueueKey,
        message: Message,
        invoker: &dyn SubscriberInvoker,
        sender: &dyn NotificationResender,
        timeout: Duration,
    ) -> Result<ProcessOutcome>;
}
