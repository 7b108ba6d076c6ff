//! Background queue listener: polls the notification queue at a fixed
//! interval, hands each message to a `TopicScheduler`, and deletes it once
//! the handoff succeeds. Embedded and Azure differ only in how a batch of
//! messages is fetched and deleted.

use crate::error::Result;
use crate::scheduler::TopicScheduler;
use async_trait::async_trait;
use rq_common::QueueKey;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const MAX_BATCH: u32 = 1;

/// One polled notification: its decoded body plus whatever receipt the
/// backend needs to delete it after processing.
pub struct PolledMessage {
    pub id: String,
    pub pop_receipt: String,
    pub payload: Vec<u8>,
}

/// Storage-backend seam for the notification queue's receive side:
/// embedded (a FIFO table) or Azure Storage Queue.
#[async_trait]
pub trait PolledQueue: Send + Sync {
    async fn receive_messages(&self, max: u32) -> Result<Vec<PolledMessage>>;
    async fn delete(&self, id: &str, pop_receipt: &str) -> Result<()>;
}

/// Drives one queue's receive loop on a fixed timer until cancelled.
pub struct BackgroundListener {
    queue_key: QueueKey,
    queue: Arc<dyn PolledQueue>,
    scheduler: Arc<TopicScheduler>,
    cancel: CancellationToken,
}

impl BackgroundListener {
    pub fn new(queue_key: QueueKey, queue: Arc<dyn PolledQueue>, scheduler: Arc<TopicScheduler>) -> Self {
        Self {
            queue_key,
            queue,
            scheduler,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that, when cancelled, stops the poll loop after its current
    /// iteration finishes.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Re-scan for already-live topics, then run the poll loop until the
    /// cancellation token fires. Intended to be spawned as its own task.
    pub async fn run(self: Arc<Self>) {
        if let Err(e) = self.scheduler.rescan_live_topics().await {
            error!(queue = self.queue_key.name(), error = %e, "live-topic rescan failed");
        }

        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(queue = self.queue_key.name(), "listener cancelled");
                    return;
                }
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
            }
        }
    }

    async fn poll_once(&self) {
        let batch = match self.queue.receive_messages(MAX_BATCH).await {
            Ok(batch) => batch,
            Err(e) => {
                warn!(queue = self.queue_key.name(), error = %e, "notification receive failed");
                return;
            }
        };

        for message in batch {
            if let Err(e) = self.scheduler.on_received(&message.payload).await {
                error!(queue = self.queue_key.name(), message_id = message.id, error = %e, "failed to hand off notification");
                continue;
            }
            if let Err(e) = self.queue.delete(&message.id, &message.pop_receipt).await {
                warn!(queue = self.queue_key.name(), message_id = message.id, error = %e, "failed to delete delivered notification");
            }
        }
    }
}
