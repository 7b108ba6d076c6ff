//! Serializes a message into a wire notification and enqueues it. The
//! actual send always runs on a spawned task; callers get back an
//! observable completion channel instead of a true fire-and-forget, so
//! tests (and callers who care) can await the outcome.

pub mod error;

#[cfg(feature = "embedded")]
pub mod embedded;

#[cfg(feature = "azure")]
pub mod azure;

pub use error::{Result, SenderError};

use async_trait::async_trait;
use base64::Engine;
use rq_common::{Message, QueueKey};
use rq_storage::state::NotificationResender;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Metadata-only projection of a `Message`: every field except the two
/// storage-assigned concurrency tokens (`eTag`, `sequence`). The body
/// lives in blob storage and is never part of the notification.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct NotificationEnvelope<'a> {
    id: &'a str,
    queue_key: &'a str,
    topic: &'a str,
    source: &'a str,
    owner: &'a str,
    created_utc: chrono::DateTime<chrono::Utc>,
    last_updated_utc: chrono::DateTime<chrono::Utc>,
    local_sequence: u32,
    attempts: u32,
    max_attempts: u32,
    state: &'static str,
    processing_timeout_secs: u64,
    overall_timeout_secs: u64,
    body_is_null: bool,
    size: Option<u64>,
    partition_key: &'a str,
    row_key: &'a str,
}

impl<'a> NotificationEnvelope<'a> {
    fn from_message(message: &'a Message) -> Self {
        Self {
            id: &message.id,
            queue_key: &message.queue_key,
            topic: &message.topic,
            source: &message.source,
            owner: &message.owner,
            created_utc: message.created_utc,
            last_updated_utc: message.last_updated_utc,
            local_sequence: message.local_sequence,
            attempts: message.attempts,
            max_attempts: message.max_attempts,
            state: message.state.as_str(),
            processing_timeout_secs: message.processing_timeout_secs,
            overall_timeout_secs: message.overall_timeout_secs,
            body_is_null: message.body_is_null,
            size: message.size,
            partition_key: &message.partition_key,
            row_key: &message.row_key,
        }
    }
}

/// Storage-backend seam for the notification queue: embedded (SQLite) or
/// the real cloud storage queue, selected by Cargo feature.
#[async_trait]
pub trait NotificationQueue: Send + Sync {
    /// Enqueue an opaque payload for `queue_key`, creating the underlying
    /// queue on first use if it doesn't yet exist.
    async fn enqueue(&self, queue_key: &QueueKey, payload: Vec<u8>) -> Result<()>;
}

pub struct NotificationSender {
    queue: Arc<dyn NotificationQueue>,
}

impl NotificationSender {
    pub fn new(queue: Arc<dyn NotificationQueue>) -> Self {
        Self { queue }
    }

    /// Serialize `message` and enqueue it, without waiting for the result.
    /// Returns a channel the caller may await or drop.
    pub fn send_notification(&self, queue_key: QueueKey, message: Message) -> oneshot::Receiver<Result<()>> {
        let (tx, rx) = oneshot::channel();
        let queue = self.queue.clone();

        tokio::spawn(async move {
            let result = Self::encode_and_enqueue(&queue, &queue_key, &message).await;
            if let Err(ref e) = result {
                warn!(queue = queue_key.name(), message_id = %message.id, error = %e, "notification send failed");
            } else {
                debug!(queue = queue_key.name(), message_id = %message.id, "notification sent");
            }
            let _ = tx.send(result);
        });

        rx
    }

    async fn encode_and_enqueue(queue: &Arc<dyn NotificationQueue>, queue_key: &QueueKey, message: &Message) -> Result<()> {
        let envelope = NotificationEnvelope::from_message(message);
        let json = serde_json::to_vec(&envelope)?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(json);
        queue.enqueue(queue_key, encoded.into_bytes()).await
    }
}

#[async_trait]
impl NotificationResender for NotificationSender {
    async fn resend(&self, queue_key: &QueueKey, message: &Message) -> rq_storage::Result<()> {
        Self::encode_and_enqueue(&self.queue, queue_key, message)
            .await
            .map_err(rq_storage::StorageError::from)
    }
}
