//! The process-wide subscription registry: one active callback per queue,
//! removed when its token is dropped or explicitly unsubscribed.

use async_trait::async_trait;
use dashmap::DashMap;
use rq_common::{Message, QueueKey};
use rq_storage::state::SubscriberInvoker;
use std::sync::Arc;
use tracing::{debug, error};

/// A subscriber callback for one queue's messages. Returning `false` (or
/// panicking — `SubscriberRegistry::invoke` catches it on a spawned task
/// and treats it the same as a `false` return) re-queues the message up
/// to the queue's configured `maxAttempts`.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn handle(&self, message: &Message) -> bool;
}

pub struct SubscriberRegistry {
    callbacks: DashMap<String, Arc<dyn Subscriber>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self { callbacks: DashMap::new() }
    }

    pub fn set(&self, queue_key: &QueueKey, callback: Arc<dyn Subscriber>) {
        self.callbacks.insert(queue_key.safe().to_string(), callback);
    }

    pub fn remove(&self, queue_key: &QueueKey) {
        self.callbacks.remove(queue_key.safe());
    }
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SubscriberInvoker for SubscriberRegistry {
    fn has_subscriber(&self, queue_key: &QueueKey) -> bool {
        self.callbacks.contains_key(queue_key.safe())
    }

    async fn invoke(&self, queue_key: &QueueKey, message: &Message) -> bool {
        let Some(callback) = self.callbacks.get(queue_key.safe()).map(|c| c.clone()) else {
            return false;
        };

        // Run on a separate task so a panicking callback unwinds inside
        // that task, not through process()'s already-committed Processing
        // transition; tokio reports it back as a JoinError instead.
        let message = message.clone();
        match tokio::spawn(async move { callback.handle(&message).await }).await {
            Ok(result) => result,
            Err(join_err) => {
                error!(
                    queue = queue_key.name(),
                    error = %join_err,
                    "subscriber callback panicked; treating as a failed invocation"
                );
                false
            }
        }
    }
}

/// Scoped handle returned by `subscribe`. Dropping it (or calling
/// `unsubscribe` explicitly) removes the callback from the registry;
/// dropping twice is harmless.
pub struct SubscriptionToken {
    pub(crate) queue_key: QueueKey,
    pub(crate) registry: Arc<SubscriberRegistry>,
}

impl Drop for SubscriptionToken {
    fn drop(&mut self) {
        debug!(queue = self.queue_key.name(), "subscription token released");
        self.registry.remove(&self.queue_key);
    }
}
