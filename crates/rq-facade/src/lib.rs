//! Queue-scoped subscription facade. Builds a `QueueHandle` per configured
//! queue, enforces mode (`Send`/`Receive`/`Both`) at every call, and
//! implements the end-to-end send path: create message, introspect body,
//! persist state and body in parallel, mark queued, fire-and-forget the
//! notification.

pub mod error;
pub mod registry;
pub mod subscription;

pub use error::{FacadeError, Result};
pub use subscription::{Subscriber, SubscriberRegistry, SubscriptionToken};

use dashmap::DashMap;
use registry::QueueHandle;
use rq_common::{Message, QueueKey, Topic};
use rq_config::AppConfig;
use rq_receiver::listener::BackgroundListener;
use rq_storage::state::SubscriberInvoker;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A running background listener's cancellation handle and its spawned task,
/// so `shutdown` can cancel it and then wait for the task to actually finish.
struct ListenerHandle {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

pub struct ReliableQueueFacade {
    queues: DashMap<String, Arc<QueueHandle>>,
    subscribers: Arc<SubscriberRegistry>,
    listeners: DashMap<String, ListenerHandle>,
    process_identity: String,
}

impl ReliableQueueFacade {
    /// Build one handle per enabled queue in `config`.
    pub fn from_config(config: &AppConfig, process_identity: impl Into<String>) -> Result<Self> {
        let process_identity = process_identity.into();
        let subscribers = Arc::new(SubscriberRegistry::new());
        let queues = DashMap::new();

        for (name, def) in config.enabled_queues() {
            let handle = registry::build_handle(name, def, subscribers.clone(), &process_identity)?;
            queues.insert(handle.key.safe().to_string(), Arc::new(handle));
        }

        Ok(Self {
            queues,
            subscribers,
            listeners: DashMap::new(),
            process_identity,
        })
    }

    fn handle(&self, queue_name: &str) -> Result<Arc<QueueHandle>> {
        let key = QueueKey::new(queue_name);
        self.queues
            .get(key.safe())
            .map(|r| r.clone())
            .ok_or_else(|| FacadeError::UnknownQueue(queue_name.to_string()))
    }

    /// Register `callback` as the active subscriber for `queue_name`. The
    /// first subscription for a queue triggers `rescan_live_topics` and, if
    /// `createListener` is configured, starts the background poll loop.
    pub async fn subscribe(&self, queue_name: &str, callback: Arc<dyn Subscriber>) -> Result<SubscriptionToken> {
        let handle = self.handle(queue_name)?;
        if !handle.mode.can_receive() {
            return Err(FacadeError::ModeError(format!("queue {queue_name} is not configured to receive")));
        }

        let first_subscriber = !self.subscribers.has_subscriber(&handle.key);
        self.subscribers.set(&handle.key, callback);

        if first_subscriber {
            handle.scheduler.rescan_live_topics().await?;
            if handle.create_listener {
                self.start_listener(&handle).await;
            }
        }

        Ok(SubscriptionToken {
            queue_key: handle.key.clone(),
            registry: self.subscribers.clone(),
        })
    }

    /// Explicit release; equivalent to dropping the token.
    pub fn unsubscribe(&self, token: SubscriptionToken) {
        drop(token);
    }

    async fn start_listener(&self, handle: &Arc<QueueHandle>) {
        if self.listeners.contains_key(handle.key.safe()) {
            return;
        }

        let listener = Arc::new(BackgroundListener::new(
            handle.key.clone(),
            handle.listener_queue.clone(),
            handle.scheduler.clone(),
        ));
        let cancel = listener.cancellation_token();

        info!(queue = handle.key.name(), "starting background listener");
        let task = tokio::spawn(async move {
            listener.run().await;
        });
        self.listeners.insert(handle.key.safe().to_string(), ListenerHandle { cancel, task });
    }

    /// Send `body` (optionally empty/null) on `topic` (empty ⇒ default
    /// topic, no ordering guarantee). Returns the persisted, queued message.
    pub async fn send(&self, queue_name: &str, topic: Option<&str>, body: Option<Vec<u8>>) -> Result<Message> {
        let handle = self.handle(queue_name)?;
        if !handle.mode.can_send() {
            return Err(FacadeError::ModeError(format!("queue {queue_name} is not configured to send")));
        }

        let topic_obj = topic.map(Topic::new).unwrap_or_else(Topic::default_topic);
        let local_sequence = handle.next_local_sequence();
        let overall_timeout_secs = handle.default_timeout.as_secs().saturating_mul(10);

        let mut message = Message::new(
            &handle.key,
            &topic_obj,
            &self.process_identity,
            local_sequence,
            handle.max_attempts,
            handle.default_timeout.as_secs(),
            overall_timeout_secs,
        );

        let size = body.as_ref().map(|b| b.len() as u64).filter(|&len| len > 0);
        message.size = size;
        message.body_is_null = size.is_none();

        let add_fut = handle.state.add(&handle.key, message.clone(), handle.default_timeout);
        let write_fut = handle.body.write(&handle.key, &message.id, body.as_deref(), handle.default_timeout);
        let (added, _write_outcome) = tokio::join!(add_fut, write_fut);
        let added = added?;
        _write_outcome?;

        let queued = handle.state.queue(&handle.key, added, handle.default_timeout).await?;

        let _ = handle.sender.send_notification(handle.key.clone(), queued.clone());

        debug!(queue = handle.key.name(), message_id = %queued.id, topic = topic_obj.name(), "message sent");
        Ok(queued)
    }

    /// Hand an externally-delivered notification payload to the scheduler
    /// for queues configured with `createListener = false`.
    pub async fn on_received(&self, queue_name: &str, payload: &[u8]) -> Result<()> {
        let handle = self.handle(queue_name)?;
        handle.scheduler.on_received(payload).await?;
        Ok(())
    }

    pub fn can_send(&self, queue_name: &str) -> Result<bool> {
        Ok(self.handle(queue_name)?.mode.can_send())
    }

    pub fn can_receive(&self, queue_name: &str) -> Result<bool> {
        Ok(self.handle(queue_name)?.mode.can_receive())
    }

    pub fn is_subscribed(&self, queue_name: &str) -> Result<bool> {
        let handle = self.handle(queue_name)?;
        Ok(self.subscribers.has_subscriber(&handle.key))
    }

    /// Cancel every running background listener and wait for each one's
    /// poll loop to actually stop before returning.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = self.listeners.iter().map(|entry| entry.key().clone()).collect();
        for key in handles {
            if let Some((_, listener)) = self.listeners.remove(&key) {
                listener.cancel.cancel();
                if let Err(e) = listener.task.await {
                    debug!(queue = %key, error = %e, "background listener task did not shut down cleanly");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rq_config::{AppConfig, QueueDefinition};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_config(queue_name: &str, mode: &str) -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.queues.insert(
            queue_name.to_string(),
            QueueDefinition {
                storage_connection_string: "sqlite::memory:".to_string(),
                mode: mode.to_string(),
                create_listener: false,
                sliding_window_duration_seconds: 1,
                ..Default::default()
            },
        );
        cfg
    }

    struct CountingSubscriber {
        seen: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Subscriber for CountingSubscriber {
        async fn handle(&self, _message: &Message) -> bool {
            self.seen.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    #[tokio::test]
    async fn unknown_queue_is_rejected() {
        let facade = ReliableQueueFacade::from_config(&AppConfig::default(), "host-1").unwrap();
        let err = facade.send("orders", None, None).await.unwrap_err();
        assert!(matches!(err, FacadeError::UnknownQueue(_)));
    }

    #[tokio::test]
    async fn send_is_rejected_on_a_receive_only_queue() {
        let cfg = test_config("orders", "Receive");
        let facade = ReliableQueueFacade::from_config(&cfg, "host-1").unwrap();
        let err = facade.send("orders", Some("t1"), None).await.unwrap_err();
        assert!(matches!(err, FacadeError::ModeError(_)));
    }

    #[tokio::test]
    async fn subscribe_is_rejected_on_a_send_only_queue() {
        let cfg = test_config("orders", "Send");
        let facade = ReliableQueueFacade::from_config(&cfg, "host-1").unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let err = facade
            .subscribe("orders", Arc::new(CountingSubscriber { seen }))
            .await
            .unwrap_err();
        assert!(matches!(err, FacadeError::ModeError(_)));
    }

    #[tokio::test]
    async fn send_persists_a_queued_message_with_a_body() {
        let cfg = test_config("orders", "Both");
        let facade = ReliableQueueFacade::from_config(&cfg, "host-1").unwrap();
        let message = facade.send("orders", Some("topic-a"), Some(b"payload".to_vec())).await.unwrap();
        assert_eq!(message.state, rq_common::MessageState::Queued);
        assert!(!message.body_is_null);
        assert_eq!(message.size, Some(7));
    }

    #[tokio::test]
    async fn send_of_an_empty_body_is_marked_null() {
        let cfg = test_config("orders", "Both");
        let facade = ReliableQueueFacade::from_config(&cfg, "host-1").unwrap();
        let message = facade.send("orders", None, None).await.unwrap();
        assert!(message.body_is_null);
        assert_eq!(message.size, None);
    }

    #[tokio::test]
    async fn subscribe_then_drop_releases_the_token() {
        let cfg = test_config("orders", "Both");
        let facade = ReliableQueueFacade::from_config(&cfg, "host-1").unwrap();
        assert!(!facade.is_subscribed("orders").unwrap());

        let seen = Arc::new(AtomicUsize::new(0));
        let token = facade
            .subscribe("orders", Arc::new(CountingSubscriber { seen }))
            .await
            .unwrap();
        assert!(facade.is_subscribed("orders").unwrap());

        drop(token);
        assert!(!facade.is_subscribed("orders").unwrap());
    }

    #[tokio::test]
    async fn can_send_and_can_receive_reflect_configured_mode() {
        let cfg = test_config("orders", "Send");
        let facade = ReliableQueueFacade::from_config(&cfg, "host-1").unwrap();
        assert!(facade.can_send("orders").unwrap());
        assert!(!facade.can_receive("orders").unwrap());
    }
}
