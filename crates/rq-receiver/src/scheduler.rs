//! Per-topic ordered processing. One background worker runs per
//! currently-"hot" `(queue, topic)` pair; the `active` map enforces that
//! at most one worker exists per topic at a time, mirroring the
//! one-task-per-key bookkeeping a router's consumer-loop map uses
//! (insert before spawn, remove on exit — including the error path).

use crate::error::Result;
use crate::intake::decode_notification;
use chrono::Utc;
use dashmap::DashSet;
use rq_affinity::{AffinityDecision, TopicAffinityArbiter};
use rq_common::{QueueKey, Topic};
use rq_storage::state::{NotificationResender, SubscriberInvoker};
use rq_storage::StateStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

const ITERATION: Duration = Duration::from_millis(100);

pub struct TopicScheduler {
    queue_key: QueueKey,
    queue_can_receive: bool,
    state_store: Arc<dyn StateStore>,
    affinity: Arc<TopicAffinityArbiter>,
    invoker: Arc<dyn SubscriberInvoker>,
    sender: Arc<dyn NotificationResender>,
    process_identity: String,
    process_timeout: Duration,
    sliding_window: Duration,
    active: DashSet<String>,
}

impl TopicScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue_key: QueueKey,
        queue_can_receive: bool,
        state_store: Arc<dyn StateStore>,
        affinity: Arc<TopicAffinityArbiter>,
        invoker: Arc<dyn SubscriberInvoker>,
        sender: Arc<dyn NotificationResender>,
        process_identity: impl Into<String>,
        process_timeout: Duration,
        sliding_window: Duration,
    ) -> Self {
        Self {
            queue_key,
            queue_can_receive,
            state_store,
            affinity,
            invoker,
            sender,
            process_identity: process_identity.into(),
            process_timeout,
            sliding_window,
            active: DashSet::new(),
        }
    }

    /// Handle one incoming notification: decode, run the affinity gate,
    /// and make sure a worker is running for the topic it names.
    pub async fn on_received(self: &Arc<Self>, payload: &[u8]) -> Result<()> {
        let header = match decode_notification(payload)? {
            Some(h) => h,
            None => return Ok(()),
        };

        let topic = Topic::new(&header.topic);
        self.dispatch_topic(topic).await
    }

    /// Re-derive every topic with any live row (recovers orphaned work
    /// after a crash) and start a worker for each that passes the
    /// affinity gate. Called when the first subscriber for this queue
    /// registers.
    pub async fn rescan_live_topics(self: &Arc<Self>) -> Result<()> {
        let topics = self.state_store.get_live_topics(&self.queue_key, self.process_timeout).await?;
        info!(queue = self.queue_key.name(), topic_count = topics.len(), "re-scanning live topics on subscribe");
        for topic in topics {
            self.dispatch_topic(topic).await?;
        }
        Ok(())
    }

    async fn dispatch_topic(self: &Arc<Self>, topic: Topic) -> Result<()> {
        match self.affinity.evaluate(&self.queue_key, &topic, self.queue_can_receive).await? {
            AffinityDecision::Accept => {
                self.ensure_worker_started(topic);
                Ok(())
            }
            AffinityDecision::Reject => {
                debug!(queue = self.queue_key.name(), topic = topic.name(), "affinity rejected, another peer owns this topic");
                Ok(())
            }
        }
    }

    fn ensure_worker_started(self: &Arc<Self>, topic: Topic) {
        if !self.active.insert(topic.id().to_string()) {
            return;
        }

        let scheduler = self.clone();
        tokio::spawn(async move {
            if let Err(e) = scheduler.run_topic_loop(&topic).await {
                error!(queue = scheduler.queue_key.name(), topic = topic.name(), error = %e, "topic worker exited with error");
            }
            scheduler.active.remove(topic.id());
        });
    }

    /// The sliding-window reorder loop: every `ITERATION`, process
    /// whichever queued messages have aged past the window, leaving
    /// younger ones for late out-of-order arrivals to catch up to.
    async fn run_topic_loop(self: &Arc<Self>, topic: &Topic) -> Result<()> {
        let mut overrun = Duration::ZERO;

        loop {
            tokio::time::sleep(ITERATION).await;

            let snapshot = self
                .state_store
                .get_queued_in_topic(&self.queue_key, topic, &self.process_identity, self.process_timeout)
                .await?;

            let cutoff = Utc::now() - chrono::Duration::from_std(self.sliding_window).unwrap_or_default();

            for message in &snapshot {
                if message.last_updated_utc >= cutoff {
                    continue;
                }
                let outcome = self
                    .state_store
                    .process(&self.queue_key, message.clone(), self.invoker.as_ref(), self.sender.as_ref(), self.process_timeout)
                    .await?;
                debug!(queue = self.queue_key.name(), topic = topic.name(), message_id = %message.id, outcome = ?outcome, "processed queued message");
            }

            if snapshot.is_empty() {
                overrun += ITERATION;
            } else {
                overrun = Duration::ZERO;
            }

            if snapshot.is_empty() && overrun > self.sliding_window {
                debug!(queue = self.queue_key.name(), topic = topic.name(), "topic drained, stopping worker");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rq_affinity::{AffinityBackend, InsertOutcome};
    use rq_common::{Message, TopicAffinity};
    use rq_storage::{ProcessOutcome, StorageError};
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FakeAffinityBackend {
        rows: Mutex<HashMap<String, TopicAffinity>>,
    }

    impl FakeAffinityBackend {
        fn new() -> Self {
            Self { rows: Mutex::new(HashMap::new()) }
        }
        fn key(queue_key: &QueueKey, topic: &Topic) -> String {
            format!("{}/{}", queue_key.safe(), topic.id())
        }
    }

    #[async_trait]
    impl AffinityBackend for FakeAffinityBackend {
        async fn get(&self, queue_key: &QueueKey, topic: &Topic) -> rq_affinity::Result<Option<TopicAffinity>> {
            Ok(self.rows.lock().unwrap().get(&Self::key(queue_key, topic)).cloned())
        }
        async fn try_insert(&self, mut affinity: TopicAffinity) -> rq_affinity::Result<InsertOutcome> {
            let mut rows = self.rows.lock().unwrap();
            let key = format!("{}/{}", affinity.partition_key, affinity.row_key);
            if rows.contains_key(&key) {
                return Ok(InsertOutcome::Conflict);
            }
            affinity.e_tag = "1".to_string();
            rows.insert(key, affinity.clone());
            Ok(InsertOutcome::Inserted(affinity))
        }
        async fn replace(&self, affinity: &mut TopicAffinity, expected_etag: &str) -> rq_affinity::Result<bool> {
            let mut rows = self.rows.lock().unwrap();
            let key = format!("{}/{}", affinity.partition_key, affinity.row_key);
            match rows.get(&key) {
                Some(current) if current.e_tag == expected_etag => {
                    affinity.e_tag = "2".to_string();
                    rows.insert(key, affinity.clone());
                    Ok(true)
                }
                _ => Ok(false),
            }
        }
    }

    struct EmptyStateStore;

    #[async_trait]
    impl StateStore for EmptyStateStore {
        async fn add(&self, _queue_key: &QueueKey, message: Message, _timeout: Duration) -> rq_storage::Result<Message> {
            Ok(message)
        }
        async fn queue(&self, _queue_key: &QueueKey, message: Message, _timeout: Duration) -> rq_storage::Result<Message> {
            Ok(message)
        }
        async fn get_queued_in_topic(
            &self,
            _queue_key: &QueueKey,
            _topic: &Topic,
            _this_process_identity: &str,
            _timeout: Duration,
        ) -> rq_storage::Result<Vec<Message>> {
            Ok(Vec::new())
        }
        async fn get_live_topics(&self, _queue_key: &QueueKey, _timeout: Duration) -> rq_storage::Result<Vec<Topic>> {
            Ok(Vec::new())
        }
        async fn process(
            &self,
            _queue_key: &QueueKey,
            _message: Message,
            _invoker: &dyn SubscriberInvoker,
            _sender: &dyn NotificationResender,
            _timeout: Duration,
        ) -> rq_storage::Result<ProcessOutcome> {
            Ok(ProcessOutcome::Succeeded)
        }
    }

    struct NoSubscriber;
    #[async_trait]
    impl SubscriberInvoker for NoSubscriber {
        fn has_subscriber(&self, _queue_key: &QueueKey) -> bool {
            false
        }
        async fn invoke(&self, _queue_key: &QueueKey, _message: &Message) -> bool {
            false
        }
    }

    struct NoopResender;
    #[async_trait]
    impl NotificationResender for NoopResender {
        async fn resend(&self, _queue_key: &QueueKey, _message: &Message) -> std::result::Result<(), StorageError> {
            Ok(())
        }
    }

    fn make_scheduler(queue_can_receive: bool) -> Arc<TopicScheduler> {
        let affinity = Arc::new(TopicAffinityArbiter::new(
            Arc::new(FakeAffinityBackend::new()),
            Duration::from_secs(60),
            "host-1",
        ));
        Arc::new(TopicScheduler::new(
            QueueKey::new("orders"),
            queue_can_receive,
            Arc::new(EmptyStateStore),
            affinity,
            Arc::new(NoSubscriber),
            Arc::new(NoopResender),
            "host-1",
            Duration::from_secs(5),
            Duration::from_millis(50),
        ))
    }

    #[tokio::test]
    async fn on_received_drops_empty_payload() {
        let scheduler = make_scheduler(true);
        scheduler.on_received(&[]).await.unwrap();
        assert!(scheduler.active.is_empty());
    }

    #[tokio::test]
    async fn on_received_starts_and_drains_a_worker() {
        let scheduler = make_scheduler(true);
        let payload = br#"{"id":"m1","queueKey":"orders","topic":"ord"}"#;
        scheduler.on_received(payload).await.unwrap();
        assert!(scheduler.active.contains("ord"));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(scheduler.active.is_empty());
    }

    #[tokio::test]
    async fn rejects_when_not_configured_to_receive() {
        let scheduler = make_scheduler(false);
        let payload = br#"{"id":"m1","queueKey":"orders","topic":"ord"}"#;
        let result = scheduler.on_received(payload).await;
        assert!(result.is_err());
    }
}
