//! Drives the scheduler against real embedded (SQLite) state, body, and
//! affinity backends: a message is added and queued the way a sender
//! would, then handed to the scheduler as a notification, and delivery to
//! the subscriber is observed.

use async_trait::async_trait;
use rq_affinity::embedded::SqliteAffinityBackend;
use rq_affinity::TopicAffinityArbiter;
use rq_common::{Message, MessageState, QueueKey, Topic};
use rq_receiver::TopicScheduler;
use rq_storage::embedded::{SqliteBodyStore, SqlitePoolCache, SqliteStateStore};
use rq_storage::state::{NotificationResender, SubscriberInvoker};
use rq_storage::{BodyStore, Result as StorageResult, StateStore};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

struct RecordingInvoker {
    calls: Mutex<Vec<Message>>,
}

#[async_trait]
impl SubscriberInvoker for RecordingInvoker {
    fn has_subscriber(&self, _queue_key: &QueueKey) -> bool {
        true
    }

    async fn invoke(&self, _queue_key: &QueueKey, message: &Message) -> bool {
        self.calls.lock().await.push(message.clone());
        true
    }
}

struct NoopResender;

#[async_trait]
impl NotificationResender for NoopResender {
    async fn resend(&self, _queue_key: &QueueKey, _message: &Message) -> StorageResult<()> {
        Ok(())
    }
}

#[tokio::test]
async fn a_sent_message_is_delivered_exactly_once() {
    let queue_key = QueueKey::new("orders");
    let topic = Topic::new("customer-42");
    let pools = Arc::new(SqlitePoolCache::new());
    let conn = "sqlite::memory:";

    let body: Arc<dyn BodyStore> = Arc::new(SqliteBodyStore::new(conn, pools.clone(), "host-1"));
    let state: Arc<dyn StateStore> = Arc::new(SqliteStateStore::new(conn, pools.clone(), body.clone(), "host-1"));

    let affinity_backend = Arc::new(SqliteAffinityBackend::new(conn, pools));
    let affinity = Arc::new(TopicAffinityArbiter::new(affinity_backend, Duration::from_secs(60), "host-1"));

    let invoker = Arc::new(RecordingInvoker { calls: Mutex::new(Vec::new()) });
    let sender: Arc<dyn NotificationResender> = Arc::new(NoopResender);

    let scheduler = Arc::new(TopicScheduler::new(
        queue_key.clone(),
        true,
        state.clone(),
        affinity,
        invoker.clone(),
        sender,
        "host-1",
        Duration::from_secs(30),
        Duration::from_millis(50),
    ));

    let message = Message::new(&queue_key, &topic, "host-1", 0, 5, 30, 300);
    let added = state.add(&queue_key, message, Duration::from_secs(5)).await.unwrap();
    let queued = state.queue(&queue_key, added, Duration::from_secs(5)).await.unwrap();
    assert_eq!(queued.state, MessageState::Queued);

    let notification = format!(
        r#"{{"id":"{}","queueKey":"{}","topic":"{}"}}"#,
        queued.id,
        queue_key.safe(),
        topic.id(),
    );
    scheduler.on_received(notification.as_bytes()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(250)).await;

    let calls = invoker.calls.lock().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].id, queued.id);
}

#[tokio::test]
async fn rescan_recovers_an_orphaned_topic_with_no_notification() {
    let queue_key = QueueKey::new("orders");
    let topic = Topic::new("customer-99");
    let pools = Arc::new(SqlitePoolCache::new());
    let conn = "sqlite::memory:";

    let body: Arc<dyn BodyStore> = Arc::new(SqliteBodyStore::new(conn, pools.clone(), "host-1"));
    let state: Arc<dyn StateStore> = Arc::new(SqliteStateStore::new(conn, pools.clone(), body.clone(), "host-1"));

    let affinity_backend = Arc::new(SqliteAffinityBackend::new(conn, pools));
    let affinity = Arc::new(TopicAffinityArbiter::new(affinity_backend, Duration::from_secs(60), "host-1"));

    let invoker = Arc::new(RecordingInvoker { calls: Mutex::new(Vec::new()) });
    let sender: Arc<dyn NotificationResender> = Arc::new(NoopResender);

    let scheduler = Arc::new(TopicScheduler::new(
        queue_key.clone(),
        true,
        state.clone(),
        affinity,
        invoker.clone(),
        sender,
        "host-1",
        Duration::from_secs(30),
        Duration::from_millis(50),
    ));

    let message = Message::new(&queue_key, &topic, "host-1", 0, 5, 30, 300);
    let added = state.add(&queue_key, message, Duration::from_secs(5)).await.unwrap();
    state.queue(&queue_key, added, Duration::from_secs(5)).await.unwrap();

    // No notification ever arrives for this message; only a rescan finds it.
    scheduler.rescan_live_topics().await.unwrap();

    tokio::time::sleep(Duration::from_millis(250)).await;

    let calls = invoker.calls.lock().await;
    assert_eq!(calls.len(), 1);
}

#[tokio::test]
async fn uncounted_race_reads_are_harmless() {
    // Two notifications for the same topic in quick succession must start
    // exactly one worker loop, not two.
    let queue_key = QueueKey::new("orders");
    let topic = Topic::new("customer-7");
    let pools = Arc::new(SqlitePoolCache::new());
    let conn = "sqlite::memory:";

    let body: Arc<dyn BodyStore> = Arc::new(SqliteBodyStore::new(conn, pools.clone(), "host-1"));
    let state: Arc<dyn StateStore> = Arc::new(SqliteStateStore::new(conn, pools.clone(), body.clone(), "host-1"));

    let affinity_backend = Arc::new(SqliteAffinityBackend::new(conn, pools));
    let affinity = Arc::new(TopicAffinityArbiter::new(affinity_backend, Duration::from_secs(60), "host-1"));

    let invoke_count = Arc::new(AtomicUsize::new(0));
    struct CountingInvoker {
        count: Arc<AtomicUsize>,
    }
    #[async_trait]
    impl SubscriberInvoker for CountingInvoker {
        fn has_subscriber(&self, _queue_key: &QueueKey) -> bool {
            true
        }
        async fn invoke(&self, _queue_key: &QueueKey, _message: &Message) -> bool {
            self.count.fetch_add(1, Ordering::SeqCst);
            true
        }
    }
    let invoker = Arc::new(CountingInvoker { count: invoke_count.clone() });
    let sender: Arc<dyn NotificationResender> = Arc::new(NoopResender);

    let scheduler = Arc::new(TopicScheduler::new(
        queue_key.clone(),
        true,
        state.clone(),
        affinity,
        invoker,
        sender,
        "host-1",
        Duration::from_secs(30),
        Duration::from_millis(50),
    ));

    let message = Message::new(&queue_key, &topic, "host-1", 0, 5, 30, 300);
    let added = state.add(&queue_key, message, Duration::from_secs(5)).await.unwrap();
    let queued = state.queue(&queue_key, added, Duration::from_secs(5)).await.unwrap();

    let notification = format!(
        r#"{{"id":"{}","queueKey":"{}","topic":"{}"}}"#,
        queued.id,
        queue_key.safe(),
        topic.id(),
    );
    let a = scheduler.clone();
    let b = scheduler.clone();
    let payload_a = notification.clone().into_bytes();
    let payload_b = notification.into_bytes();
    let (r1, r2) = tokio::join!(
        tokio::spawn(async move { a.on_received(&payload_a).await }),
        tokio::spawn(async move { b.on_received(&payload_b).await }),
    );
    r1.unwrap().unwrap();
    r2.unwrap().unwrap();

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(invoke_count.load(Ordering::SeqCst), 1);
}
