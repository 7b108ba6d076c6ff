//! Builds a per-queue handle bundling state/body storage, the affinity
//! arbiter, the sender, and the sliding-window scheduler, from a single
//! `QueueDefinition`. Backend wiring is chosen by Cargo feature.

use crate::error::{FacadeError, Result};
use crate::subscription::SubscriberRegistry;
use rq_config::{QueueDefinition, QueueMode};
use rq_receiver::{PolledQueue, TopicScheduler};
use rq_sender::NotificationSender;
use rq_storage::{BodyStore, StateStore};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rq_common::QueueKey;

/// Everything a facade needs to act on one configured queue.
pub struct QueueHandle {
    pub key: QueueKey,
    pub mode: QueueMode,
    pub default_timeout: Duration,
    pub max_attempts: u32,
    pub create_listener: bool,
    pub state: Arc<dyn StateStore>,
    pub body: Arc<dyn BodyStore>,
    pub sender: Arc<NotificationSender>,
    pub scheduler: Arc<TopicScheduler>,
    pub listener_queue: Arc<dyn PolledQueue>,
    local_sequence: AtomicU32,
}

impl QueueHandle {
    pub fn next_local_sequence(&self) -> u32 {
        self.local_sequence.fetch_add(1, Ordering::SeqCst)
    }
}

/// Build the handle for one queue definition, wiring embedded (SQLite) or
/// Azure backends depending on which Cargo feature is active.
pub fn build_handle(
    name: &str,
    def: &QueueDefinition,
    subscribers: Arc<SubscriberRegistry>,
    process_identity: &str,
) -> Result<QueueHandle> {
    let key = QueueKey::new(name);
    let mode = def.parsed_mode(name).map_err(|e| FacadeError::Config {
        queue_key: name.to_string(),
        message: e.to_string(),
    })?;
    let default_timeout = Duration::from_secs(def.default_timeout_seconds);

    #[cfg(feature = "embedded")]
    let (state, body, sender, scheduler, listener_queue) = build_embedded(&key, def, mode, subscribers, process_identity);

    #[cfg(all(feature = "azure", not(feature = "embedded")))]
    let (state, body, sender, scheduler, listener_queue) = build_azure(&key, def, mode, subscribers, process_identity);

    Ok(QueueHandle {
        key,
        mode,
        default_timeout,
        max_attempts: def.max_attempts,
        create_listener: def.create_listener,
        state,
        body,
        sender,
        scheduler,
        listener_queue,
        local_sequence: AtomicU32::new(0),
    })
}

#[cfg(feature = "embedded")]
#[allow(clippy::type_complexity)]
fn build_embedded(
    key: &QueueKey,
    def: &QueueDefinition,
    mode: QueueMode,
    subscribers: Arc<SubscriberRegistry>,
    process_identity: &str,
) -> (
    Arc<dyn StateStore>,
    Arc<dyn BodyStore>,
    Arc<NotificationSender>,
    Arc<TopicScheduler>,
    Arc<dyn PolledQueue>,
) {
    use rq_affinity::embedded::SqliteAffinityBackend;
    use rq_affinity::TopicAffinityArbiter;
    use rq_receiver::embedded::SqliteNotificationListener;
    use rq_sender::embedded::SqliteNotificationQueue;
    use rq_storage::embedded::{SqliteBodyStore, SqliteStateStore, SqlitePoolCache};

    let pools = Arc::new(SqlitePoolCache::new());
    let conn = def.storage_connection_string.clone();

    let body: Arc<dyn BodyStore> = Arc::new(SqliteBodyStore::new(conn.clone(), pools.clone(), process_identity));
    let state: Arc<dyn StateStore> = Arc::new(SqliteStateStore::new(conn.clone(), pools.clone(), body.clone(), process_identity));

    let notification_queue = Arc::new(SqliteNotificationQueue::new(conn.clone(), pools.clone()));
    let sender = Arc::new(NotificationSender::new(notification_queue));

    let listener_queue: Arc<dyn PolledQueue> = Arc::new(SqliteNotificationListener::new(conn.clone(), pools.clone(), key.clone()));

    let affinity_backend = Arc::new(SqliteAffinityBackend::new(conn, pools));
    let affinity = Arc::new(TopicAffinityArbiter::new(
        affinity_backend,
        Duration::from_secs(def.topic_affinity_ttl_seconds),
        process_identity,
    ));

    let scheduler = Arc::new(TopicScheduler::new(
        key.clone(),
        mode.can_receive(),
        state.clone(),
        affinity,
        subscribers,
        sender.clone(),
        process_identity,
        Duration::from_secs(def.default_timeout_seconds),
        Duration::from_secs(def.sliding_window_duration_seconds),
    ));

    (state, body, sender, scheduler, listener_queue)
}

#[cfg(all(feature = "azure", not(feature = "embedded")))]
#[allow(clippy::type_complexity)]
fn build_azure(
    key: &QueueKey,
    def: &QueueDefinition,
    mode: QueueMode,
    subscribers: Arc<SubscriberRegistry>,
    process_identity: &str,
) -> (
    Arc<dyn StateStore>,
    Arc<dyn BodyStore>,
    Arc<NotificationSender>,
    Arc<TopicScheduler>,
    Arc<dyn PolledQueue>,
) {
    use rq_affinity::azure::AzureAffinityBackend;
    use rq_affinity::TopicAffinityArbiter;
    use rq_receiver::azure::AzureNotificationListener;
    use rq_sender::azure::AzureNotificationQueue;
    use rq_storage::azure::{AzureBodyStore, AzureResourceBroker, AzureStateStore};

    let broker = Arc::new(AzureResourceBroker::new());
    let conn = def.storage_connection_string.clone();

    let body: Arc<dyn BodyStore> = Arc::new(AzureBodyStore::new(conn.clone(), broker.clone()));
    let state: Arc<dyn StateStore> = Arc::new(AzureStateStore::new(conn.clone(), broker.clone(), body.clone(), process_identity));

    let notification_queue = Arc::new(AzureNotificationQueue::new(conn.clone(), broker.clone()));
    let sender = Arc::new(NotificationSender::new(notification_queue));

    let listener_queue: Arc<dyn PolledQueue> = Arc::new(AzureNotificationListener::new(conn.clone(), broker.clone(), key.clone()));

    let affinity_backend = Arc::new(AzureAffinityBackend::new(conn, broker));
    let affinity = Arc::new(TopicAffinityArbiter::new(
        affinity_backend,
        Duration::from_secs(def.topic_affinity_ttl_seconds),
        process_identity,
    ));

    let scheduler = Arc::new(TopicScheduler::new(
        key.clone(),
        mode.can_receive(),
        state.clone(),
        affinity,
        subscribers,
        sender.clone(),
        process_identity,
        Duration::from_secs(def.default_timeout_seconds),
        Duration::from_secs(def.sliding_window_duration_seconds),
    ));

    (state, body, sender, scheduler, listener_queue)
}
