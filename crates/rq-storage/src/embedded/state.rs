//! SQLite-backed `StateStore`. Each row is keyed by (queue_key,
//! partition_key=topic id, row_key=message id); `e_tag` is a fresh UUID on
//! every write, giving the same "replace only if eTag matches" semantics a
//! real table service provides.

use crate::embedded::pool::SqlitePoolCache;
use crate::error::{Result, StorageError};
use crate::state::{NotificationResender, ProcessOutcome, StateStore, SubscriberInvoker};
use crate::body::BodyStore;
use async_trait::async_trait;
use chrono::Utc;
use rq_common::{Message, MessageState, QueueKey, Topic};
use sqlx::Row;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

pub struct SqliteStateStore {
    connection_string: String,
    pools: Arc<SqlitePoolCache>,
    body_store: Arc<dyn BodyStore>,
    process_identity: String,
}

impl SqliteStateStore {
    pub fn new(
        connection_string: impl Into<String>,
        pools: Arc<SqlitePoolCache>,
        body_store: Arc<dyn BodyStore>,
        process_identity: impl Into<String>,
    ) -> Self {
        Self {
            connection_string: connection_string.into(),
            pools,
            body_store,
            process_identity: process_identity.into(),
        }
    }

    async fn pool(&self) -> Result<Arc<sqlx::Pool<sqlx::Sqlite>>> {
        self.pools.get(&self.connection_string).await
    }

    async fn ensure_schema(&self, pool: &sqlx::Pool<sqlx::Sqlite>) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS message_state (
                seq_id INTEGER PRIMARY KEY AUTOINCREMENT,
                queue_key TEXT NOT NULL,
                partition_key TEXT NOT NULL,
                row_key TEXT NOT NULL,
                state TEXT NOT NULL,
                last_updated_utc INTEGER NOT NULL,
                e_tag TEXT NOT NULL,
                payload TEXT NOT NULL,
                UNIQUE(queue_key, partition_key, row_key)
            )
            "#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<Message> {
        let payload: String = row.get("payload");
        let mut message: Message = serde_json::from_str(&payload)?;
        message.sequence = row.get::<i64, _>("seq_id");
        message.e_tag = row.get("e_tag");
        Ok(message)
    }

    async fn fetch_current(
        &self,
        pool: &sqlx::Pool<sqlx::Sqlite>,
        queue_key: &str,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Option<Message>> {
        let row = sqlx::query(
            "SELECT seq_id, e_tag, payload FROM message_state WHERE queue_key = ? AND partition_key = ? AND row_key = ?",
        )
        .bind(queue_key)
        .bind(partition_key)
        .bind(row_key)
        .fetch_optional(pool)
        .await?;

        row.as_ref().map(Self::row_to_message).transpose()
    }

    async fn replace_row(
        &self,
        pool: &sqlx::Pool<sqlx::Sqlite>,
        queue_key: &str,
        message: &mut Message,
        expected_e_tag: &str,
    ) -> Result<bool> {
        let new_e_tag = uuid::Uuid::new_v4().to_string();
        let payload = serde_json::to_string(message)?;

        let result = sqlx::query(
            r#"
            UPDATE message_state
            SET state = ?, last_updated_utc = ?, e_tag = ?, payload = ?
            WHERE queue_key = ? AND partition_key = ? AND row_key = ? AND e_tag = ?
            "#,
        )
        .bind(message.state.as_str())
        .bind(message.last_updated_utc.timestamp())
        .bind(&new_e_tag)
        .bind(&payload)
        .bind(queue_key)
        .bind(&message.partition_key)
        .bind(&message.row_key)
        .bind(expected_e_tag)
        .execute(pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }
        message.e_tag = new_e_tag;
        Ok(true)
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn add(&self, queue_key: &QueueKey, mut message: Message, _timeout: Duration) -> Result<Message> {
        let pool = self.pool().await?;
        self.ensure_schema(&pool).await?;
        let qk = queue_key.safe();

        if let Some(existing) = self
            .fetch_current(&pool, qk, &message.partition_key, &message.row_key)
            .await?
        {
            debug!(queue_key = qk, message_id = %message.id, "add is idempotent, row already exists");
            return Ok(existing);
        }

        message.e_tag = uuid::Uuid::new_v4().to_string();
        let payload = serde_json::to_string(&message)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO message_state (queue_key, partition_key, row_key, state, last_updated_utc, e_tag, payload)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(qk)
        .bind(&message.partition_key)
        .bind(&message.row_key)
        .bind(message.state.as_str())
        .bind(message.last_updated_utc.timestamp())
        .bind(&message.e_tag)
        .bind(&payload)
        .execute(&*pool)
        .await?;

        message.sequence = inserted.last_insert_rowid();
        Ok(message)
    }

    async fn queue(&self, queue_key: &QueueKey, mut message: Message, _timeout: Duration) -> Result<Message> {
        let pool = self.pool().await?;
        self.ensure_schema(&pool).await?;
        let qk = queue_key.safe();

        message.state = MessageState::Queued;
        message.last_updated_utc = Utc::now();
        let expected = message.e_tag.clone();

        if !self.replace_row(&pool, qk, &mut message, &expected).await? {
            return Err(StorageError::Conflict {
                partition_key: message.partition_key.clone(),
                row_key: message.row_key.clone(),
            });
        }
        Ok(message)
    }

    async fn get_queued_in_topic(
        &self,
        queue_key: &QueueKey,
        topic: &Topic,
        this_process_identity: &str,
        _timeout: Duration,
    ) -> Result<Vec<Message>> {
        let pool = self.pool().await?;
        self.ensure_schema(&pool).await?;
        let qk = queue_key.safe();

        let rows = sqlx::query(
            "SELECT seq_id, e_tag, payload FROM message_state WHERE queue_key = ? AND partition_key = ? AND state = ?",
        )
        .bind(qk)
        .bind(topic.id())
        .bind(MessageState::Queued.as_str())
        .fetch_all(&pool)
        .await?;

        let mut messages: Vec<Message> = rows
            .iter()
            .map(Self::row_to_message)
            .collect::<Result<Vec<_>>>()?;

        messages.sort_by(|a, b| a.cmp_order(b, this_process_identity));
        Ok(messages)
    }

    async fn get_live_topics(&self, queue_key: &QueueKey, _timeout: Duration) -> Result<Vec<Topic>> {
        let pool = self.pool().await?;
        self.ensure_schema(&pool).await?;
        let qk = queue_key.safe();

        let rows = sqlx::query(
            r#"
            SELECT partition_key, MIN(seq_id) as first_seq
            FROM message_state
            WHERE queue_key = ?
            GROUP BY partition_key
            ORDER BY first_seq ASC
            "#,
        )
        .bind(qk)
        .fetch_all(&pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| Topic::from_id(r.get::<String, _>("partition_key")))
            .collect())
    }

    async fn process(
        &self,
        queue_key: &QueueKey,
        message: Message,
        invoker: &dyn SubscriberInvoker,
        sender: &dyn NotificationResender,
        timeout: Duration,
    ) -> Result<ProcessOutcome> {
        // Step 1: no local subscriber means this attempt doesn't count.
        if !invoker.has_subscriber(queue_key) {
            return Ok(ProcessOutcome::Skipped);
        }

        let pool = self.pool().await?;
        let qk = queue_key.safe();

        // Step 2: refetch current state.
        let mut current = self
            .fetch_current(&pool, qk, &message.partition_key, &message.row_key)
            .await?
            .ok_or_else(|| StorageError::NotFound {
                partition_key: message.partition_key.clone(),
                row_key: message.row_key.clone(),
            })?;

        match current.state {
            MessageState::Queued => {}
            MessageState::Processing => return Ok(ProcessOutcome::Skipped),
            other => {
                return Err(StorageError::UnexpectedState {
                    expected: MessageState::Queued,
                    actual: other,
                });
            }
        }

        // Step 3: optimistic transition to Processing (or Failed if attempts exhausted).
        let expected_e_tag = current.e_tag.clone();
        current.owner = self.process_identity.clone();
        current.last_updated_utc = Utc::now();
        current.attempts += 1;
        current.state = if current.attempts > current.max_attempts {
            MessageState::Failed
        } else {
            MessageState::Processing
        };

        if !self.replace_row(&pool, qk, &mut current, &expected_e_tag).await? {
            // Lost the race to transition; another peer is handling it.
            return Ok(ProcessOutcome::Skipped);
        }

        if current.state == MessageState::Failed {
            warn!(queue_key = qk, message_id = %current.id, attempts = current.attempts, "message exhausted retries, marked Failed");
            return Ok(ProcessOutcome::Failed);
        }

        // Step 4: invoke the subscriber with a deadline; a thrown callback
        // is the invoker's responsibility to translate to `false`.
        let invoke_result = tokio::time::timeout(timeout, invoker.invoke(queue_key, &current)).await;
        let succeeded = match invoke_result {
            Ok(result) => result,
            Err(_) => {
                error!(queue_key = qk, message_id = %current.id, "subscriber callback timed out");
                false
            }
        };

        // Step 5: refetch; it must still be Processing.
        let mut after = self
            .fetch_current(&pool, qk, &current.partition_key, &current.row_key)
            .await?
            .ok_or_else(|| StorageError::NotFound {
                partition_key: current.partition_key.clone(),
                row_key: current.row_key.clone(),
            })?;

        if after.state != MessageState::Processing {
            return Err(StorageError::UnexpectedState {
                expected: MessageState::Processing,
                actual: after.state,
            });
        }

        if succeeded {
            sqlx::query("DELETE FROM message_state WHERE queue_key = ? AND partition_key = ? AND row_key = ?")
                .bind(qk)
                .bind(&after.partition_key)
                .bind(&after.row_key)
                .execute(&*pool)
                .await?;
            self.body_store.delete(queue_key, &after.id, timeout).await?;
            Ok(ProcessOutcome::Succeeded)
        } else {
            let expected = after.e_tag.clone();
            after.state = MessageState::Queued;
            after.owner = self.process_identity.clone();
            after.last_updated_utc = Utc::now();
            // A 404-equivalent on this replace (row vanished) is tolerated.
            let _ = self.replace_row(&pool, qk, &mut after, &expected).await;
            sender.resend(queue_key, &after).await?;
            Ok(ProcessOutcome::Failed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedded::body::SqliteBodyStore;
    use rq_common::Topic;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct AlwaysSubscribed {
        result: bool,
        invocations: AtomicUsize,
    }

    #[async_trait]
    impl SubscriberInvoker for AlwaysSubscribed {
        fn has_subscriber(&self, _queue_key: &QueueKey) -> bool {
            true
        }

        async fn invoke(&self, _queue_key: &QueueKey, _message: &Message) -> bool {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            self.result
        }
    }

    struct NoSubscriber;

    #[async_trait]
    impl SubscriberInvoker for NoSubscriber {
        fn has_subscriber(&self, _queue_key: &QueueKey) -> bool {
            false
        }

        async fn invoke(&self, _queue_key: &QueueKey, _message: &Message) -> bool {
            unreachable!("has_subscriber returned false")
        }
    }

    struct RecordingResender {
        resent: std::sync::Mutex<Vec<String>>,
    }

    impl RecordingResender {
        fn new() -> Self {
            Self {
                resent: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl NotificationResender for RecordingResender {
        async fn resend(&self, _queue_key: &QueueKey, message: &Message) -> Result<()> {
            self.resent.lock().unwrap().push(message.id.clone());
            Ok(())
        }
    }

    fn test_store() -> SqliteStateStore {
        let pools = Arc::new(SqlitePoolCache::new());
        let body_store: Arc<dyn BodyStore> =
            Arc::new(SqliteBodyStore::new("sqlite::memory:", pools.clone(), "host-1"));
        SqliteStateStore::new("sqlite::memory:", pools, body_store, "host-1")
    }

    #[tokio::test]
    async fn add_is_idempotent_by_primary_key() {
        let store = test_store();
        let qk = QueueKey::new("orders");
        let topic = Topic::new("t1");
        let msg = Message::new(&qk, &topic, "host-1", 0, 3, 30, 300);

        let first = store.add(&qk, msg.clone(), Duration::from_secs(5)).await.unwrap();
        let second = store.add(&qk, msg, Duration::from_secs(5)).await.unwrap();
        assert_eq!(first.sequence, second.sequence);
    }

    #[tokio::test]
    async fn process_skips_when_no_subscriber() {
        let store = test_store();
        let qk = QueueKey::new("orders");
        let topic = Topic::new("t1");
        let msg = Message::new(&qk, &topic, "host-1", 0, 3, 30, 300);
        let added = store.add(&qk, msg, Duration::from_secs(5)).await.unwrap();
        let queued = store.queue(&qk, added, Duration::from_secs(5)).await.unwrap();

        let outcome = store
            .process(&qk, queued, &NoSubscriber, &RecordingResender::new(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome, ProcessOutcome::Skipped);
    }

    #[tokio::test]
    async fn process_succeeds_and_deletes_row() {
        let store = test_store();
        let qk = QueueKey::new("orders");
        let topic = Topic::new("t1");
        let msg = Message::new(&qk, &topic, "host-1", 0, 3, 30, 300);
        let added = store.add(&qk, msg, Duration::from_secs(5)).await.unwrap();
        let queued = store.queue(&qk, added, Duration::from_secs(5)).await.unwrap();

        let invoker = AlwaysSubscribed {
            result: true,
            invocations: AtomicUsize::new(0),
        };
        let outcome = store
            .process(&qk, queued.clone(), &invoker, &RecordingResender::new(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome, ProcessOutcome::Succeeded);

        let remaining = store
            .get_queued_in_topic(&qk, &topic, "host-1", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn process_requeues_on_failure_and_resends() {
        let store = test_store();
        let qk = QueueKey::new("orders");
        let topic = Topic::new("t1");
        let msg = Message::new(&qk, &topic, "host-1", 0, 3, 30, 300);
        let added = store.add(&qk, msg, Duration::from_secs(5)).await.unwrap();
        let queued = store.queue(&qk, added, Duration::from_secs(5)).await.unwrap();

        let invoker = AlwaysSubscribed {
            result: false,
            invocations: AtomicUsize::new(0),
        };
        let resender = RecordingResender::new();
        let outcome = store
            .process(&qk, queued, &invoker, &resender, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome, ProcessOutcome::Failed);
        assert_eq!(resender.resent.lock().unwrap().len(), 1);

        let remaining = store
            .get_queued_in_topic(&qk, &topic, "host-1", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].attempts, 1);
    }

    #[tokio::test]
    async fn process_marks_failed_after_max_attempts() {
        let store = test_store();
        let qk = QueueKey::new("orders");
        let topic = Topic::new("t1");
        let mut msg = Message::new(&qk, &topic, "host-1", 0, 1, 30, 300);
        msg.attempts = 1; // already at max_attempts
        let added = store.add(&qk, msg, Duration::from_secs(5)).await.unwrap();
        let queued = store.queue(&qk, added, Duration::from_secs(5)).await.unwrap();

        let invoker = AlwaysSubscribed {
            result: true,
            invocations: AtomicUsize::new(0),
        };
        let outcome = store
            .process(&qk, queued, &invoker, &RecordingResender::new(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome, ProcessOutcome::Failed);
        assert_eq!(invoker.invocations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn get_queued_in_topic_sorts_by_comparator() {
        let store = test_store();
        let qk = QueueKey::new("orders");
        let topic = Topic::new("t1");

        let mut m1 = Message::new(&qk, &topic, "host-1", 5, 3, 30, 300);
        let mut m2 = Message::new(&qk, &topic, "host-1", 1, 3, 30, 300);
        m1 = store.add(&qk, m1, Duration::from_secs(5)).await.unwrap();
        m2 = store.add(&qk, m2, Duration::from_secs(5)).await.unwrap();
        store.queue(&qk, m1, Duration::from_secs(5)).await.unwrap();
        store.queue(&qk, m2, Duration::from_secs(5)).await.unwrap();

        let sorted = store
            .get_queued_in_topic(&qk, &topic, "host-1", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(sorted.len(), 2);
        // Same-process source: ordered by local_sequence, not insert order.
        assert_eq!(sorted[0].local_sequence, 1);
        assert_eq!(sorted[1].local_sequence, 5);
    }
}
