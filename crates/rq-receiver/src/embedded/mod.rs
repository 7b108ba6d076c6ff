//! SQLite-backed `PolledQueue`, consuming rows from the same
//! `notification_messages` table the embedded sender writes to.

use crate::error::{ReceiverError, Result};
use crate::listener::{PolledMessage, PolledQueue};
use async_trait::async_trait;
use rq_common::QueueKey;
use rq_storage::embedded::SqlitePoolCache;
use std::sync::Arc;

pub struct SqliteNotificationListener {
    connection_string: String,
    pool_cache: Arc<SqlitePoolCache>,
    queue_key: QueueKey,
}

impl SqliteNotificationListener {
    pub fn new(connection_string: impl Into<String>, pool_cache: Arc<SqlitePoolCache>, queue_key: QueueKey) -> Self {
        Self {
            connection_string: connection_string.into(),
            pool_cache,
            queue_key,
        }
    }

    async fn ensure_schema(&self, pool: &sqlx::Pool<sqlx::Sqlite>) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS notification_messages (
                id TEXT PRIMARY KEY,
                queue_key TEXT NOT NULL,
                payload BLOB NOT NULL,
                enqueued_utc INTEGER NOT NULL
            )",
        )
        .execute(pool)
        .await
        .map_err(|e| ReceiverError::Backend {
            queue_key: self.queue_key.name().to_string(),
            message: e.to_string(),
        })?;
        Ok(())
    }
}

#[async_trait]
impl PolledQueue for SqliteNotificationListener {
    async fn receive_messages(&self, max: u32) -> Result<Vec<PolledMessage>> {
        let pool = self
            .pool_cache
            .get(&self.connection_string)
            .await
            .map_err(|e| ReceiverError::Backend {
                queue_key: self.queue_key.name().to_string(),
                message: e.to_string(),
            })?;
        self.ensure_schema(&pool).await?;

        let rows: Vec<(String, Vec<u8>)> = sqlx::query_as(
            "SELECT id, payload FROM notification_messages WHERE queue_key = ? ORDER BY enqueued_utc ASC LIMIT ?",
        )
        .bind(self.queue_key.safe())
        .bind(max)
        .fetch_all(pool.as_ref())
        .await
        .map_err(|e| ReceiverError::Backend {
            queue_key: self.queue_key.name().to_string(),
            message: e.to_string(),
        })?;

        Ok(rows
            .into_iter()
            .map(|(id, payload)| PolledMessage {
                pop_receipt: id.clone(),
                id,
                payload,
            })
            .collect())
    }

    async fn delete(&self, id: &str, _pop_receipt: &str) -> Result<()> {
        let pool = self
            .pool_cache
            .get(&self.connection_string)
            .await
            .map_err(|e| ReceiverError::Backend {
                queue_key: self.queue_key.name().to_string(),
                message: e.to_string(),
            })?;

        sqlx::query("DELETE FROM notification_messages WHERE id = ?")
            .bind(id)
            .execute(pool.as_ref())
            .await
            .map_err(|e| ReceiverError::Backend {
                queue_key: self.queue_key.name().to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seed(listener: &SqliteNotificationListener, id: &str, body: &[u8]) {
        let pool = listener.pool_cache.get(&listener.connection_string).await.unwrap();
        listener.ensure_schema(&pool).await.unwrap();
        sqlx::query("INSERT INTO notification_messages (id, queue_key, payload, enqueued_utc) VALUES (?, ?, ?, ?)")
            .bind(id)
            .bind(listener.queue_key.safe())
            .bind(body)
            .bind(0i64)
            .execute(pool.as_ref())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn receive_then_delete_drains_the_row() {
        let listener = SqliteNotificationListener::new("sqlite::memory:", Arc::new(SqlitePoolCache::new()), QueueKey::new("orders"));
        seed(&listener, "n1", b"hello").await;

        let batch = listener.receive_messages(16).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload, b"hello");

        listener.delete(&batch[0].id, &batch[0].pop_receipt).await.unwrap();
        let remaining = listener.receive_messages(16).await.unwrap();
        assert!(remaining.is_empty());
    }
}
