//! SQLite-backed `NotificationQueue`, shared connection cache with the
//! rest of the embedded backend.

use crate::error::Result;
use crate::NotificationQueue;
use async_trait::async_trait;
use rq_common::QueueKey;
use rq_storage::embedded::SqlitePoolCache;
use std::sync::Arc;

pub struct SqliteNotificationQueue {
    connection_string: String,
    pools: Arc<SqlitePoolCache>,
}

impl SqliteNotificationQueue {
    pub fn new(connection_string: impl Into<String>, pools: Arc<SqlitePoolCache>) -> Self {
        Self {
            connection_string: connection_string.into(),
            pools,
        }
    }

    async fn ensure_schema(&self, pool: &sqlx::Pool<sqlx::Sqlite>) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS notification_messages (
                id TEXT PRIMARY KEY,
                queue_key TEXT NOT NULL,
                payload BLOB NOT NULL,
                enqueued_utc INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await
        .map_err(|e| crate::SenderError::Backend {
            queue_key: String::new(),
            message: e.to_string(),
        })?;
        Ok(())
    }
}

#[async_trait]
impl NotificationQueue for SqliteNotificationQueue {
    async fn enqueue(&self, queue_key: &QueueKey, payload: Vec<u8>) -> Result<()> {
        let pool = self.pools.get(&self.connection_string).await.map_err(|e| crate::SenderError::Backend {
            queue_key: queue_key.name().to_string(),
            message: e.to_string(),
        })?;
        self.ensure_schema(&pool).await?;

        sqlx::query("INSERT INTO notification_messages (id, queue_key, payload, enqueued_utc) VALUES (?, ?, ?, ?)")
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(queue_key.safe())
            .bind(payload)
            .bind(chrono::Utc::now().timestamp())
            .execute(&*pool)
            .await
            .map_err(|e| crate::SenderError::Backend {
                queue_key: queue_key.name().to_string(),
                message: e.to_string(),
            })?;

        Ok(())
    }
}
