//! SQLite-backed `BodyStore` for local development and tests. Simulates the
//! blob lease protocol with a lease-owner/lease-expiry column pair guarded
//! by compare-and-swap updates, since SQLite has no native lease primitive.

use crate::body::{lease_backoff_delay, outcome_for_length, BodyReadResult, BodyStore, BodyWriteOutcome, Deadline};
use crate::error::{Result, StorageError};
use crate::embedded::pool::SqlitePoolCache;
use async_trait::async_trait;
use chrono::Utc;
use rq_common::QueueKey;
use sqlx::Row;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const LEASE_SECONDS: i64 = 60;

pub struct SqliteBodyStore {
    connection_string: String,
    pools: Arc<SqlitePoolCache>,
    lease_identity: String,
}

impl SqliteBodyStore {
    pub fn new(connection_string: impl Into<String>, pools: Arc<SqlitePoolCache>, lease_identity: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            pools,
            lease_identity: lease_identity.into(),
        }
    }

    async fn pool(&self) -> Result<Arc<sqlx::Pool<sqlx::Sqlite>>> {
        self.pools.get(&self.connection_string).await
    }

    async fn ensure_schema(&self, pool: &sqlx::Pool<sqlx::Sqlite>) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS message_bodies (
                queue_key TEXT NOT NULL,
                message_id TEXT NOT NULL,
                body BLOB,
                size INTEGER,
                lease_owner TEXT,
                lease_expires_at INTEGER,
                PRIMARY KEY (queue_key, message_id)
            )
            "#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    async fn row_exists(&self, pool: &sqlx::Pool<sqlx::Sqlite>, queue_key: &str, message_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM message_bodies WHERE queue_key = ? AND message_id = ?")
            .bind(queue_key)
            .bind(message_id)
            .fetch_optional(pool)
            .await?;
        Ok(row.is_some())
    }

    /// Compare-and-swap lease acquisition, retried with uniform 250-500ms
    /// back-off until `deadline` expires.
    async fn acquire_lease(
        &self,
        pool: &sqlx::Pool<sqlx::Sqlite>,
        queue_key: &str,
        message_id: &str,
        deadline: &Deadline,
    ) -> Result<()> {
        loop {
            let now = Utc::now().timestamp();
            let expires_at = now + LEASE_SECONDS;
            let updated = sqlx::query(
                r#"
                UPDATE message_bodies
                SET lease_owner = ?, lease_expires_at = ?
                WHERE queue_key = ? AND message_id = ?
                  AND (lease_owner IS NULL OR lease_expires_at < ?)
                "#,
            )
            .bind(&self.lease_identity)
            .bind(expires_at)
            .bind(queue_key)
            .bind(message_id)
            .bind(now)
            .execute(pool)
            .await?;

            if updated.rows_affected() > 0 {
                return Ok(());
            }

            if deadline.expired() {
                return Err(StorageError::Timeout {
                    queue_key: queue_key.to_string(),
                    elapsed_ms: deadline.remaining().as_millis() as u64,
                });
            }

            tokio::time::sleep(lease_backoff_delay().await.min(deadline.remaining())).await;
        }
    }

    async fn release_lease(&self, pool: &sqlx::Pool<sqlx::Sqlite>, queue_key: &str, message_id: &str) {
        let result = sqlx::query(
            "UPDATE message_bodies SET lease_owner = NULL, lease_expires_at = NULL WHERE queue_key = ? AND message_id = ? AND lease_owner = ?",
        )
        .bind(queue_key)
        .bind(message_id)
        .bind(&self.lease_identity)
        .execute(pool)
        .await;

        if let Err(e) = result {
            warn!(queue_key, message_id, error = %e, "failed to release body lease");
        }
    }
}

#[async_trait]
impl BodyStore for SqliteBodyStore {
    async fn write(
        &self,
        queue_key: &QueueKey,
        message_id: &str,
        bytes: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<BodyWriteOutcome> {
        let pool = self.pool().await?;
        self.ensure_schema(&pool).await?;
        let qk = queue_key.safe();

        let exists = self.row_exists(&pool, qk, message_id).await?;
        let len = bytes.map(|b| b.len() as u64).unwrap_or(0);

        if !exists {
            sqlx::query(
                "INSERT INTO message_bodies (queue_key, message_id, body, size) VALUES (?, ?, ?, ?)",
            )
            .bind(qk)
            .bind(message_id)
            .bind(bytes.filter(|_| len > 0))
            .bind(if len > 0 { Some(len as i64) } else { None })
            .execute(&*pool)
            .await?;
            debug!(queue_key = qk, message_id, len, "body first-write, no lease needed");
            return Ok(outcome_for_length(len));
        }

        let deadline = Deadline::new(timeout);
        self.acquire_lease(&pool, qk, message_id, &deadline).await?;

        let result = sqlx::query("UPDATE message_bodies SET body = ?, size = ? WHERE queue_key = ? AND message_id = ?")
            .bind(bytes.filter(|_| len > 0))
            .bind(if len > 0 { Some(len as i64) } else { None })
            .bind(qk)
            .bind(message_id)
            .execute(&*pool)
            .await;

        self.release_lease(&pool, qk, message_id).await;
        result?;

        Ok(outcome_for_length(len))
    }

    async fn read(&self, queue_key: &QueueKey, message_id: &str, timeout: Duration) -> Result<BodyReadResult> {
        let pool = self.pool().await?;
        self.ensure_schema(&pool).await?;
        let qk = queue_key.safe();

        if !self.row_exists(&pool, qk, message_id).await? {
            return Ok(BodyReadResult::null());
        }

        let deadline = Deadline::new(timeout);
        self.acquire_lease(&pool, qk, message_id, &deadline).await?;

        let row = sqlx::query("SELECT body, size FROM message_bodies WHERE queue_key = ? AND message_id = ?")
            .bind(qk)
            .bind(message_id)
            .fetch_optional(&*pool)
            .await;

        self.release_lease(&pool, qk, message_id).await;

        let Some(row) = row? else {
            return Ok(BodyReadResult::null());
        };

        let body: Option<Vec<u8>> = row.get("body");
        let size: Option<i64> = row.get("size");
        Ok(BodyReadResult {
            bytes: body,
            size: size.map(|s| s as u64),
        })
    }

    async fn delete(&self, queue_key: &QueueKey, message_id: &str, timeout: Duration) -> Result<()> {
        let pool = self.pool().await?;
        self.ensure_schema(&pool).await?;
        let qk = queue_key.safe();

        if !self.row_exists(&pool, qk, message_id).await? {
            return Ok(());
        }

        let deadline = Deadline::new(timeout);
        self.acquire_lease(&pool, qk, message_id, &deadline).await?;

        let result = sqlx::query("DELETE FROM message_bodies WHERE queue_key = ? AND message_id = ?")
            .bind(qk)
            .bind(message_id)
            .execute(&*pool)
            .await;

        result?;
        Ok(())
    }
}
