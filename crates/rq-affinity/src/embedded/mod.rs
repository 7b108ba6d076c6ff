//! SQLite-backed `AffinityBackend`, sharing the connection cache that
//! `rq-storage`'s embedded state/body stores use.

use crate::{AffinityBackend, AffinityError, InsertOutcome, Result};
use async_trait::async_trait;
use rq_common::{QueueKey, Topic, TopicAffinity};
use rq_storage::embedded::SqlitePoolCache;
use sqlx::Row;
use std::sync::Arc;

pub struct SqliteAffinityBackend {
    connection_string: String,
    pools: Arc<SqlitePoolCache>,
}

impl SqliteAffinityBackend {
    pub fn new(connection_string: impl Into<String>, pools: Arc<SqlitePoolCache>) -> Self {
        Self {
            connection_string: connection_string.into(),
            pools,
        }
    }

    async fn pool(&self) -> Result<Arc<sqlx::Pool<sqlx::Sqlite>>> {
        self.pools
            .get(&self.connection_string)
            .await
            .map_err(AffinityError::from)
    }

    async fn ensure_schema(&self, pool: &sqlx::Pool<sqlx::Sqlite>) -> Result<()> {
        // partition_key is the queue identifier, row_key the topic
        // identifier (see `TopicAffinity::new`); together they are unique.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS topic_affinity (
                partition_key TEXT NOT NULL,
                row_key TEXT NOT NULL,
                owner TEXT NOT NULL,
                last_updated_utc INTEGER NOT NULL,
                e_tag TEXT NOT NULL,
                PRIMARY KEY (partition_key, row_key)
            )
            "#,
        )
        .execute(pool)
        .await
        .map_err(|e| AffinityError::Backend {
            queue_key: String::new(),
            topic: String::new(),
            message: e.to_string(),
        })?;
        Ok(())
    }

    fn row_to_affinity(row: &sqlx::sqlite::SqliteRow) -> TopicAffinity {
        TopicAffinity {
            partition_key: row.get("partition_key"),
            row_key: row.get("row_key"),
            owner: row.get("owner"),
            last_updated_utc: chrono::DateTime::from_timestamp(row.get::<i64, _>("last_updated_utc"), 0)
                .unwrap_or_else(chrono::Utc::now),
            e_tag: row.get("e_tag"),
        }
    }
}

#[async_trait]
impl AffinityBackend for SqliteAffinityBackend {
    async fn get(&self, queue_key: &QueueKey, topic: &Topic) -> Result<Option<TopicAffinity>> {
        let pool = self.pool().await?;
        self.ensure_schema(&pool).await?;

        let row = sqlx::query(
            "SELECT partition_key, row_key, owner, last_updated_utc, e_tag FROM topic_affinity WHERE partition_key = ? AND row_key = ?",
        )
        .bind(queue_key.safe())
        .bind(topic.id())
        .fetch_optional(&*pool)
        .await
        .map_err(|e| AffinityError::Backend {
            queue_key: queue_key.name().to_string(),
            topic: topic.name().to_string(),
            message: e.to_string(),
        })?;

        Ok(row.as_ref().map(Self::row_to_affinity))
    }

    async fn try_insert(&self, mut affinity: TopicAffinity) -> Result<InsertOutcome> {
        let pool = self.pool().await?;
        self.ensure_schema(&pool).await?;
        affinity.e_tag = uuid::Uuid::new_v4().to_string();

        let result = sqlx::query(
            "INSERT OR IGNORE INTO topic_affinity (partition_key, row_key, owner, last_updated_utc, e_tag) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&affinity.partition_key)
        .bind(&affinity.row_key)
        .bind(&affinity.owner)
        .bind(affinity.last_updated_utc.timestamp())
        .bind(&affinity.e_tag)
        .execute(&*pool)
        .await
        .map_err(|e| AffinityError::Backend {
            queue_key: String::new(),
            topic: affinity.row_key.clone(),
            message: e.to_string(),
        })?;

        if result.rows_affected() == 0 {
            Ok(InsertOutcome::Conflict)
        } else {
            Ok(InsertOutcome::Inserted(affinity))
        }
    }

    async fn replace(&self, affinity: &mut TopicAffinity, expected_etag: &str) -> Result<bool> {
        let pool = self.pool().await?;
        self.ensure_schema(&pool).await?;
        let new_etag = uuid::Uuid::new_v4().to_string();

        let result = sqlx::query(
            "UPDATE topic_affinity SET owner = ?, last_updated_utc = ?, e_tag = ? WHERE partition_key = ? AND row_key = ? AND e_tag = ?",
        )
        .bind(&affinity.owner)
        .bind(affinity.last_updated_utc.timestamp())
        .bind(&new_etag)
        .bind(&affinity.partition_key)
        .bind(&affinity.row_key)
        .bind(expected_etag)
        .execute(&*pool)
        .await
        .map_err(|e| AffinityError::Backend {
            queue_key: String::new(),
            topic: affinity.row_key.clone(),
            message: e.to_string(),
        })?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }
        affinity.e_tag = new_etag;
        Ok(true)
    }
}
