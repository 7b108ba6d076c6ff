//! SQLite connection pool cache keyed by connection string, so every
//! handle the broker hands out for the same connection string shares one
//! `Pool`.

use crate::broker::ConnectionCache;
use crate::error::{Result, StorageError};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Sqlite};
use std::sync::Arc;

pub struct SqlitePoolCache {
    cache: ConnectionCache<Pool<Sqlite>>,
}

impl SqlitePoolCache {
    pub fn new() -> Self {
        Self {
            cache: ConnectionCache::with_default_ttl(),
        }
    }

    pub async fn get(&self, connection_string: &str) -> Result<Arc<Pool<Sqlite>>> {
        let conn = connection_string.to_string();
        self.cache
            .get_or_insert_with(connection_string, move || async move {
                SqlitePoolOptions::new()
                    .max_connections(5)
                    .connect(&conn)
                    .await
                    .map_err(|e| StorageError::Backend {
                        queue_key: String::new(),
                        message: e.to_string(),
                    })
            })
            .await
    }
}

impl Default for SqlitePoolCache {
    fn default() -> Self {
        Self::new()
    }
}
