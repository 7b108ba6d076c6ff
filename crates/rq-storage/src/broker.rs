//! Hands out typed handles (queue, table, blob container) for a queue key,
//! caching the underlying connection by connection string for a bounded TTL.

use crate::error::{Result, StorageError};
use dashmap::DashMap;
use rq_common::{naming, QueueKey};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(120);

/// The four storage-safe names derived from a queue key, plus its owning
/// connection string. Handles themselves are cheap to construct; the
/// backend-specific client living behind them is what gets cached.
#[derive(Debug, Clone)]
pub struct ResourceNames {
    pub body_container: String,
    pub notification_queue: String,
    pub state_table: String,
    pub topic_table: String,
}

impl ResourceNames {
    pub fn derive(queue_key: &QueueKey) -> Self {
        Self {
            body_container: naming::body_container(queue_key),
            notification_queue: naming::notification_queue(queue_key),
            state_table: naming::state_table(queue_key),
            topic_table: naming::topic_table(queue_key),
        }
    }
}

struct CacheEntry<T> {
    value: Arc<T>,
    created_at: Instant,
}

/// A TTL'd cache keyed by connection string, so repeated lookups for the
/// same backing store reuse one client instead of reconnecting. Generic
/// over the cached client type so embedded and Azure brokers share it.
pub struct ConnectionCache<T> {
    entries: DashMap<String, CacheEntry<T>>,
    ttl: Duration,
}

impl<T> ConnectionCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn with_default_ttl() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }

    /// Return the cached client for `key`, or build and insert a fresh one
    /// via `build` if absent or expired.
    pub async fn get_or_insert_with<F, Fut>(&self, key: &str, build: F) -> Result<Arc<T>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        if let Some(entry) = self.entries.get(key) {
            if entry.created_at.elapsed() < self.ttl {
                return Ok(entry.value.clone());
            }
        }

        debug!(cache_key_len = key.len(), "storage connection cache miss");
        let value = Arc::new(build().await?);
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value: value.clone(),
                created_at: Instant::now(),
            },
        );
        Ok(value)
    }
}

/// "Already exists" is tolerated everywhere create-if-absent is attempted;
/// anything else during the probe is a `StorageError::Config`.
pub fn map_create_error(queue_key: &str, context: &str, already_exists: bool, message: String) -> Result<()> {
    if already_exists {
        Ok(())
    } else {
        Err(StorageError::Config {
            queue_key: queue_key.to_string(),
            message: format!("{context}: {message}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reuses_cached_value_within_ttl() {
        let cache: ConnectionCache<u32> = ConnectionCache::new(Duration::from_secs(60));
        let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            cache
                .get_or_insert_with("conn-a", || async move {
                    calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Ok(42)
                })
                .await
                .unwrap();
        }

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rebuilds_after_ttl_expiry() {
        let cache: ConnectionCache<u32> = ConnectionCache::new(Duration::from_millis(10));
        cache
            .get_or_insert_with("conn-b", || async { Ok(1) })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let value = cache
            .get_or_insert_with("conn-b", || async { Ok(2) })
            .await
            .unwrap();
        assert_eq!(*value, 2);
    }

    #[test]
    fn resource_names_are_derived_bit_exact() {
        let qk = QueueKey::new("Orders");
        let names = ResourceNames::derive(&qk);
        assert_eq!(names.body_container, "reliable-queue-body-orders");
        assert_eq!(names.notification_queue, "reliable-queue-orders");
        assert_eq!(names.state_table, "ReliableQueueStateOrders");
        assert_eq!(names.topic_table, "ReliableQueueTopicOrders");
    }
}
