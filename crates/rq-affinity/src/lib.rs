//! Grants or denies processing rights for a (queue, topic) pair so that,
//! while a non-default topic is "hot," exactly one consumer process
//! handles it at a time.

pub mod error;

#[cfg(feature = "embedded")]
pub mod embedded;

#[cfg(feature = "azure")]
pub mod azure;

pub use error::{AffinityError, Result};

use async_trait::async_trait;
use chrono::Utc;
use rq_common::{QueueKey, Topic, TopicAffinity};
use std::time::Duration;
use tracing::debug;

/// The outcome of attempting to insert a brand-new affinity row.
pub enum InsertOutcome {
    Inserted(TopicAffinity),
    /// Another peer inserted first (409-equivalent).
    Conflict,
}

/// Storage-backend seam for the affinity row: embedded (SQLite) or Azure
/// Table, selected by Cargo feature.
#[async_trait]
pub trait AffinityBackend: Send + Sync {
    async fn get(&self, queue_key: &QueueKey, topic: &Topic) -> Result<Option<TopicAffinity>>;
    async fn try_insert(&self, affinity: TopicAffinity) -> Result<InsertOutcome>;
    /// Replace guarded by `expected_etag`; `Ok(false)` means the
    /// precondition failed (someone else renewed or inserted first).
    async fn replace(&self, affinity: &mut TopicAffinity, expected_etag: &str) -> Result<bool>;
}

/// Whether a peer may schedule in-order processing for this topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AffinityDecision {
    Accept,
    Reject,
}

pub struct TopicAffinityArbiter {
    backend: std::sync::Arc<dyn AffinityBackend>,
    ttl: Duration,
    process_identity: String,
}

impl TopicAffinityArbiter {
    pub fn new(backend: std::sync::Arc<dyn AffinityBackend>, ttl: Duration, process_identity: impl Into<String>) -> Self {
        Self {
            backend,
            ttl,
            process_identity: process_identity.into(),
        }
    }

    /// Evaluate whether this peer may process `topic` within `queue_key`.
    /// `queue_can_receive` reflects the local queue's configured mode.
    pub async fn evaluate(
        &self,
        queue_key: &QueueKey,
        topic: &Topic,
        queue_can_receive: bool,
    ) -> Result<AffinityDecision> {
        // Step 1: default topic bypasses affinity entirely.
        if topic.is_default() {
            return Ok(AffinityDecision::Accept);
        }

        // Step 2: a queue not configured to receive cannot hold affinity.
        if !queue_can_receive {
            return Err(AffinityError::InvalidState(queue_key.name().to_string()));
        }

        loop {
            match self.backend.get(queue_key, topic).await? {
                // Step 3: no row yet, attempt to claim it.
                None => {
                    let affinity = TopicAffinity::new(queue_key, topic, &self.process_identity);
                    match self.backend.try_insert(affinity).await? {
                        InsertOutcome::Inserted(_) => return Ok(AffinityDecision::Accept),
                        InsertOutcome::Conflict => {
                            debug!(queue = queue_key.name(), topic = topic.name(), "affinity insert lost race, retrying read");
                            continue;
                        }
                    }
                }
                Some(mut existing) => {
                    let age = Utc::now().signed_duration_since(existing.last_updated_utc);
                    let expired = age.num_seconds() as u64 > self.ttl.as_secs();

                    if expired {
                        // Step 4: expired grant, attempt takeover.
                        let expected_etag = existing.e_tag.clone();
                        existing.owner = self.process_identity.clone();
                        existing.last_updated_utc = Utc::now();
                        return Ok(if self.backend.replace(&mut existing, &expected_etag).await? {
                            AffinityDecision::Accept
                        } else {
                            AffinityDecision::Reject
                        });
                    }

                    if existing.owner == self.process_identity {
                        // Step 5: renew our own grant.
                        let expected_etag = existing.e_tag.clone();
                        existing.last_updated_utc = Utc::now();
                        return Ok(if self.backend.replace(&mut existing, &expected_etag).await? {
                            AffinityDecision::Accept
                        } else {
                            AffinityDecision::Reject
                        });
                    }

                    // Step 6: unexpired grant held by someone else.
                    return Ok(AffinityDecision::Reject);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct FakeBackend {
        rows: Mutex<std::collections::HashMap<String, TopicAffinity>>,
    }

    impl FakeBackend {
        fn new() -> Self {
            Self {
                rows: Mutex::new(std::collections::HashMap::new()),
            }
        }

        fn key(queue_key: &QueueKey, topic: &Topic) -> String {
            format!("{}/{}", queue_key.safe(), topic.id())
        }
    }

    #[async_trait]
    impl AffinityBackend for FakeBackend {
        async fn get(&self, queue_key: &QueueKey, topic: &Topic) -> Result<Option<TopicAffinity>> {
            Ok(self.rows.lock().unwrap().get(&Self::key(queue_key, topic)).cloned())
        }

        async fn try_insert(&self, mut affinity: TopicAffinity) -> Result<InsertOutcome> {
            let mut rows = self.rows.lock().unwrap();
            let key = format!("{}/{}", affinity.partition_key, affinity.row_key);
            if rows.contains_key(&key) {
                return Ok(InsertOutcome::Conflict);
            }
            affinity.e_tag = uuid::Uuid::new_v4().to_string();
            rows.insert(key, affinity.clone());
            Ok(InsertOutcome::Inserted(affinity))
        }

        async fn replace(&self, affinity: &mut TopicAffinity, expected_etag: &str) -> Result<bool> {
            let mut rows = self.rows.lock().unwrap();
            let key = format!("{}/{}", affinity.partition_key, affinity.row_key);
            match rows.get(&key) {
                Some(current) if current.e_tag == expected_etag => {
                    affinity.e_tag = uuid::Uuid::new_v4().to_string();
                    rows.insert(key, affinity.clone());
                    Ok(true)
                }
                _ => Ok(false),
            }
        }
    }

    #[tokio::test]
    async fn default_topic_always_accepts() {
        let arbiter = TopicAffinityArbiter::new(Arc::new(FakeBackend::new()), Duration::from_secs(60), "host-1");
        let qk = QueueKey::new("orders");
        let decision = arbiter.evaluate(&qk, &Topic::default_topic(), true).await.unwrap();
        assert_eq!(decision, AffinityDecision::Accept);
    }

    #[tokio::test]
    async fn rejects_when_not_configured_to_receive() {
        let arbiter = TopicAffinityArbiter::new(Arc::new(FakeBackend::new()), Duration::from_secs(60), "host-1");
        let qk = QueueKey::new("orders");
        let result = arbiter.evaluate(&qk, &Topic::new("ord"), false).await;
        assert!(matches!(result, Err(AffinityError::InvalidState(_))));
    }

    #[tokio::test]
    async fn first_claim_accepts_then_other_owner_is_rejected() {
        let backend = Arc::new(FakeBackend::new());
        let arbiter_a = TopicAffinityArbiter::new(backend.clone(), Duration::from_secs(60), "host-a");
        let arbiter_b = TopicAffinityArbiter::new(backend, Duration::from_secs(60), "host-b");
        let qk = QueueKey::new("orders");
        let topic = Topic::new("ord");

        assert_eq!(arbiter_a.evaluate(&qk, &topic, true).await.unwrap(), AffinityDecision::Accept);
        assert_eq!(arbiter_b.evaluate(&qk, &topic, true).await.unwrap(), AffinityDecision::Reject);
    }

    #[tokio::test]
    async fn same_owner_renews_grant() {
        let backend = Arc::new(FakeBackend::new());
        let arbiter = TopicAffinityArbiter::new(backend, Duration::from_secs(60), "host-a");
        let qk = QueueKey::new("orders");
        let topic = Topic::new("ord");

        assert_eq!(arbiter.evaluate(&qk, &topic, true).await.unwrap(), AffinityDecision::Accept);
        assert_eq!(arbiter.evaluate(&qk, &topic, true).await.unwrap(), AffinityDecision::Accept);
    }

    #[tokio::test]
    async fn expired_grant_is_taken_over() {
        let backend = Arc::new(FakeBackend::new());
        let arbiter_a = TopicAffinityArbiter::new(backend.clone(), Duration::from_millis(10), "host-a");
        let arbiter_b = TopicAffinityArbiter::new(backend, Duration::from_millis(10), "host-b");
        let qk = QueueKey::new("orders");
        let topic = Topic::new("ord");

        assert_eq!(arbiter_a.evaluate(&qk, &topic, true).await.unwrap(), AffinityDecision::Accept);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(arbiter_b.evaluate(&qk, &topic, true).await.unwrap(), AffinityDecision::Accept);
    }
}
