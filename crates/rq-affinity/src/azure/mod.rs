//! Azure Table-backed `AffinityBackend`. PartitionKey is the queue's safe
//! name, RowKey is the topic id; the table SDK's `ETag` is the affinity
//! row's concurrency token.

use crate::{AffinityBackend, AffinityError, InsertOutcome, Result};
use async_trait::async_trait;
use azure_data_tables::operations::InsertEntityResponse;
use azure_data_tables::{IfMatchCondition, StatusCode};
use rq_common::{QueueKey, Topic, TopicAffinity};
use rq_storage::azure::AzureResourceBroker;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AffinityEntity {
    #[serde(rename = "PartitionKey")]
    partition_key: String,
    #[serde(rename = "RowKey")]
    row_key: String,
    owner: String,
    last_updated_utc: i64,
}

impl AffinityEntity {
    fn from_affinity(affinity: &TopicAffinity) -> Self {
        Self {
            partition_key: affinity.partition_key.clone(),
            row_key: affinity.row_key.clone(),
            owner: affinity.owner.clone(),
            last_updated_utc: affinity.last_updated_utc.timestamp(),
        }
    }

    fn into_affinity(self, etag: String) -> TopicAffinity {
        TopicAffinity {
            partition_key: self.partition_key,
            row_key: self.row_key,
            owner: self.owner,
            last_updated_utc: chrono::DateTime::from_timestamp(self.last_updated_utc, 0)
                .unwrap_or_else(chrono::Utc::now),
            e_tag: etag,
        }
    }
}

pub struct AzureAffinityBackend {
    connection_string: String,
    broker: Arc<AzureResourceBroker>,
}

impl AzureAffinityBackend {
    pub fn new(connection_string: impl Into<String>, broker: Arc<AzureResourceBroker>) -> Self {
        Self {
            connection_string: connection_string.into(),
            broker,
        }
    }
}

#[async_trait]
impl AffinityBackend for AzureAffinityBackend {
    async fn get(&self, queue_key: &QueueKey, topic: &Topic) -> Result<Option<TopicAffinity>> {
        let table = self.broker.topic_table(&self.connection_string, queue_key).await?;
        let entity_client = table.partition_key_client(queue_key.safe()).entity_client(topic.id());

        match entity_client.get::<AffinityEntity>().await {
            Ok(resp) => Ok(Some(resp.entity.into_affinity(resp.etag))),
            Err(e) if status_of(&e) == Some(StatusCode::NotFound) => Ok(None),
            Err(e) => Err(AffinityError::Backend {
                queue_key: queue_key.name().to_string(),
                topic: topic.name().to_string(),
                message: e.to_string(),
            }),
        }
    }

    async fn try_insert(&self, affinity: TopicAffinity) -> Result<InsertOutcome> {
        let queue_key = QueueKey::new(affinity.partition_key.as_str());
        let table = self.broker.topic_table(&self.connection_string, &queue_key).await?;
        let entity = AffinityEntity::from_affinity(&affinity);

        let result: std::result::Result<InsertEntityResponse<AffinityEntity>, azure_core::Error> = async {
            table.insert(&entity)?.await
        }
        .await;

        match result {
            Ok(resp) => {
                let mut inserted = affinity;
                inserted.e_tag = resp.etag;
                Ok(InsertOutcome::Inserted(inserted))
            }
            Err(e) if status_of(&e) == Some(StatusCode::Conflict) => Ok(InsertOutcome::Conflict),
            Err(e) => Err(AffinityError::Backend {
                queue_key: affinity.partition_key.clone(),
                topic: affinity.row_key.clone(),
                message: e.to_string(),
            }),
        }
    }

    async fn replace(&self, affinity: &mut TopicAffinity, expected_etag: &str) -> Result<bool> {
        let queue_key = QueueKey::new(affinity.partition_key.as_str());
        let table = self.broker.topic_table(&self.connection_string, &queue_key).await?;
        let entity_client = table
            .partition_key_client(&affinity.partition_key)
            .entity_client(&affinity.row_key);
        let entity = AffinityEntity::from_affinity(affinity);
        let condition = IfMatchCondition::Etag(expected_etag.to_string());

        let update = async { entity_client.update(&entity, condition)?.await }.await;

        match update {
            Ok(resp) => {
                affinity.e_tag = resp.etag;
                Ok(true)
            }
            Err(e) if status_of(&e) == Some(StatusCode::PreconditionFailed) => Ok(false),
            Err(e) => Err(AffinityError::Backend {
                queue_key: affinity.partition_key.clone(),
                topic: affinity.row_key.clone(),
                message: e.to_string(),
            }),
        }
    }
}

fn status_of(e: &azure_core::Error) -> Option<StatusCode> {
    match e.kind() {
        azure_core::error::ErrorKind::HttpResponse { status, .. } => Some(*status),
        _ => None,
    }
}
