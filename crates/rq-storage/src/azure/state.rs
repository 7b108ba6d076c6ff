//! Azure Table-backed `StateStore`. PartitionKey is the topic identifier,
//! RowKey is the message id; the table SDK's `ETag` carries optimistic
//! concurrency, matching the eTag field on `Message`.

use crate::azure::broker::AzureResourceBroker;
use crate::body::BodyStore;
use crate::error::{Result, StorageError};
use crate::state::{NotificationResender, ProcessOutcome, StateStore, SubscriberInvoker};
use async_trait::async_trait;
use azure_data_tables::operations::InsertEntityResponse;
use azure_data_tables::{IfMatchCondition, StatusCode};
use chrono::Utc;
use rq_common::{Message, MessageState, QueueKey, Topic};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

/// Table row shape: PartitionKey/RowKey are handled by the SDK; `payload`
/// carries the full JSON-serialized `Message` so no column needs a manual
/// type mapping beyond what the comparator and `process()` inspect.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MessageEntity {
    #[serde(rename = "PartitionKey")]
    partition_key: String,
    #[serde(rename = "RowKey")]
    row_key: String,
    state: String,
    last_updated_utc: i64,
    payload: String,
}

impl MessageEntity {
    fn from_message(message: &Message) -> Result<Self> {
        Ok(Self {
            partition_key: message.partition_key.clone(),
            row_key: message.row_key.clone(),
            state: message.state.as_str().to_string(),
            last_updated_utc: message.last_updated_utc.timestamp(),
            payload: serde_json::to_string(message)?,
        })
    }

    fn into_message(self, etag: String, sequence: i64) -> Result<Message> {
        let mut message: Message = serde_json::from_str(&self.payload)?;
        message.e_tag = etag;
        message.sequence = sequence;
        Ok(message)
    }
}

pub struct AzureStateStore {
    connection_string: String,
    broker: Arc<AzureResourceBroker>,
    body_store: Arc<dyn BodyStore>,
    process_identity: String,
}

impl AzureStateStore {
    pub fn new(
        connection_string: impl Into<String>,
        broker: Arc<AzureResourceBroker>,
        body_store: Arc<dyn BodyStore>,
        process_identity: impl Into<String>,
    ) -> Self {
        Self {
            connection_string: connection_string.into(),
            broker,
            body_store,
            process_identity: process_identity.into(),
        }
    }

    async fn fetch_current(
        &self,
        table: &azure_data_tables::clients::TableClient,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Option<Message>> {
        let entity_client = table.partition_key_client(partition_key).entity_client(row_key);
        match entity_client.get::<MessageEntity>().await {
            Ok(resp) => Ok(Some(resp.entity.into_message(resp.etag, resp.timestamp.timestamp())?)),
            Err(e) if status_of(&e) == Some(StatusCode::NotFound) => Ok(None),
            Err(e) => Err(StorageError::Backend {
                queue_key: String::new(),
                message: e.to_string(),
            }),
        }
    }
}

#[async_trait]
impl StateStore for AzureStateStore {
    async fn add(&self, queue_key: &QueueKey, mut message: Message, _timeout: Duration) -> Result<Message> {
        let table = self.broker.state_table(&self.connection_string, queue_key).await?;

        if let Some(existing) = self
            .fetch_current(&table, &message.partition_key, &message.row_key)
            .await?
        {
            return Ok(existing);
        }

        let entity = MessageEntity::from_message(&message)?;
        let response: InsertEntityResponse<MessageEntity> = table
            .insert(&entity)
            .map_err(|e| StorageError::Backend {
                queue_key: queue_key.name().to_string(),
                message: e.to_string(),
            })?
            .await
            .map_err(|e| StorageError::Backend {
                queue_key: queue_key.name().to_string(),
                message: e.to_string(),
            })?;

        message.e_tag = response.etag;
        message.sequence = response.timestamp.timestamp();
        Ok(message)
    }

    async fn queue(&self, queue_key: &QueueKey, mut message: Message, _timeout: Duration) -> Result<Message> {
        let table = self.broker.state_table(&self.connection_string, queue_key).await?;
        message.state = MessageState::Queued;
        message.last_updated_utc = Utc::now();

        let entity_client = table
            .partition_key_client(&message.partition_key)
            .entity_client(&message.row_key);
        let entity = MessageEntity::from_message(&message)?;
        let condition = IfMatchCondition::Etag(message.e_tag.clone());

        let response = entity_client
            .update(&entity, condition)
            .map_err(|e| StorageError::Backend {
                queue_key: queue_key.name().to_string(),
                message: e.to_string(),
            })?
            .await;

        match response {
            Ok(resp) => {
                message.e_tag = resp.etag;
                Ok(message)
            }
            Err(e) if status_of(&e) == Some(StatusCode::PreconditionFailed) => Err(StorageError::Conflict {
                partition_key: message.partition_key.clone(),
                row_key: message.row_key.clone(),
            }),
            Err(e) => Err(StorageError::Backend {
                queue_key: queue_key.name().to_string(),
                message: e.to_string(),
            }),
        }
    }

    async fn get_queued_in_topic(
        &self,
        queue_key: &QueueKey,
        topic: &Topic,
        this_process_identity: &str,
        _timeout: Duration,
    ) -> Result<Vec<Message>> {
        let table = self.broker.state_table(&self.connection_string, queue_key).await?;
        let filter = format!("PartitionKey eq '{}' and state eq 'Queued'", topic.id());

        let mut messages = Vec::new();
        let mut stream = table.query::<MessageEntity>().filter(filter).into_stream();
        while let Some(page) = futures::StreamExt::next(&mut stream).await {
            let page = page.map_err(|e| StorageError::Backend {
                queue_key: queue_key.name().to_string(),
                message: e.to_string(),
            })?;
            for entity in page.entities {
                messages.push(entity.entity.into_message(entity.etag, entity.timestamp.timestamp())?);
            }
        }

        messages.sort_by(|a, b| a.cmp_order(b, this_process_identity));
        Ok(messages)
    }

    async fn get_live_topics(&self, queue_key: &QueueKey, _timeout: Duration) -> Result<Vec<Topic>> {
        let table = self.broker.state_table(&self.connection_string, queue_key).await?;
        let mut seen = std::collections::BTreeSet::new();
        let mut stream = table.query::<MessageEntity>().into_stream();
        while let Some(page) = futures::StreamExt::next(&mut stream).await {
            let page = page.map_err(|e| StorageError::Backend {
                queue_key: queue_key.name().to_string(),
                message: e.to_string(),
            })?;
            for entity in page.entities {
                seen.insert(entity.entity.partition_key);
            }
        }
        Ok(seen.into_iter().map(Topic::from_id).collect())
    }

    async fn process(
        &self,
        queue_key: &QueueKey,
        message: Message,
        invoker: &dyn SubscriberInvoker,
        sender: &dyn NotificationResender,
        timeout: Duration,
    ) -> Result<ProcessOutcome> {
        if !invoker.has_subscriber(queue_key) {
            return Ok(ProcessOutcome::Skipped);
        }

        let table = self.broker.state_table(&self.connection_string, queue_key).await?;

        let mut current = self
            .fetch_current(&table, &message.partition_key, &message.row_key)
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
                })
            }
        }

        let expected_etag = current.e_tag.clone();
        current.owner = self.process_identity.clone();
        current.last_updated_utc = Utc::now();
        current.attempts += 1;
        current.state = if current.attempts > current.max_attempts {
            MessageState::Failed
        } else {
            MessageState::Processing
        };

        let entity_client = table
            .partition_key_client(&current.partition_key)
            .entity_client(&current.row_key);
        let entity = MessageEntity::from_message(&current)?;
        let condition = IfMatchCondition::Etag(expected_etag);

        match entity_client.update(&entity, condition).map_err(|e| StorageError::Backend {
            queue_key: queue_key.name().to_string(),
            message: e.to_string(),
        })?.await {
            Ok(resp) => current.e_tag = resp.etag,
            Err(e) if status_of(&e) == Some(StatusCode::PreconditionFailed) => {
                return Ok(ProcessOutcome::Skipped)
            }
            Err(e) => {
                return Err(StorageError::Backend {
                    queue_key: queue_key.name().to_string(),
                    message: e.to_string(),
                })
            }
        }

        if current.state == MessageState::Failed {
            warn!(message_id = %current.id, attempts = current.attempts, "message exhausted retries, marked Failed");
            return Ok(ProcessOutcome::Failed);
        }

        let invoke_result = tokio::time::timeout(timeout, invoker.invoke(queue_key, &current)).await;
        let succeeded = match invoke_result {
            Ok(result) => result,
            Err(_) => {
                error!(message_id = %current.id, "subscriber callback timed out");
                false
            }
        };

        let mut after = self
            .fetch_current(&table, &current.partition_key, &current.row_key)
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
            let entity_client = table
                .partition_key_client(&after.partition_key)
                .entity_client(&after.row_key);
            entity_client
                .delete()
                .map_err(|e| StorageError::Backend {
                    queue_key: queue_key.name().to_string(),
                    message: e.to_string(),
                })?
                .await
                .map_err(|e| StorageError::Backend {
                    queue_key: queue_key.name().to_string(),
                    message: e.to_string(),
                })?;
            self.body_store.delete(queue_key, &after.id, timeout).await?;
            Ok(ProcessOutcome::Succeeded)
        } else {
            let expected = after.e_tag.clone();
            after.state = MessageState::Queued;
            after.owner = self.process_identity.clone();
            after.last_updated_utc = Utc::now();

            let entity_client = table
                .partition_key_client(&after.partition_key)
                .entity_client(&after.row_key);
            let entity = MessageEntity::from_message(&after)?;
            // A 404 on this replace (row already gone) is tolerated.
            let _ = entity_client
                .update(&entity, IfMatchCondition::Etag(expected))
                .map_err(|e| StorageError::Backend {
                    queue_key: queue_key.name().to_string(),
                    message: e.to_string(),
                })?
                .await;

            sender.resend(queue_key, &after).await?;
            Ok(ProcessOutcome::Failed)
        }
    }
}

fn status_of(e: &azure_core::Error) -> Option<StatusCode> {
    match e.kind() {
        azure_core::error::ErrorKind::HttpResponse { status, .. } => Some(*status),
        _ => None,
    }
}
