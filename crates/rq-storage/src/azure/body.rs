//! Azure Blob-backed `BodyStore`. Every operation acquires a short
//! exclusive lease before touching an existing blob; a missing blob skips
//! the lease per the contract (first-write needs none, reads/deletes are
//! no-ops).

use crate::azure::broker::AzureResourceBroker;
use crate::body::{lease_backoff_delay, outcome_for_length, BodyReadResult, BodyStore, BodyWriteOutcome, Deadline};
use crate::error::{Result, StorageError};
use async_trait::async_trait;
use azure_storage_blobs::prelude::BlobLeaseClient;
use rq_common::QueueKey;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const LEASE_DURATION_SECONDS: i32 = 60;

pub struct AzureBodyStore {
    connection_string: String,
    broker: Arc<AzureResourceBroker>,
}

impl AzureBodyStore {
    pub fn new(connection_string: impl Into<String>, broker: Arc<AzureResourceBroker>) -> Self {
        Self {
            connection_string: connection_string.into(),
            broker,
        }
    }

    async fn blob_exists(
        &self,
        container: &azure_storage_blobs::prelude::ContainerClient,
        message_id: &str,
    ) -> Result<bool> {
        let blob = container.blob_client(message_id);
        match blob.get_properties().await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(StorageError::Backend {
                queue_key: String::new(),
                message: e.to_string(),
            }),
        }
    }

    /// Retries lease acquisition with uniform 250-500ms back-off until the
    /// deadline expires.
    async fn acquire_lease(&self, lease_client: &BlobLeaseClient, deadline: &Deadline) -> Result<()> {
        loop {
            match lease_client.acquire(std::time::Duration::from_secs(LEASE_DURATION_SECONDS as u64)).await {
                Ok(_) => return Ok(()),
                Err(e) if is_conflict(&e) => {
                    if deadline.expired() {
                        return Err(StorageError::Timeout {
                            queue_key: String::new(),
                            elapsed_ms: deadline.remaining().as_millis() as u64,
                        });
                    }
                    tokio::time::sleep(lease_backoff_delay().await.min(deadline.remaining())).await;
                }
                Err(e) => {
                    return Err(StorageError::Backend {
                        queue_key: String::new(),
                        message: e.to_string(),
                    })
                }
            }
        }
    }
}

#[async_trait]
impl BodyStore for AzureBodyStore {
    async fn write(
        &self,
        queue_key: &QueueKey,
        message_id: &str,
        bytes: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<BodyWriteOutcome> {
        let container = self.broker.body_container(&self.connection_string, queue_key).await?;
        let blob = container.blob_client(message_id);
        let data = bytes.map(|b| b.to_vec()).unwrap_or_default();
        let len = data.len() as u64;

        if !self.blob_exists(&container, message_id).await? {
            blob.put_block_blob(data)
                .await
                .map_err(|e| StorageError::Backend {
                    queue_key: queue_key.name().to_string(),
                    message: e.to_string(),
                })?;
            debug!(message_id, len, "body first-write, no lease needed");
            return Ok(outcome_for_length(len));
        }

        let deadline = Deadline::new(timeout);
        let lease_client = blob.lease_client();
        self.acquire_lease(&lease_client, &deadline).await?;

        let result = blob
            .put_block_blob(data)
            .lease_id(lease_client.lease_id())
            .await
            .map_err(|e| StorageError::Backend {
                queue_key: queue_key.name().to_string(),
                message: e.to_string(),
            });

        if let Err(e) = lease_client.release().await {
            warn!(message_id, error = %e, "failed to release body lease after write");
        }
        result?;

        Ok(outcome_for_length(len))
    }

    async fn read(&self, queue_key: &QueueKey, message_id: &str, timeout: Duration) -> Result<BodyReadResult> {
        let container = self.broker.body_container(&self.connection_string, queue_key).await?;
        let blob = container.blob_client(message_id);

        if !self.blob_exists(&container, message_id).await? {
            return Ok(BodyReadResult::null());
        }

        let deadline = Deadline::new(timeout);
        let lease_client = blob.lease_client();
        self.acquire_lease(&lease_client, &deadline).await?;

        let result = blob
            .get_content()
            .await
            .map_err(|e| StorageError::Backend {
                queue_key: queue_key.name().to_string(),
                message: e.to_string(),
            });

        if let Err(e) = lease_client.release().await {
            warn!(message_id, error = %e, "failed to release body lease after read");
        }

        let bytes = result?;
        let size = bytes.len() as u64;
        Ok(BodyReadResult {
            bytes: Some(bytes),
            size: Some(size),
        })
    }

    async fn delete(&self, queue_key: &QueueKey, message_id: &str, timeout: Duration) -> Result<()> {
        let container = self.broker.body_container(&self.connection_string, queue_key).await?;
        let blob = container.blob_client(message_id);

        if !self.blob_exists(&container, message_id).await? {
            return Ok(());
        }

        let deadline = Deadline::new(timeout);
        let lease_client = blob.lease_client();
        self.acquire_lease(&lease_client, &deadline).await?;

        let result = blob
            .delete()
            .lease_id(lease_client.lease_id())
            .await
            .map_err(|e| StorageError::Backend {
                queue_key: queue_key.name().to_string(),
                message: e.to_string(),
            });

        result.map(|_| ())
    }
}

fn is_not_found(e: &azure_core::Error) -> bool {
    matches!(e.kind(), azure_core::error::ErrorKind::HttpResponse { status, .. } if status.as_u16() == 404)
}

fn is_conflict(e: &azure_core::Error) -> bool {
    matches!(e.kind(), azure_core::error::ErrorKind::HttpResponse { status, .. } if status.as_u16() == 409)
}
