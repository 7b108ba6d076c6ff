//! Hands out Azure Table/Blob/Queue clients for a queue key, caching the
//! connection by connection string and creating the backing resources on
//! first use ("already exists" is tolerated).

use crate::broker::{ConnectionCache, ResourceNames};
use crate::error::{Result, StorageError};
use azure_data_tables::clients::TableServiceClient;
use azure_storage::CloudLocation;
use azure_storage_blobs::prelude::{BlobServiceClient, ContainerClient};
use azure_storage_queues::QueueServiceClient;
use rq_common::QueueKey;
use std::sync::Arc;
use tracing::debug;

struct AzureClients {
    table_service: TableServiceClient,
    blob_service: BlobServiceClient,
    queue_service: QueueServiceClient,
}

pub struct AzureResourceBroker {
    cache: ConnectionCache<AzureClients>,
}

impl AzureResourceBroker {
    pub fn new() -> Self {
        Self {
            cache: ConnectionCache::with_default_ttl(),
        }
    }

    async fn clients_for(&self, connection_string: &str) -> Result<Arc<AzureClients>> {
        let conn = connection_string.to_string();
        self.cache
            .get_or_insert_with(connection_string, move || async move {
                let table_service = TableServiceClient::from_connection_string(&conn).map_err(|e| {
                    StorageError::Config {
                        queue_key: String::new(),
                        message: format!("table client: {e}"),
                    }
                })?;
                let blob_service = BlobServiceClient::builder(CloudLocation::from_connection_string(&conn).map_err(|e| {
                    StorageError::Config {
                        queue_key: String::new(),
                        message: format!("blob location: {e}"),
                    }
                })?)
                .build();
                let queue_service = QueueServiceClient::from_connection_string(&conn).map_err(|e| {
                    StorageError::Config {
                        queue_key: String::new(),
                        message: format!("queue client: {e}"),
                    }
                })?;

                Ok(AzureClients {
                    table_service,
                    blob_service,
                    queue_service,
                })
            })
            .await
    }

    /// Table client for the message-state table, creating it if absent.
    pub async fn state_table(&self, connection_string: &str, queue_key: &QueueKey) -> Result<azure_data_tables::clients::TableClient> {
        let names = ResourceNames::derive(queue_key);
        let clients = self.clients_for(connection_string).await?;
        let table = clients.table_service.table_client(&names.state_table);
        match table.create().await {
            Ok(_) => {}
            Err(e) if is_already_exists(&e) => {
                debug!(table = %names.state_table, "table already exists");
            }
            Err(e) => {
                return Err(StorageError::Config {
                    queue_key: queue_key.name().to_string(),
                    message: e.to_string(),
                })
            }
        }
        Ok(table)
    }

    /// Table client for the topic-affinity table, creating it if absent.
    pub async fn topic_table(&self, connection_string: &str, queue_key: &QueueKey) -> Result<azure_data_tables::clients::TableClient> {
        let names = ResourceNames::derive(queue_key);
        let clients = self.clients_for(connection_string).await?;
        let table = clients.table_service.table_client(&names.topic_table);
        match table.create().await {
            Ok(_) => {}
            Err(e) if is_already_exists(&e) => {}
            Err(e) => {
                return Err(StorageError::Config {
                    queue_key: queue_key.name().to_string(),
                    message: e.to_string(),
                })
            }
        }
        Ok(table)
    }

    /// Blob container client for message bodies, creating it if absent.
    pub async fn body_container(&self, connection_string: &str, queue_key: &QueueKey) -> Result<ContainerClient> {
        let names = ResourceNames::derive(queue_key);
        let clients = self.clients_for(connection_string).await?;
        let container = clients.blob_service.container_client(&names.body_container);
        match container.create().await {
            Ok(_) => {}
            Err(e) if is_already_exists(&e) => {}
            Err(e) => {
                return Err(StorageError::Config {
                    queue_key: queue_key.name().to_string(),
                    message: e.to_string(),
                })
            }
        }
        Ok(container)
    }

    /// Storage queue client for notifications, creating it if absent.
    pub async fn notification_queue(
        &self,
        connection_string: &str,
        queue_key: &QueueKey,
    ) -> Result<azure_storage_queues::QueueClient> {
        let names = ResourceNames::derive(queue_key);
        let clients = self.clients_for(connection_string).await?;
        let queue = clients.queue_service.queue_client(&names.notification_queue);
        match queue.create().into_future().await {
            Ok(_) => {}
            Err(e) if is_already_exists(&e) => {}
            Err(e) => {
                return Err(StorageError::Config {
                    queue_key: queue_key.name().to_string(),
                    message: e.to_string(),
                })
            }
        }
        Ok(queue)
    }
}

impl Default for AzureResourceBroker {
    fn default() -> Self {
        Self::new()
    }
}

fn is_already_exists(e: &azure_core::Error) -> bool {
    matches!(e.kind(), azure_core::error::ErrorKind::HttpResponse { status, .. } if status.as_u16() == 409)
}
