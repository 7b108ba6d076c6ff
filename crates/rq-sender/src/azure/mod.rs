//! Azure Storage Queue-backed `NotificationQueue`.

use crate::error::{Result, SenderError};
use crate::NotificationQueue;
use async_trait::async_trait;
use rq_common::QueueKey;
use rq_storage::azure::AzureResourceBroker;
use std::sync::Arc;

pub struct AzureNotificationQueue {
    connection_string: String,
    broker: Arc<AzureResourceBroker>,
}

impl AzureNotificationQueue {
    pub fn new(connection_string: impl Into<String>, broker: Arc<AzureResourceBroker>) -> Self {
        Self {
            connection_string: connection_string.into(),
            broker,
        }
    }
}

#[async_trait]
impl NotificationQueue for AzureNotificationQueue {
    async fn enqueue(&self, queue_key: &QueueKey, payload: Vec<u8>) -> Result<()> {
        let queue = self
            .broker
            .notification_queue(&self.connection_string, queue_key)
            .await
            .map_err(|e| SenderError::Backend {
                queue_key: queue_key.name().to_string(),
                message: e.to_string(),
            })?;

        let body = String::from_utf8(payload).map_err(|e| SenderError::Backend {
            queue_key: queue_key.name().to_string(),
            message: e.to_string(),
        })?;

        queue
            .put_message(body)
            .into_future()
            .await
            .map_err(|e| SenderError::Backend {
                queue_key: queue_key.name().to_string(),
                message: e.to_string(),
            })?;

        Ok(())
    }
}
