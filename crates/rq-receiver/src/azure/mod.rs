//! Azure Storage Queue-backed `PolledQueue`.

use crate::error::{ReceiverError, Result};
use crate::listener::{PolledMessage, PolledQueue};
use async_trait::async_trait;
use rq_common::QueueKey;
use rq_storage::azure::AzureResourceBroker;
use std::sync::Arc;

pub struct AzureNotificationListener {
    connection_string: String,
    broker: Arc<AzureResourceBroker>,
    queue_key: QueueKey,
}

impl AzureNotificationListener {
    pub fn new(connection_string: impl Into<String>, broker: Arc<AzureResourceBroker>, queue_key: QueueKey) -> Self {
        Self {
            connection_string: connection_string.into(),
            broker,
            queue_key,
        }
    }

    fn backend_error(&self, message: impl ToString) -> ReceiverError {
        ReceiverError::Backend {
            queue_key: self.queue_key.name().to_string(),
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl PolledQueue for AzureNotificationListener {
    async fn receive_messages(&self, max: u32) -> Result<Vec<PolledMessage>> {
        let queue = self
            .broker
            .notification_queue(&self.connection_string, &self.queue_key)
            .await
            .map_err(|e| self.backend_error(e))?;

        let response = queue
            .get_messages()
            .number_of_messages(max)
            .into_future()
            .await
            .map_err(|e| self.backend_error(e))?;

        Ok(response
            .messages
            .into_iter()
            .map(|m| PolledMessage {
                id: m.message_id.to_string(),
                pop_receipt: m.pop_receipt.to_string(),
                payload: m.message_text.into_bytes(),
            })
            .collect())
    }

    async fn delete(&self, id: &str, pop_receipt: &str) -> Result<()> {
        let queue = self
            .broker
            .notification_queue(&self.connection_string, &self.queue_key)
            .await
            .map_err(|e| self.backend_error(e))?;

        queue
            .pop_receipt_client(id, pop_receipt)
            .delete()
            .into_future()
            .await
            .map_err(|e| self.backend_error(e))?;

        Ok(())
    }
}
