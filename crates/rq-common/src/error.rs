//! Error taxonomy shared by every crate in the workspace.
//!
//! A single enum serves as both the umbrella and the per-crate error type:
//! every failure mode in the system reduces to one of these seven kinds.

use crate::model::MessageState;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReliableQueueError {
    #[error("config error for queue {queue_key}: {message}")]
    Config {
        queue_key: String,
        message: String,
    },

    #[error("queue {0} is not configured")]
    UnknownQueue(String),

    #[error("operation not permitted by queue mode: {0}")]
    Mode(String),

    #[error("message error (queue={queue_key}, message={message_id:?}): {message}")]
    Message {
        queue_key: String,
        message_id: Option<String>,
        message: String,
    },

    #[error("message state error: expected {expected}, actual {actual}")]
    MessageState {
        expected: MessageState,
        actual: MessageState,
    },

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, ReliableQueueError>;

impl ReliableQueueError {
    pub fn config(queue_key: impl Into<String>, message: impl Into<String>) -> Self {
        ReliableQueueError::Config {
            queue_key: queue_key.into(),
            message: message.into(),
        }
    }

    pub fn message(
        queue_key: impl Into<String>,
        message_id: Option<String>,
        message: impl Into<String>,
    ) -> Self {
        ReliableQueueError::Message {
            queue_key: queue_key.into(),
            message_id,
            message: message.into(),
        }
    }

    pub fn message_state(expected: MessageState, actual: MessageState) -> Self {
        ReliableQueueError::MessageState { expected, actual }
    }
}
