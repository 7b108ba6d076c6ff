use rq_common::MessageState;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage backend error for queue {queue_key}: {message}")]
    Backend { queue_key: String, message: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("row not found: partition={partition_key} row={row_key}")]
    NotFound { partition_key: String, row_key: String },

    #[error("optimistic concurrency conflict on partition={partition_key} row={row_key}")]
    Conflict { partition_key: String, row_key: String },

    #[error("operation on queue {queue_key} timed out after {elapsed_ms} ms")]
    Timeout { queue_key: String, elapsed_ms: u64 },

    #[error("configuration error for queue {queue_key}: {message}")]
    Config { queue_key: String, message: String },

    #[error("message state error: expected {expected}, actual {actual}")]
    UnexpectedState {
        expected: MessageState,
        actual: MessageState,
    },
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[cfg(feature = "embedded")]
impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        StorageError::Backend {
            queue_key: String::new(),
            message: e.to_string(),
        }
    }
}
