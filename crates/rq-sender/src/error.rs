use thiserror::Error;

#[derive(Error, Debug)]
pub enum SenderError {
    #[error("notification send failed for queue {queue_key}: {message}")]
    Backend { queue_key: String, message: String },

    #[error("failed to serialize notification envelope: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SenderError>;

impl From<SenderError> for rq_storage::StorageError {
    fn from(e: SenderError) -> Self {
        match e {
            SenderError::Backend { queue_key, message } => rq_storage::StorageError::Backend { queue_key, message },
            SenderError::Serialization(err) => rq_storage::StorageError::Serialization(err),
        }
    }
}
