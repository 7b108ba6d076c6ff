use thiserror::Error;

#[derive(Error, Debug)]
pub enum AffinityError {
    #[error("affinity store error for queue {queue_key}, topic {topic}: {message}")]
    Backend {
        queue_key: String,
        topic: String,
        message: String,
    },

    #[error("queue {0} is not configured to receive")]
    InvalidState(String),
}

pub type Result<T> = std::result::Result<T, AffinityError>;

impl From<rq_storage::StorageError> for AffinityError {
    fn from(e: rq_storage::StorageError) -> Self {
        AffinityError::Backend {
            queue_key: String::new(),
            topic: String::new(),
            message: e.to_string(),
        }
    }
}
