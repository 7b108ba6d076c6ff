use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReceiverError {
    #[error("malformed notification payload: {0}")]
    Decode(String),

    #[error("queue {0} is not configured to receive")]
    ModeError(String),

    #[error(transparent)]
    Storage(#[from] rq_storage::StorageError),

    #[error(transparent)]
    Affinity(#[from] rq_affinity::AffinityError),

    #[error("listener backend error for queue {queue_key}: {message}")]
    Backend { queue_key: String, message: String },
}

pub type Result<T> = std::result::Result<T, ReceiverError>;
