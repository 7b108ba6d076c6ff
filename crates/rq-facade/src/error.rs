use thiserror::Error;

#[derive(Error, Debug)]
pub enum FacadeError {
    #[error("queue {0} is not configured")]
    UnknownQueue(String),

    #[error("operation not permitted by queue mode: {0}")]
    ModeError(String),

    #[error(transparent)]
    Storage(#[from] rq_storage::StorageError),

    #[error(transparent)]
    Affinity(#[from] rq_affinity::AffinityError),

    #[error(transparent)]
    Sender(#[from] rq_sender::SenderError),

    #[error(transparent)]
    Receiver(#[from] rq_receiver::ReceiverError),

    #[error("config error for queue {queue_key}: {message}")]
    Config { queue_key: String, message: String },
}

pub type Result<T> = std::result::Result<T, FacadeError>;
