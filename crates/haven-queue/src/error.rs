use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Storage error: {0}")]
    Storage(#[from] haven_storage::StorageError),

    #[error("Invalid recurrence rule: {0}")]
    Recurrence(String),

    #[error("No handler registered for task type: {0}")]
    NoHandler(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;
