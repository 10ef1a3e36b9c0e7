use thiserror::Error;

#[derive(Debug, Error)]
pub enum AutomationError {
    #[error("Storage error: {0}")]
    Storage(#[from] haven_storage::StorageError),

    #[error("Queue error: {0}")]
    Queue(#[from] haven_queue::QueueError),

    #[error("Unknown event source: {0}")]
    UnknownSource(String),

    #[error("Invalid automation request: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, AutomationError>;
