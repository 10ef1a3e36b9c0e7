use thiserror::Error;

#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("Storage error: {0}")]
    Storage(#[from] haven_storage::StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Attachment not found: {0}")]
    NotFound(String),

    #[error("Invalid attachment id: {0}")]
    InvalidId(String),
}

pub type Result<T> = std::result::Result<T, AttachmentError>;
