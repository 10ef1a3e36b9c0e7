use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventsError {
    #[error("Storage error: {0}")]
    Storage(#[from] haven_storage::StorageError),

    #[error("Embedding generation failed: {0}")]
    Embedding(String),

    #[error("Content fetch failed ({url}): {detail}")]
    Fetch { url: String, detail: String },

    #[error("Document not found: {0}")]
    DocumentNotFound(i64),

    /// Webhook request rejected by the source's auth settings.
    #[error("Webhook authentication failed: {0}")]
    Unauthorized(String),

    #[error("Event channel closed")]
    ChannelClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EventsError>;
