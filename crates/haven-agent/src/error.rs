use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    /// Provider-side failures that are worth retrying (5xx, 429, network).
    #[error("LLM provider transient error: {0}")]
    Transient(String),

    /// Provider rejected the request; retrying the same input won't help.
    #[error("LLM provider request error: {0}")]
    Request(String),

    #[error("LLM response could not be parsed: {0}")]
    Parse(String),

    #[error("Storage error: {0}")]
    Storage(#[from] haven_storage::StorageError),

    #[error("Attachment error: {0}")]
    Attachment(#[from] haven_attachments::AttachmentError),

    #[error("Tool error: {0}")]
    Tool(#[from] haven_tools::ToolError),

    #[error("Turn cancelled")]
    Cancelled,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;
