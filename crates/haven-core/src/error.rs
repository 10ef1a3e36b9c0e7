use thiserror::Error;

#[derive(Debug, Error)]
pub enum HavenError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid recurrence rule: {0}")]
    Recurrence(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown timezone: {0}")]
    Timezone(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, HavenError>;
