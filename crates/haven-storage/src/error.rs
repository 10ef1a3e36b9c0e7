use thiserror::Error;

/// Errors that can occur within the storage subsystem.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A row contained data the mapper could not interpret.
    #[error("Corrupt row in {table}: {detail}")]
    CorruptRow { table: String, detail: String },

    /// Unique-name constraint across automation variants.
    #[error("An automation named '{name}' already exists in this conversation ({kind})")]
    NameTaken { name: String, kind: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid recurrence rule: {0}")]
    Recurrence(String),
}

impl From<haven_core::HavenError> for StorageError {
    fn from(e: haven_core::HavenError) -> Self {
        match e {
            haven_core::HavenError::Recurrence(msg) => StorageError::Recurrence(msg),
            other => StorageError::CorruptRow {
                table: "-".into(),
                detail: other.to_string(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
