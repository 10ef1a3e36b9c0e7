use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScriptError {
    /// Parse-time rejection, with the offending source position.
    #[error("Syntax error at line {line}, column {col}: {message}")]
    Syntax {
        line: usize,
        col: usize,
        message: String,
    },

    /// The wall-clock execution cap was hit.
    #[error("Script execution timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    /// Runtime failure: bad operand types, fail() calls, denied tools…
    #[error("Script execution failed: {0}")]
    Exec(String),
}

impl ScriptError {
    pub fn exec(message: impl Into<String>) -> Self {
        ScriptError::Exec(message.into())
    }
}

pub type Result<T> = std::result::Result<T, ScriptError>;
