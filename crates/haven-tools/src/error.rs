use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToolError {
    /// No provider in the chain knows this tool. The composite uses this
    /// variant to fall through to the next provider.
    #[error("Tool not found: {name}")]
    NotFound { name: String },

    #[error("Invalid arguments for {tool}: {detail}")]
    InvalidArguments { tool: String, detail: String },

    #[error("Tool {tool} failed: {detail}")]
    Execution { tool: String, detail: String },

    #[error("Remote tool server error ({server}): {detail}")]
    Remote { server: String, detail: String },

    #[error("Duplicate tool name: {name}")]
    Duplicate { name: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ToolError>;
