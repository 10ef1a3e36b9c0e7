use async_trait::async_trait;
use serde_json::Value;

use crate::context::ToolExecutionContext;
use crate::error::Result;
use crate::types::{ToolDefinition, ToolOutput};

/// Common interface over every tool source the orchestrator can reach.
#[async_trait]
pub trait ToolsProvider: Send + Sync {
    /// All tool definitions this provider can execute.
    async fn list_definitions(&self) -> Result<Vec<ToolDefinition>>;

    /// Execute `name` with the LLM-supplied arguments.
    ///
    /// Returns [`crate::ToolError::NotFound`] when the name is unknown so
    /// the composite can try the next provider in its chain.
    async fn execute(
        &self,
        name: &str,
        args: &Value,
        ctx: &ToolExecutionContext,
    ) -> Result<ToolOutput>;

    /// Release transport resources. Default: nothing to release.
    async fn close(&self) {}
}
