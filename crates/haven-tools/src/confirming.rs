//! Confirmation decorator — user-gated tools.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use crate::context::ToolExecutionContext;
use crate::error::Result;
use crate::provider::ToolsProvider;
use crate::types::{ToolDefinition, ToolOutput};

/// Pure function from tool args to the human-readable confirmation prompt.
pub type PromptRenderer = fn(&Value) -> String;

/// Wraps another provider and requires a positive user confirmation before
/// executing any gated tool. A `false` answer or a timeout short-circuits
/// with a cancellation value; the inner tool is never called.
pub struct ConfirmingToolsProvider {
    inner: Arc<dyn ToolsProvider>,
    gated: HashSet<String>,
    renderers: HashMap<String, PromptRenderer>,
    timeout: Duration,
}

impl ConfirmingToolsProvider {
    pub fn new(inner: Arc<dyn ToolsProvider>, gated: HashSet<String>, timeout: Duration) -> Self {
        Self {
            inner,
            gated,
            renderers: HashMap::new(),
            timeout,
        }
    }

    /// Install a per-tool prompt renderer. Tools without one get a generic
    /// prompt naming the tool and its arguments.
    pub fn with_renderer(mut self, tool: &str, renderer: PromptRenderer) -> Self {
        self.renderers.insert(tool.to_string(), renderer);
        self
    }

    fn render_prompt(&self, name: &str, args: &Value) -> String {
        match self.renderers.get(name) {
            Some(render) => render(args),
            None => format!(
                "Allow the assistant to run '{name}' with arguments {args}?"
            ),
        }
    }
}

#[async_trait]
impl ToolsProvider for ConfirmingToolsProvider {
    async fn list_definitions(&self) -> Result<Vec<ToolDefinition>> {
        self.inner.list_definitions().await
    }

    async fn execute(
        &self,
        name: &str,
        args: &Value,
        ctx: &ToolExecutionContext,
    ) -> Result<ToolOutput> {
        if self.gated.contains(name) {
            if let Some(requester) = &ctx.confirmation {
                let prompt = self.render_prompt(name, args);
                info!(tool = %name, "requesting user confirmation");

                let approved = tokio::time::timeout(
                    self.timeout,
                    requester.request_confirmation(&prompt),
                )
                .await
                .unwrap_or_else(|_| {
                    warn!(tool = %name, "confirmation timed out — treating as denied");
                    false
                });

                if !approved {
                    warn!(tool = %name, "tool execution denied by user");
                    return Ok(ToolOutput::cancelled(name));
                }
            }
            // No confirmation channel on this transport: the tool runs
            // ungated rather than becoming unusable.
        }
        self.inner.execute(name, args, ctx).await
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}
