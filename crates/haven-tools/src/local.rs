//! Local tool registry.
//!
//! Tools are registered explicitly at startup as adapter closures
//! `(args, ctx) → ToolOutput`; argument schemas are declared alongside,
//! never reflected.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, warn};

use crate::context::ToolExecutionContext;
use crate::error::{Result, ToolError};
use crate::provider::ToolsProvider;
use crate::types::{ToolDefinition, ToolOutput};

/// Adapter closure signature every local tool is registered with.
pub type ToolHandler = Box<
    dyn for<'a> Fn(&'a Value, &'a ToolExecutionContext) -> BoxFuture<'a, Result<ToolOutput>>
        + Send
        + Sync,
>;

struct RegisteredTool {
    definition: ToolDefinition,
    handler: ToolHandler,
}

/// Name → handler registry. Ordered map keeps `list_definitions` stable.
#[derive(Default)]
pub struct LocalToolsProvider {
    tools: BTreeMap<String, RegisteredTool>,
}

impl LocalToolsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Duplicate names are a programmer error and rejected.
    pub fn register(&mut self, definition: ToolDefinition, handler: ToolHandler) -> Result<()> {
        let name = definition.name.clone();
        if self.tools.contains_key(&name) {
            return Err(ToolError::Duplicate { name });
        }
        debug!(tool = %name, "local tool registered");
        self.tools.insert(name, RegisteredTool { definition, handler });
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }
}

#[async_trait]
impl ToolsProvider for LocalToolsProvider {
    async fn list_definitions(&self) -> Result<Vec<ToolDefinition>> {
        Ok(self.tools.values().map(|t| t.definition.clone()).collect())
    }

    async fn execute(
        &self,
        name: &str,
        args: &Value,
        ctx: &ToolExecutionContext,
    ) -> Result<ToolOutput> {
        let Some(tool) = self.tools.get(name) else {
            return Err(ToolError::NotFound {
                name: name.to_string(),
            });
        };
        debug!(tool = %name, conversation = %ctx.conversation_id, "executing local tool");
        let result = (tool.handler)(args, ctx).await;
        if let Err(e) = &result {
            warn!(tool = %name, error = %e, "local tool failed");
        }
        result
    }
}

/// Helper for pulling a required string argument out of the LLM-supplied
/// args object with a consistent error shape.
pub fn require_str<'a>(tool: &str, args: &'a Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::InvalidArguments {
            tool: tool.to_string(),
            detail: format!("missing required string argument '{key}'"),
        })
}

/// Optional string argument.
pub fn optional_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> ToolExecutionContext {
        let db = haven_storage::Db::open_in_memory().unwrap();
        let dir = std::env::temp_dir().join(format!("haven-tools-test-{}", uuid::Uuid::new_v4()));
        let store = haven_attachments::BlobStore::new(&dir).unwrap();
        let registry = haven_attachments::AttachmentRegistry::new(db.clone(), store, "/attachments");
        ToolExecutionContext::new("api", "c1", db, registry)
    }

    fn echo_tool() -> (ToolDefinition, ToolHandler) {
        let def = ToolDefinition::new(
            "echo",
            "Echo the input text",
            json!({"type": "object", "properties": {"text": {"type": "string"}}, "required": ["text"]}),
        );
        let handler: ToolHandler = Box::new(|args, _ctx| {
            Box::pin(async move {
                let text = require_str("echo", args, "text")?;
                Ok(ToolOutput::text(text.to_string()))
            })
        });
        (def, handler)
    }

    #[tokio::test]
    async fn register_and_execute() {
        let mut provider = LocalToolsProvider::new();
        let (def, handler) = echo_tool();
        provider.register(def, handler).unwrap();

        let defs = provider.list_definitions().await.unwrap();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "echo");

        let out = provider
            .execute("echo", &json!({"text": "hi"}), &ctx())
            .await
            .unwrap();
        assert_eq!(out.text, "hi");
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let provider = LocalToolsProvider::new();
        let err = provider.execute("nope", &json!({}), &ctx()).await.unwrap_err();
        assert!(matches!(err, ToolError::NotFound { .. }));
    }

    #[tokio::test]
    async fn duplicate_registration_rejected() {
        let mut provider = LocalToolsProvider::new();
        let (def, handler) = echo_tool();
        provider.register(def, handler).unwrap();
        let (def, handler) = echo_tool();
        assert!(matches!(
            provider.register(def, handler),
            Err(ToolError::Duplicate { .. })
        ));
    }

    #[tokio::test]
    async fn bad_args_surface_as_invalid_arguments() {
        let mut provider = LocalToolsProvider::new();
        let (def, handler) = echo_tool();
        provider.register(def, handler).unwrap();
        let err = provider.execute("echo", &json!({}), &ctx()).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments { .. }));
    }
}
