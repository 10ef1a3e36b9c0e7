//! Ordered chain of tool providers.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::context::ToolExecutionContext;
use crate::error::{Result, ToolError};
use crate::provider::ToolsProvider;
use crate::types::{ToolDefinition, ToolOutput};

/// Tries providers in order. `NotFound` falls through to the next provider;
/// any other error aborts and propagates. Duplicate definitions keep the
/// first occurrence (later ones warn and are skipped).
pub struct CompositeToolsProvider {
    providers: Vec<Arc<dyn ToolsProvider>>,
}

impl CompositeToolsProvider {
    pub fn new(providers: Vec<Arc<dyn ToolsProvider>>) -> Self {
        Self { providers }
    }
}

#[async_trait]
impl ToolsProvider for CompositeToolsProvider {
    async fn list_definitions(&self) -> Result<Vec<ToolDefinition>> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for provider in &self.providers {
            for def in provider.list_definitions().await? {
                if seen.insert(def.name.clone()) {
                    out.push(def);
                } else {
                    warn!(tool = %def.name, "duplicate tool definition skipped");
                }
            }
        }
        Ok(out)
    }

    async fn execute(
        &self,
        name: &str,
        args: &Value,
        ctx: &ToolExecutionContext,
    ) -> Result<ToolOutput> {
        for provider in &self.providers {
            match provider.execute(name, args, ctx).await {
                Err(ToolError::NotFound { .. }) => continue,
                other => return other,
            }
        }
        Err(ToolError::NotFound {
            name: name.to_string(),
        })
    }

    async fn close(&self) {
        for provider in &self.providers {
            provider.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::{LocalToolsProvider, ToolHandler};
    use serde_json::json;

    fn ctx() -> ToolExecutionContext {
        let db = haven_storage::Db::open_in_memory().unwrap();
        let dir = std::env::temp_dir().join(format!("haven-composite-{}", uuid::Uuid::new_v4()));
        let store = haven_attachments::BlobStore::new(&dir).unwrap();
        let registry = haven_attachments::AttachmentRegistry::new(db.clone(), store, "/attachments");
        ToolExecutionContext::new("api", "c1", db, registry)
    }

    fn provider_with(name: &'static str, reply: &'static str) -> Arc<dyn ToolsProvider> {
        let mut p = LocalToolsProvider::new();
        let handler: ToolHandler =
            Box::new(move |_args, _ctx| Box::pin(async move { Ok(ToolOutput::text(reply)) }));
        p.register(
            ToolDefinition::new(name, "test tool", json!({"type": "object"})),
            handler,
        )
        .unwrap();
        Arc::new(p)
    }

    fn failing_provider(name: &'static str) -> Arc<dyn ToolsProvider> {
        let mut p = LocalToolsProvider::new();
        let handler: ToolHandler = Box::new(move |_args, _ctx| {
            Box::pin(async move {
                Err(ToolError::Execution {
                    tool: name.to_string(),
                    detail: "boom".into(),
                })
            })
        });
        p.register(
            ToolDefinition::new(name, "always fails", json!({"type": "object"})),
            handler,
        )
        .unwrap();
        Arc::new(p)
    }

    #[tokio::test]
    async fn falls_through_on_not_found_only() {
        let composite = CompositeToolsProvider::new(vec![
            provider_with("alpha", "from-first"),
            provider_with("beta", "from-second"),
        ]);

        let out = composite.execute("beta", &json!({}), &ctx()).await.unwrap();
        assert_eq!(out.text, "from-second");

        let err = composite.execute("gamma", &json!({}), &ctx()).await.unwrap_err();
        assert!(matches!(err, ToolError::NotFound { .. }));
    }

    #[tokio::test]
    async fn real_errors_abort_the_chain() {
        // `beta` exists in both providers; the first one's failure must
        // propagate, not fall through to the healthy copy.
        let composite = CompositeToolsProvider::new(vec![
            failing_provider("beta"),
            provider_with("beta", "never-reached"),
        ]);
        let err = composite.execute("beta", &json!({}), &ctx()).await.unwrap_err();
        assert!(matches!(err, ToolError::Execution { .. }));
    }

    #[tokio::test]
    async fn duplicate_definitions_first_wins() {
        let composite = CompositeToolsProvider::new(vec![
            provider_with("echo", "one"),
            provider_with("echo", "two"),
        ]);
        let defs = composite.list_definitions().await.unwrap();
        assert_eq!(defs.len(), 1);

        let out = composite.execute("echo", &json!({}), &ctx()).await.unwrap();
        assert_eq!(out.text, "one");
    }
}
