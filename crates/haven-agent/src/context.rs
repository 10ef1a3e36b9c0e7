//! Pluggable system-prompt context providers.

use async_trait::async_trait;
use tracing::warn;

use haven_storage::{notes, Db};
use haven_tools::ToolExecutionContext;

/// Contributes zero or more text fragments to the turn's system prompt.
#[async_trait]
pub trait ContextProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn fragments(&self, ctx: &ToolExecutionContext) -> Vec<String>;
}

/// A fixed fragment (deployment-specific standing instructions).
pub struct StaticContextProvider {
    text: String,
}

impl StaticContextProvider {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

#[async_trait]
impl ContextProvider for StaticContextProvider {
    fn name(&self) -> &str {
        "static"
    }

    async fn fragments(&self, _ctx: &ToolExecutionContext) -> Vec<String> {
        if self.text.is_empty() {
            Vec::new()
        } else {
            vec![self.text.clone()]
        }
    }
}

/// Injects the titles of notes visible under the conversation's grants, so
/// the model knows what it can look up.
pub struct NotesContextProvider {
    db: Db,
    max_titles: usize,
}

impl NotesContextProvider {
    pub fn new(db: Db) -> Self {
        Self { db, max_titles: 20 }
    }
}

#[async_trait]
impl ContextProvider for NotesContextProvider {
    fn name(&self) -> &str {
        "notes"
    }

    async fn fragments(&self, ctx: &ToolExecutionContext) -> Vec<String> {
        let all = match notes::get_all(&self.db, &ctx.visibility_grants) {
            Ok(all) => all,
            Err(e) => {
                warn!(error = %e, "notes context provider failed");
                return Vec::new();
            }
        };
        if all.is_empty() {
            return Vec::new();
        }
        let titles: Vec<&str> = all
            .iter()
            .take(self.max_titles)
            .map(|n| n.title.as_str())
            .collect();
        vec![format!("Stored notes available: {}.", titles.join(", "))]
    }
}

/// Current local time for the conversation's timezone.
pub struct ClockContextProvider;

#[async_trait]
impl ContextProvider for ClockContextProvider {
    fn name(&self) -> &str {
        "clock"
    }

    async fn fragments(&self, ctx: &ToolExecutionContext) -> Vec<String> {
        vec![format!("The current time is {}.", ctx.local_time_string())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn ctx(db: &Db, grants: &[&str]) -> ToolExecutionContext {
        let dir = std::env::temp_dir().join(format!("haven-ctxprov-{}", uuid::Uuid::new_v4()));
        let store = haven_attachments::BlobStore::new(&dir).unwrap();
        let registry =
            haven_attachments::AttachmentRegistry::new(db.clone(), store, "/attachments");
        ToolExecutionContext::new("api", "c1", db.clone(), registry).with_visibility_grants(
            grants.iter().map(|s| s.to_string()).collect::<HashSet<_>>(),
        )
    }

    #[tokio::test]
    async fn notes_fragments_respect_grants() {
        let db = Db::open_in_memory().unwrap();
        notes::upsert(&db, "Groceries", "milk", &[]).unwrap();
        notes::upsert(&db, "Secret plan", "…", &["adults".into()]).unwrap();

        let provider = NotesContextProvider::new(db.clone());

        let fragments = provider.fragments(&ctx(&db, &[])).await;
        assert_eq!(fragments.len(), 1);
        assert!(fragments[0].contains("Groceries"));
        assert!(!fragments[0].contains("Secret plan"));

        let fragments = provider.fragments(&ctx(&db, &["adults"])).await;
        assert!(fragments[0].contains("Secret plan"));
    }

    #[tokio::test]
    async fn static_provider_skips_empty_text() {
        let db = Db::open_in_memory().unwrap();
        assert!(StaticContextProvider::new("")
            .fragments(&ctx(&db, &[]))
            .await
            .is_empty());
        assert_eq!(
            StaticContextProvider::new("Be concise.")
                .fragments(&ctx(&db, &[]))
                .await,
            vec!["Be concise.".to_string()]
        );
    }
}
