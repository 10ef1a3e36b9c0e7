//! Capability traits for the external collaborators the core consumes.
//!
//! Inner layers receive only the narrow capability they need — never a
//! handle back to the service that owns them — which keeps the dependency
//! graph acyclic.

use async_trait::async_trait;

/// Asks the user to approve a gated tool call. `false` means denied.
#[async_trait]
pub trait ConfirmationRequester: Send + Sync {
    async fn request_confirmation(&self, prompt: &str) -> bool;
}

/// Lets long-running work surface "still busy" signals to the transport
/// (typing indicators, progress notes).
#[async_trait]
pub trait ActivityUpdater: Send + Sync {
    async fn update_activity(&self, status: &str);
}

/// Outbound message delivery to whatever transport owns the conversation.
#[async_trait]
pub trait ChatInterface: Send + Sync {
    async fn send_message(
        &self,
        conversation_id: &str,
        text: &str,
    ) -> std::result::Result<(), String>;
}

/// Text → vector boundary. Real models live outside the core; tests use a
/// deterministic hash-based implementation.
#[async_trait]
pub trait EmbeddingGenerator: Send + Sync {
    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, String>;
    fn model_name(&self) -> &str;
}
