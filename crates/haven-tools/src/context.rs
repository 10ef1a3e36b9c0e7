use std::collections::HashSet;
use std::sync::Arc;

use chrono_tz::Tz;

use haven_attachments::AttachmentRegistry;
use haven_core::boundary::{
    ActivityUpdater, ChatInterface, ConfirmationRequester, EmbeddingGenerator,
};
use haven_core::clock::{Clock, SystemClock};
use haven_storage::Db;

/// The record handed to every tool and script execution.
///
/// Immutable data plus capability trait objects; no back-edges into the
/// services that constructed it. Cloning is cheap — everything heavy is
/// behind an `Arc`.
#[derive(Clone)]
pub struct ToolExecutionContext {
    pub interface_type: String,
    pub conversation_id: String,
    pub user_name: String,
    pub user_id: String,
    pub turn_id: Option<String>,
    pub db: Db,
    pub attachments: AttachmentRegistry,
    pub timezone: Tz,
    pub processing_profile_id: Option<String>,
    pub clock: Arc<dyn Clock>,
    pub confirmation: Option<Arc<dyn ConfirmationRequester>>,
    pub activity: Option<Arc<dyn ActivityUpdater>>,
    pub chat: Option<Arc<dyn ChatInterface>>,
    pub embedding_generator: Option<Arc<dyn EmbeddingGenerator>>,
    /// Set when a script sandbox needs to call back into the tool surface.
    /// Late-bound because the composite provider is built after the context
    /// type exists, never because of a service back-edge.
    pub tools_provider: Option<Arc<dyn crate::provider::ToolsProvider>>,
    /// Visibility labels granted to this conversation's tool surface.
    pub visibility_grants: HashSet<String>,
    /// Labels stamped onto notes created without explicit labels.
    pub default_note_visibility_labels: Vec<String>,
}

impl ToolExecutionContext {
    /// Minimal context for one conversation; callers attach capabilities
    /// with the `with_*` builders.
    pub fn new(
        interface_type: &str,
        conversation_id: &str,
        db: Db,
        attachments: AttachmentRegistry,
    ) -> Self {
        Self {
            interface_type: interface_type.to_string(),
            conversation_id: conversation_id.to_string(),
            user_name: "user".to_string(),
            user_id: "api_user".to_string(),
            turn_id: None,
            db,
            attachments,
            timezone: chrono_tz::UTC,
            processing_profile_id: None,
            clock: Arc::new(SystemClock),
            confirmation: None,
            activity: None,
            chat: None,
            embedding_generator: None,
            tools_provider: None,
            visibility_grants: HashSet::new(),
            default_note_visibility_labels: Vec::new(),
        }
    }

    pub fn with_user(mut self, user_id: &str, user_name: &str) -> Self {
        self.user_id = user_id.to_string();
        self.user_name = user_name.to_string();
        self
    }

    pub fn with_turn(mut self, turn_id: &str) -> Self {
        self.turn_id = Some(turn_id.to_string());
        self
    }

    pub fn with_timezone(mut self, tz: Tz) -> Self {
        self.timezone = tz;
        self
    }

    pub fn with_profile(mut self, profile_id: Option<String>) -> Self {
        self.processing_profile_id = profile_id;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_confirmation(mut self, requester: Arc<dyn ConfirmationRequester>) -> Self {
        self.confirmation = Some(requester);
        self
    }

    pub fn with_activity(mut self, updater: Arc<dyn ActivityUpdater>) -> Self {
        self.activity = Some(updater);
        self
    }

    pub fn with_chat(mut self, chat: Arc<dyn ChatInterface>) -> Self {
        self.chat = Some(chat);
        self
    }

    pub fn with_embedding_generator(mut self, gen: Arc<dyn EmbeddingGenerator>) -> Self {
        self.embedding_generator = Some(gen);
        self
    }

    pub fn with_tools_provider(
        mut self,
        provider: Arc<dyn crate::provider::ToolsProvider>,
    ) -> Self {
        self.tools_provider = Some(provider);
        self
    }

    pub fn with_visibility_grants(mut self, grants: HashSet<String>) -> Self {
        self.visibility_grants = grants;
        self
    }

    /// Current local time in the context's timezone, formatted for prompts.
    pub fn local_time_string(&self) -> String {
        self.clock
            .now()
            .with_timezone(&self.timezone)
            .format("%Y-%m-%d %H:%M:%S %Z")
            .to_string()
    }
}
