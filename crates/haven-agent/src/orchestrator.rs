//! The LLM turn orchestrator.
//!
//! One invocation drives one *turn*: trigger in, interleaved LLM calls and
//! tool executions, one terminal assistant message out — with every step
//! persisted under a shared turn id and optionally streamed to the caller.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use haven_attachments::AttachmentRegistry;
use haven_core::boundary::{ChatInterface, ConfirmationRequester};
use haven_core::clock::{Clock, SystemClock};
use haven_core::config::HavenConfig;
use haven_core::types::Role;
use haven_storage::history::{self, MessageRecord, NewMessage};
use haven_storage::Db;
use haven_tools::{ToolExecutionContext, ToolOutput, ToolsProvider};

use crate::context::ContextProvider;
use crate::error::{AgentError, Result};
use crate::multimodal::adapt_tool_result;
use crate::provider::{LlmClient, LlmOutput, StreamDelta};
use crate::selection::select_attachments;

/// Message synthesized when the tool-round cap stops a turn.
const TURN_CAP_MESSAGE: &str =
    "Reached the tool-call limit for this turn. Stopping here — ask me to continue if you \
     need more.";

/// Input to one orchestrator invocation.
#[derive(Clone)]
pub struct TurnInput {
    pub interface_type: String,
    pub conversation_id: String,
    /// Trigger text (a user message, or a synthesized callback trigger).
    pub trigger_text: String,
    /// Attachments already claimed for this conversation, to link to the
    /// trigger message.
    pub trigger_attachment_ids: Vec<String>,
    pub trigger_interface_message_id: Option<String>,
    pub user_name: String,
    pub user_id: String,
    pub processing_profile_id: Option<String>,
    pub confirmation: Option<Arc<dyn ConfirmationRequester>>,
    pub chat: Option<Arc<dyn ChatInterface>>,
    pub cancellation: Option<CancellationToken>,
}

impl TurnInput {
    pub fn text(interface_type: &str, conversation_id: &str, text: impl Into<String>) -> Self {
        Self {
            interface_type: interface_type.to_string(),
            conversation_id: conversation_id.to_string(),
            trigger_text: text.into(),
            trigger_attachment_ids: Vec::new(),
            trigger_interface_message_id: None,
            user_name: "user".to_string(),
            user_id: "api_user".to_string(),
            processing_profile_id: None,
            confirmation: None,
            chat: None,
            cancellation: None,
        }
    }
}

/// A completed turn.
#[derive(Debug, Clone)]
pub struct TurnResult {
    pub turn_id: String,
    pub text: String,
    /// Attachment ids forwarded with the reply.
    pub attachment_ids: Vec<String>,
    pub assistant_message_id: i64,
}

/// Streaming events for `handle_chat_interaction_stream`.
#[derive(Debug, Clone)]
pub enum TurnEvent {
    Content(String),
    ToolCall { id: String, name: String },
    Error(String),
    Done,
}

pub struct Orchestrator {
    db: Db,
    attachments: AttachmentRegistry,
    tools: Arc<dyn ToolsProvider>,
    llm: Arc<dyn LlmClient>,
    config: HavenConfig,
    context_providers: Vec<Arc<dyn ContextProvider>>,
    clock: Arc<dyn Clock>,
}

impl Orchestrator {
    pub fn new(
        db: Db,
        attachments: AttachmentRegistry,
        tools: Arc<dyn ToolsProvider>,
        llm: Arc<dyn LlmClient>,
        config: HavenConfig,
    ) -> Self {
        Self {
            db,
            attachments,
            tools,
            llm,
            config,
            context_providers: Vec::new(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_context_providers(
        mut self,
        providers: Vec<Arc<dyn ContextProvider>>,
    ) -> Self {
        self.context_providers = providers;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn llm(&self) -> &dyn LlmClient {
        self.llm.as_ref()
    }

    /// Run a turn, returning the final assistant text and attachments.
    pub async fn handle_chat_interaction(&self, input: TurnInput) -> Result<TurnResult> {
        self.run_turn(input, None).await
    }

    /// Streaming variant: emits `Content`/`ToolCall` events as the turn
    /// progresses, then `Error` (if any) and finally `Done`.
    pub async fn handle_chat_interaction_stream(
        &self,
        input: TurnInput,
        events: mpsc::Sender<TurnEvent>,
    ) -> Result<TurnResult> {
        let result = self.run_turn(input, Some(events.clone())).await;
        if let Err(e) = &result {
            let _ = events.send(TurnEvent::Error(e.to_string())).await;
        }
        let _ = events.send(TurnEvent::Done).await;
        result
    }

    async fn run_turn(
        &self,
        input: TurnInput,
        events: Option<mpsc::Sender<TurnEvent>>,
    ) -> Result<TurnResult> {
        let turn_id = Uuid::new_v4().to_string();
        info!(
            %turn_id,
            conversation = %input.conversation_id,
            interface = %input.interface_type,
            "turn started"
        );

        let exec_ctx = self.build_exec_context(&input, &turn_id)?;
        let profile = self.config.profile(input.processing_profile_id.as_deref());

        // 1. Assemble the message window: system prompt + bounded history.
        let mut messages = Vec::new();
        messages.push(json!({
            "role": "system",
            "content": self.system_prompt(&profile.system_prompt, &exec_ctx).await,
        }));
        let now = self.clock.now();
        let window = history::recent(
            &self.db,
            &input.conversation_id,
            self.config.orchestrator.max_history_messages,
            Some(chrono::Duration::hours(
                self.config.orchestrator.history_max_age_hours,
            )),
            now,
        )?;
        for record in &window {
            messages.push(record_to_provider_message(record));
        }

        // 2. Persist the trigger and add it to the window.
        let mut trigger = NewMessage::text(
            &input.interface_type,
            &input.conversation_id,
            Role::User,
            input.trigger_text.clone(),
        );
        trigger.turn_id = Some(turn_id.clone());
        trigger.interface_message_id = input.trigger_interface_message_id.clone();
        trigger.attachments = input.trigger_attachment_ids.clone();
        trigger.timestamp = now;
        history::add_message(&self.db, &trigger)?;
        messages.push(json!({"role": "user", "content": input.trigger_text}));

        // 3. Tool surface for the active profile.
        let tool_definitions: Vec<_> = self
            .tools
            .list_definitions()
            .await?
            .into_iter()
            .filter(|def| profile.tools.allows(&def.name))
            .collect();

        let max_rounds = profile
            .max_tool_iterations
            .unwrap_or(self.config.orchestrator.max_tool_iterations)
            .max(1);
        let mut staged_attachments: Vec<String> = Vec::new();
        let mut final_output: Option<(String, i64)> = None;

        // 4. The tool loop.
        for round in 0..max_rounds {
            self.check_cancelled(&input, &turn_id)?;

            let output = self
                .call_llm(&messages, &tool_definitions, &events)
                .await
                .map_err(|e| self.record_turn_failure(&input, &turn_id, e))?;

            let assistant_id = self.persist_assistant(&input, &turn_id, &output)?;

            if output.tool_calls.is_empty() {
                let text = output.content.unwrap_or_default();
                final_output = Some((text, assistant_id));
                break;
            }

            // Append the assistant turn (with tool_calls) to the window.
            let mut assistant_msg = json!({
                "role": "assistant",
                "content": output.content.clone().unwrap_or_default(),
            });
            if let Some(calls) = output.tool_calls_json() {
                assistant_msg["tool_calls"] = calls;
            }
            messages.push(assistant_msg);

            for call in &output.tool_calls {
                self.check_cancelled(&input, &turn_id)?;
                if let Some(tx) = &events {
                    let _ = tx
                        .send(TurnEvent::ToolCall {
                            id: call.id.clone(),
                            name: call.name.clone(),
                        })
                        .await;
                }

                let tool_output = self.execute_tool(&call.name, &call.arguments, &exec_ctx).await;
                for attachment in &tool_output.attachments {
                    staged_attachments.push(attachment.attachment_id.clone());
                }

                // Persist the tool message, then adapt it for the provider.
                let mut tool_msg = NewMessage::text(
                    &input.interface_type,
                    &input.conversation_id,
                    Role::Tool,
                    tool_output.text.clone(),
                );
                tool_msg.turn_id = Some(turn_id.clone());
                tool_msg.tool_call_id = Some(call.id.clone());
                tool_msg.attachments = tool_output
                    .attachments
                    .iter()
                    .map(|a| a.attachment_id.clone())
                    .collect();
                history::add_message(&self.db, &tool_msg)?;

                let adapted = adapt_tool_result(
                    self.llm.capabilities(),
                    &call.id,
                    &tool_output,
                    &self.attachments,
                )
                .await;
                messages.push(adapted.tool_message);
                if let Some(follow_up) = adapted.follow_up_user_message {
                    messages.push(follow_up);
                }
            }

            if round + 1 == max_rounds {
                warn!(%turn_id, max_rounds, "turn hit the tool-round cap");
                let mut capped = NewMessage::text(
                    &input.interface_type,
                    &input.conversation_id,
                    Role::Assistant,
                    TURN_CAP_MESSAGE,
                );
                capped.turn_id = Some(turn_id.clone());
                let id = history::add_message(&self.db, &capped)?;
                if let Some(tx) = &events {
                    let _ = tx.send(TurnEvent::Content(TURN_CAP_MESSAGE.to_string())).await;
                }
                final_output = Some((TURN_CAP_MESSAGE.to_string(), id));
            }
        }

        let (final_text, assistant_message_id) =
            final_output.expect("loop always sets a final output");

        // 5. Attachment selection + linkage to the reply message.
        let mut seen = std::collections::HashSet::new();
        staged_attachments.retain(|id| seen.insert(id.clone()));
        let selected = select_attachments(
            self.llm.as_ref(),
            &final_text,
            &staged_attachments,
            self.config.orchestrator.attachment_selection_threshold,
            self.config.orchestrator.max_response_attachments,
        )
        .await;
        for id in &selected {
            if let Err(e) = self
                .attachments
                .update_attachment_conversation(id, &input.conversation_id)
                .await
            {
                warn!(attachment_id = %id, error = %e, "failed to link attachment conversation");
            }
            if let Err(e) = self.attachments.link_to_message(id, assistant_message_id).await {
                warn!(attachment_id = %id, error = %e, "failed to link attachment to message");
            }
        }
        if !selected.is_empty() {
            history::set_attachments(&self.db, assistant_message_id, &selected)?;
        }

        info!(%turn_id, attachments = selected.len(), "turn completed");
        Ok(TurnResult {
            turn_id,
            text: final_text,
            attachment_ids: selected,
            assistant_message_id,
        })
    }

    fn build_exec_context(&self, input: &TurnInput, turn_id: &str) -> Result<ToolExecutionContext> {
        let tz = self
            .config
            .tz()
            .unwrap_or(chrono_tz::UTC);
        let mut ctx = ToolExecutionContext::new(
            &input.interface_type,
            &input.conversation_id,
            self.db.clone(),
            self.attachments.clone(),
        )
        .with_user(&input.user_id, &input.user_name)
        .with_turn(turn_id)
        .with_timezone(tz)
        .with_profile(input.processing_profile_id.clone())
        .with_clock(self.clock.clone())
        .with_tools_provider(self.tools.clone());
        if let Some(confirmation) = &input.confirmation {
            ctx = ctx.with_confirmation(confirmation.clone());
        }
        if let Some(chat) = &input.chat {
            ctx = ctx.with_chat(chat.clone());
        }
        Ok(ctx)
    }

    async fn system_prompt(&self, base: &str, ctx: &ToolExecutionContext) -> String {
        let mut parts = Vec::new();
        if !base.is_empty() {
            parts.push(base.to_string());
        }
        for provider in &self.context_providers {
            parts.extend(provider.fragments(ctx).await);
        }
        if parts.is_empty() {
            "You are a helpful personal assistant.".to_string()
        } else {
            parts.join("\n\n")
        }
    }

    async fn call_llm(
        &self,
        messages: &[Value],
        tools: &[haven_tools::ToolDefinition],
        events: &Option<mpsc::Sender<TurnEvent>>,
    ) -> Result<LlmOutput> {
        match events {
            Some(tx) => {
                let (delta_tx, mut delta_rx) = mpsc::channel::<StreamDelta>(32);
                let forward_tx = tx.clone();
                let forwarder = tokio::spawn(async move {
                    while let Some(StreamDelta::Content(chunk)) = delta_rx.recv().await {
                        let _ = forward_tx.send(TurnEvent::Content(chunk)).await;
                    }
                });
                let output = self
                    .llm
                    .generate_stream(messages, tools, "auto", delta_tx)
                    .await;
                let _ = forwarder.await;
                output
            }
            None => self.llm.generate(messages, tools, "auto").await,
        }
    }

    /// Execute a tool; every failure becomes a tool-result text so the turn
    /// keeps going and the model can react.
    async fn execute_tool(
        &self,
        name: &str,
        arguments: &Value,
        ctx: &ToolExecutionContext,
    ) -> ToolOutput {
        match self.tools.execute(name, arguments, ctx).await {
            Ok(output) => output,
            Err(e) => {
                warn!(tool = %name, error = %e, "tool execution failed");
                ToolOutput::text(format!("Error: {e}"))
            }
        }
    }

    fn persist_assistant(
        &self,
        input: &TurnInput,
        turn_id: &str,
        output: &LlmOutput,
    ) -> Result<i64> {
        let mut msg = NewMessage::text(
            &input.interface_type,
            &input.conversation_id,
            Role::Assistant,
            output.content.clone().unwrap_or_default(),
        );
        msg.turn_id = Some(turn_id.to_string());
        msg.tool_calls = output.tool_calls_json();
        msg.reasoning_info = output.reasoning_info.clone();
        Ok(history::add_message(&self.db, &msg)?)
    }

    fn check_cancelled(&self, input: &TurnInput, turn_id: &str) -> Result<()> {
        if input
            .cancellation
            .as_ref()
            .is_some_and(|token| token.is_cancelled())
        {
            warn!(%turn_id, "turn cancelled");
            let mut msg = NewMessage::text(
                &input.interface_type,
                &input.conversation_id,
                Role::Assistant,
                "This request was cancelled before completion.",
            );
            msg.turn_id = Some(turn_id.to_string());
            msg.error_traceback = Some("cancelled".to_string());
            let _ = history::add_message(&self.db, &msg);
            return Err(AgentError::Cancelled);
        }
        Ok(())
    }

    /// Record a failed turn: the trigger is already in history; add a
    /// terminal assistant message describing the failure.
    fn record_turn_failure(
        &self,
        input: &TurnInput,
        turn_id: &str,
        e: AgentError,
    ) -> AgentError {
        error!(%turn_id, error = %e, "turn failed");
        let mut msg = NewMessage::text(
            &input.interface_type,
            &input.conversation_id,
            Role::Assistant,
            format!("Sorry, I ran into a problem and couldn't finish: {e}"),
        );
        msg.turn_id = Some(turn_id.to_string());
        msg.error_traceback = Some(e.to_string());
        if let Err(log_err) = history::add_message(&self.db, &msg) {
            error!(%turn_id, error = %log_err, "failed to record turn failure");
        }
        e
    }
}

/// Map a stored history row back into the provider wire shape.
fn record_to_provider_message(record: &MessageRecord) -> Value {
    match record.role {
        Role::System => json!({"role": "system", "content": record.content}),
        Role::User => json!({"role": "user", "content": record.content}),
        Role::Assistant => {
            let mut msg = json!({"role": "assistant", "content": record.content});
            if let Some(calls) = &record.tool_calls {
                msg["tool_calls"] = calls.clone();
            }
            msg
        }
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": record.tool_call_id.clone().unwrap_or_default(),
            "content": record.content,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::ScriptedClient;
    use async_trait::async_trait;
    use haven_tools::local::{LocalToolsProvider, ToolHandler};
    use haven_tools::{ConfirmingToolsProvider, ToolDefinition};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Fixture {
        db: Db,
        attachments: AttachmentRegistry,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open_in_memory().unwrap();
        let store = haven_attachments::BlobStore::new(dir.path()).unwrap();
        let attachments = AttachmentRegistry::new(db.clone(), store, "/attachments");
        Fixture {
            db,
            attachments,
            _dir: dir,
        }
    }

    fn echo_provider() -> Arc<dyn ToolsProvider> {
        let mut provider = LocalToolsProvider::new();
        let handler: ToolHandler = Box::new(|args, _ctx| {
            Box::pin(async move {
                let text = args.get("text").and_then(Value::as_str).unwrap_or("");
                Ok(ToolOutput::text(format!("echo: {text}")))
            })
        });
        provider
            .register(
                ToolDefinition::new("echo", "Echo text", json!({"type": "object"})),
                handler,
            )
            .unwrap();
        Arc::new(provider)
    }

    fn orchestrator(
        fx: &Fixture,
        tools: Arc<dyn ToolsProvider>,
        outputs: Vec<LlmOutput>,
    ) -> Orchestrator {
        Orchestrator::new(
            fx.db.clone(),
            fx.attachments.clone(),
            tools,
            Arc::new(ScriptedClient::new(outputs)),
            HavenConfig::default(),
        )
    }

    #[tokio::test]
    async fn plain_turn_persists_trigger_and_reply_under_one_turn_id() {
        let fx = fixture();
        let orch = orchestrator(&fx, echo_provider(), vec![LlmOutput::text("hello!")]);

        let result = orch
            .handle_chat_interaction(TurnInput::text("api", "c1", "hi"))
            .await
            .unwrap();
        assert_eq!(result.text, "hello!");

        let rows = history::by_turn(&fx.db, &result.turn_id).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].role, Role::User);
        assert_eq!(rows[0].content, "hi");
        assert_eq!(rows[1].role, Role::Assistant);
        assert_eq!(rows[1].content, "hello!");
    }

    #[tokio::test]
    async fn tool_loop_executes_and_persists_every_step() {
        let fx = fixture();
        let orch = orchestrator(
            &fx,
            echo_provider(),
            vec![
                LlmOutput::tool_call("call_1", "echo", json!({"text": "ping"})),
                LlmOutput::text("the tool said ping"),
            ],
        );

        let result = orch
            .handle_chat_interaction(TurnInput::text("api", "c1", "run echo"))
            .await
            .unwrap();
        assert_eq!(result.text, "the tool said ping");

        let rows = history::by_turn(&fx.db, &result.turn_id).unwrap();
        // user trigger, assistant w/ tool_calls, tool result, final assistant
        assert_eq!(rows.len(), 4);
        assert!(rows[1].tool_calls.is_some());
        assert_eq!(rows[2].role, Role::Tool);
        assert_eq!(rows[2].content, "echo: ping");
        assert_eq!(rows[2].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(rows[3].role, Role::Assistant);
    }

    #[tokio::test]
    async fn tool_failure_becomes_tool_message_and_turn_continues() {
        let fx = fixture();
        let orch = orchestrator(
            &fx,
            echo_provider(),
            vec![
                LlmOutput::tool_call("call_1", "no_such_tool", json!({})),
                LlmOutput::text("recovered"),
            ],
        );

        let result = orch
            .handle_chat_interaction(TurnInput::text("api", "c1", "try it"))
            .await
            .unwrap();
        assert_eq!(result.text, "recovered");

        let rows = history::by_turn(&fx.db, &result.turn_id).unwrap();
        let tool_row = rows.iter().find(|r| r.role == Role::Tool).unwrap();
        assert!(tool_row.content.starts_with("Error:"));
    }

    #[tokio::test]
    async fn round_cap_synthesizes_a_terminal_message() {
        let fx = fixture();
        let mut config = HavenConfig::default();
        config.orchestrator.max_tool_iterations = 2;
        let orch = Orchestrator::new(
            fx.db.clone(),
            fx.attachments.clone(),
            echo_provider(),
            Arc::new(ScriptedClient::new(vec![
                LlmOutput::tool_call("call_1", "echo", json!({"text": "a"})),
                LlmOutput::tool_call("call_2", "echo", json!({"text": "b"})),
            ])),
            config,
        );

        let result = orch
            .handle_chat_interaction(TurnInput::text("api", "c1", "loop"))
            .await
            .unwrap();
        assert!(result.text.contains("tool-call limit"));

        let rows = history::by_turn(&fx.db, &result.turn_id).unwrap();
        let last = rows.last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert!(last.content.contains("tool-call limit"));
    }

    #[tokio::test]
    async fn confirmation_denial_cancels_tool_but_not_turn() {
        struct DenyAll;
        #[async_trait]
        impl ConfirmationRequester for DenyAll {
            async fn request_confirmation(&self, _prompt: &str) -> bool {
                false
            }
        }

        let fx = fixture();
        let ran = Arc::new(AtomicBool::new(false));
        let mut inner = LocalToolsProvider::new();
        let ran2 = ran.clone();
        let handler: ToolHandler = Box::new(move |_args, _ctx| {
            let ran = ran2.clone();
            Box::pin(async move {
                ran.store(true, Ordering::SeqCst);
                Ok(ToolOutput::text("deleted"))
            })
        });
        inner
            .register(
                ToolDefinition::new(
                    "delete_calendar_event",
                    "Delete a calendar event",
                    json!({"type": "object"}),
                ),
                handler,
            )
            .unwrap();
        let gated: Arc<dyn ToolsProvider> = Arc::new(ConfirmingToolsProvider::new(
            Arc::new(inner),
            HashSet::from(["delete_calendar_event".to_string()]),
            std::time::Duration::from_secs(5),
        ));

        let orch = orchestrator(
            &fx,
            gated,
            vec![
                LlmOutput::tool_call("call_1", "delete_calendar_event", json!({"event": "dentist"})),
                LlmOutput::text("okay, I won't delete it"),
            ],
        );

        let mut input = TurnInput::text("api", "c1", "delete my dentist appointment");
        input.confirmation = Some(Arc::new(DenyAll));
        let result = orch.handle_chat_interaction(input).await.unwrap();

        assert_eq!(result.text, "okay, I won't delete it");
        assert!(!ran.load(Ordering::SeqCst), "underlying delete must not run");

        let rows = history::by_turn(&fx.db, &result.turn_id).unwrap();
        let tool_row = rows.iter().find(|r| r.role == Role::Tool).unwrap();
        assert!(tool_row.content.starts_with("OK. Action cancelled by user"));
    }

    #[tokio::test]
    async fn streaming_emits_tool_call_content_and_done() {
        let fx = fixture();
        let orch = orchestrator(
            &fx,
            echo_provider(),
            vec![
                LlmOutput::tool_call("call_1", "echo", json!({"text": "x"})),
                LlmOutput::text("streamed final"),
            ],
        );

        let (tx, mut rx) = mpsc::channel(32);
        let result = orch
            .handle_chat_interaction_stream(TurnInput::text("api", "c1", "go"), tx)
            .await
            .unwrap();
        assert_eq!(result.text, "streamed final");

        let mut saw_tool_call = false;
        let mut saw_content = false;
        let mut saw_done = false;
        while let Some(event) = rx.recv().await {
            match event {
                TurnEvent::ToolCall { name, .. } => {
                    assert_eq!(name, "echo");
                    saw_tool_call = true;
                }
                TurnEvent::Content(text) => {
                    if text.contains("streamed final") {
                        saw_content = true;
                    }
                }
                TurnEvent::Done => {
                    saw_done = true;
                    break;
                }
                TurnEvent::Error(e) => panic!("unexpected error event: {e}"),
            }
        }
        assert!(saw_tool_call && saw_content && saw_done);
    }

    #[tokio::test]
    async fn llm_failure_writes_terminal_error_message() {
        let fx = fixture();
        // Scripted client with no outputs errors on the first call.
        let orch = orchestrator(&fx, echo_provider(), vec![]);

        let err = orch
            .handle_chat_interaction(TurnInput::text("api", "c1", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Request(_)));

        // Trigger is preserved and a terminal assistant message describes
        // the failure.
        let recent = history::recent(&fx.db, "c1", 10, None, chrono::Utc::now()).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].content, "hi");
        assert!(recent[1].error_traceback.is_some());
    }

    #[tokio::test]
    async fn tool_attachments_are_linked_to_the_reply() {
        let fx = fixture();

        // A tool that stages an attachment through the registry.
        let registry = fx.attachments.clone();
        let mut provider = LocalToolsProvider::new();
        let handler: ToolHandler = Box::new(move |_args, ctx| {
            let registry = registry.clone();
            let _ = ctx;
            Box::pin(async move {
                let meta = registry
                    .register_script_attachment(b"chart-bytes", "render", "image/png", "A chart", None)
                    .await
                    .map_err(|e| haven_tools::ToolError::Execution {
                        tool: "render_chart".into(),
                        detail: e.to_string(),
                    })?;
                Ok(ToolOutput::text("chart rendered").with_attachments(vec![
                    haven_tools::ToolAttachment {
                        attachment_id: meta.attachment_id,
                        mime_type: "image/png".into(),
                    },
                ]))
            })
        });
        provider
            .register(
                ToolDefinition::new("render_chart", "Render a chart", json!({"type": "object"})),
                handler,
            )
            .unwrap();

        let orch = orchestrator(
            &fx,
            Arc::new(provider),
            vec![
                LlmOutput::tool_call("call_1", "render_chart", json!({})),
                LlmOutput::text("here is your chart"),
            ],
        );

        let result = orch
            .handle_chat_interaction(TurnInput::text("api", "c1", "chart please"))
            .await
            .unwrap();
        assert_eq!(result.attachment_ids.len(), 1);

        let meta = fx
            .attachments
            .get_attachment(&result.attachment_ids[0])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(meta.conversation_id.as_deref(), Some("c1"));
        assert_eq!(meta.message_id, Some(result.assistant_message_id));

        let reply = history::get(&fx.db, result.assistant_message_id).unwrap().unwrap();
        assert_eq!(reply.attachments, result.attachment_ids);
    }

    #[tokio::test]
    async fn cancellation_stops_between_rounds() {
        let fx = fixture();
        let orch = orchestrator(&fx, echo_provider(), vec![LlmOutput::text("never sent")]);

        let token = CancellationToken::new();
        token.cancel();
        let mut input = TurnInput::text("api", "c1", "hi");
        input.cancellation = Some(token);

        let err = orch.handle_chat_interaction(input).await.unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
    }
}
