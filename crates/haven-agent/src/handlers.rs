//! Queue handlers wiring scheduled/event tasks into the orchestrator and
//! the script sandbox.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{info, warn};

use haven_attachments::AttachmentRegistry;
use haven_core::boundary::ChatInterface;
use haven_core::config::HavenConfig;
use haven_queue::{enqueue_task, TaskHandler, WorkerSignal};
use haven_scripting::{ScriptConfig, ScriptEngine};
use haven_storage::tasks::EnqueueOptions;
use haven_storage::Db;
use haven_tools::{ToolExecutionContext, ToolsProvider};
use uuid::Uuid;

use crate::orchestrator::{Orchestrator, TurnInput};

/// Shared dependencies for the task handlers.
pub struct HandlerDeps {
    pub orchestrator: Arc<Orchestrator>,
    pub db: Db,
    pub attachments: AttachmentRegistry,
    pub tools: Arc<dyn ToolsProvider>,
    pub signal: WorkerSignal,
    pub config: HavenConfig,
    /// Outbound delivery for callback results, when a transport is wired.
    pub chat: Option<Arc<dyn ChatInterface>>,
}

fn required_str(payload: &Value, key: &str) -> Result<String, String> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| format!("Missing required field in payload: {key}"))
}

/// Handler for `llm_callback` tasks: wake the orchestrator with the stored
/// context (and the triggering event, when one rode along).
pub fn llm_callback_handler(deps: Arc<HandlerDeps>) -> TaskHandler {
    Arc::new(move |task, _handle| {
        let deps = deps.clone();
        Box::pin(async move {
            let conversation_id = required_str(&task.payload, "conversation_id")?;
            let interface_type = task
                .payload
                .get("interface_type")
                .and_then(Value::as_str)
                .unwrap_or("api")
                .to_string();
            let callback_context = required_str(&task.payload, "callback_context")?;

            let tz = deps.config.tz().unwrap_or(chrono_tz::UTC);
            let local_time = chrono::Utc::now()
                .with_timezone(&tz)
                .format("%Y-%m-%d %H:%M:%S %Z");

            let mut trigger_text = format!(
                "System Callback Trigger:\n\nThe time is now {local_time}.\n\
                 Your scheduled context was:\n---\n{callback_context}\n---"
            );
            if let Some(event) = task.payload.get("event") {
                trigger_text.push_str(&format!("\n\nTriggering event:\n{event}"));
            }

            let mut input = TurnInput::text(&interface_type, &conversation_id, trigger_text);
            input.processing_profile_id = task
                .payload
                .get("processing_profile_id")
                .and_then(Value::as_str)
                .map(String::from);
            input.chat = deps.chat.clone();

            let result = deps
                .orchestrator
                .handle_chat_interaction(input)
                .await
                .map_err(|e| format!("LLM callback turn failed: {e}"))?;

            if let Some(chat) = &deps.chat {
                if let Err(e) = chat.send_message(&conversation_id, &result.text).await {
                    warn!(conversation = %conversation_id, error = %e, "callback delivery failed");
                }
            }
            info!(task_id = %task.task_id, turn_id = %result.turn_id, "llm callback completed");
            Ok(())
        })
    })
}

/// Handler for `script_execution` tasks: run the stored script in the
/// sandbox and enqueue an `llm_callback` for every `wake_llm` request it
/// made.
pub fn script_execution_handler(deps: Arc<HandlerDeps>) -> TaskHandler {
    Arc::new(move |task, _handle| {
        let deps = deps.clone();
        Box::pin(async move {
            let conversation_id = required_str(&task.payload, "conversation_id")?;
            let interface_type = task
                .payload
                .get("interface_type")
                .and_then(Value::as_str)
                .unwrap_or("api")
                .to_string();
            let script_code = required_str(&task.payload, "script_code")?;
            let task_name = task
                .payload
                .get("task_name")
                .and_then(Value::as_str)
                .unwrap_or("script")
                .to_string();

            let ctx = ToolExecutionContext::new(
                &interface_type,
                &conversation_id,
                deps.db.clone(),
                deps.attachments.clone(),
            )
            .with_timezone(deps.config.tz().unwrap_or(chrono_tz::UTC))
            .with_tools_provider(deps.tools.clone());

            let engine = ScriptEngine::new(ScriptConfig {
                max_execution_secs: deps.config.scripting.max_execution_secs,
                ..Default::default()
            });
            let outcome = engine
                .evaluate(
                    &script_code,
                    &json!({}),
                    Some(deps.tools.clone()),
                    Some(ctx),
                )
                .await
                .map_err(|e| format!("Script task '{task_name}' failed: {e}"))?;

            info!(
                task_id = %task.task_id,
                %task_name,
                wakes = outcome.wake_requests.len(),
                "script task completed"
            );

            // wake_llm requests become llm_callback tasks of their own.
            for wake in outcome.wake_requests {
                let context_text = match &wake.context {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                let mut payload = json!({
                    "conversation_id": conversation_id,
                    "interface_type": interface_type,
                    "callback_context": context_text,
                });
                if wake.include_event {
                    if let Some(event) = task.payload.get("event") {
                        payload["event"] = event.clone();
                    }
                }
                let wake_id = format!("wake_{}", Uuid::new_v4());
                enqueue_task(
                    &deps.db,
                    Some(&deps.signal),
                    &wake_id,
                    "llm_callback",
                    &payload,
                    EnqueueOptions::default(),
                )
                .map_err(|e| format!("failed to enqueue wake request: {e}"))?;
            }

            Ok(())
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::LlmOutput;
    use crate::replay::ScriptedClient;
    use haven_core::types::TaskStatus;
    use haven_storage::{history, tasks};
    use haven_tools::LocalToolsProvider;

    fn deps_with(outputs: Vec<LlmOutput>) -> (Arc<HandlerDeps>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open_in_memory().unwrap();
        let store = haven_attachments::BlobStore::new(dir.path()).unwrap();
        let attachments = AttachmentRegistry::new(db.clone(), store, "/attachments");
        let tools: Arc<dyn ToolsProvider> = Arc::new(LocalToolsProvider::new());
        let orchestrator = Arc::new(Orchestrator::new(
            db.clone(),
            attachments.clone(),
            tools.clone(),
            Arc::new(ScriptedClient::new(outputs)),
            HavenConfig::default(),
        ));
        (
            Arc::new(HandlerDeps {
                orchestrator,
                db,
                attachments,
                tools,
                signal: WorkerSignal::new(),
                config: HavenConfig::default(),
                chat: None,
            }),
            dir,
        )
    }

    fn task_with(payload: Value, task_type: &str) -> haven_storage::tasks::TaskRecord {
        haven_storage::tasks::TaskRecord {
            task_id: "t1".into(),
            task_type: task_type.into(),
            payload,
            status: TaskStatus::InProgress,
            scheduled_at: chrono::Utc::now(),
            created_at: chrono::Utc::now(),
            retry_count: 0,
            max_retries: 3,
            last_error: None,
            worker_id: None,
            lease_expires_at: None,
            recurrence_rule: None,
            original_task_id: None,
        }
    }

    #[tokio::test]
    async fn llm_callback_composes_the_trigger_and_persists_a_turn() {
        let (deps, _dir) = deps_with(vec![LlmOutput::text("Good morning! Here's your briefing.")]);
        let handler = llm_callback_handler(deps.clone());

        let task = task_with(
            json!({
                "conversation_id": "c1",
                "interface_type": "api",
                "callback_context": "Daily briefing",
                "automation_id": "1",
                "automation_type": "schedule",
            }),
            "llm_callback",
        );

        let result = run_handler(&handler, task, &deps).await;
        assert!(result.is_ok(), "{result:?}");

        let msgs = history::recent(&deps.db, "c1", 10, None, chrono::Utc::now()).unwrap();
        assert_eq!(msgs.len(), 2);
        assert!(msgs[0].content.contains("System Callback Trigger"));
        assert!(msgs[0].content.contains("Daily briefing"));
        assert_eq!(msgs[1].content, "Good morning! Here's your briefing.");
    }

    #[tokio::test]
    async fn llm_callback_requires_its_payload_fields() {
        let (deps, _dir) = deps_with(vec![]);
        let handler = llm_callback_handler(deps.clone());
        let task = task_with(json!({"conversation_id": "c1"}), "llm_callback");
        let err = run_handler(&handler, task, &deps).await.unwrap_err();
        assert!(err.contains("callback_context"));
    }

    #[tokio::test]
    async fn script_execution_enqueues_wake_requests() {
        let (deps, _dir) = deps_with(vec![]);
        let handler = script_execution_handler(deps.clone());

        let task = task_with(
            json!({
                "conversation_id": "c1",
                "interface_type": "api",
                "script_code": "wake_llm(\"follow up on the door\")\nNone",
                "task_name": "door-check",
                "event": {"entity_id": "sensor.door"},
            }),
            "script_execution",
        );
        run_handler(&handler, task, &deps).await.unwrap();

        let pending = tasks::list(&deps.db, Some(TaskStatus::Pending), 10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].task_type, "llm_callback");
        assert_eq!(pending[0].payload["callback_context"], "follow up on the door");
        // include_event defaults to true: the originating event rides along.
        assert_eq!(pending[0].payload["event"]["entity_id"], "sensor.door");
    }

    #[tokio::test]
    async fn script_failure_fails_the_task() {
        let (deps, _dir) = deps_with(vec![]);
        let handler = script_execution_handler(deps.clone());
        let task = task_with(
            json!({
                "conversation_id": "c1",
                "script_code": "fail(\"broken\")",
                "task_name": "boom",
            }),
            "script_execution",
        );
        let err = run_handler(&handler, task, &deps).await.unwrap_err();
        assert!(err.contains("broken"));
    }

    /// Drive a handler through a real worker so the `TaskHandle` plumbing
    /// stays honest.
    async fn run_handler(
        handler: &TaskHandler,
        task: haven_storage::tasks::TaskRecord,
        deps: &Arc<HandlerDeps>,
    ) -> std::result::Result<(), String> {
        let mut worker = haven_queue::TaskWorker::new(deps.db.clone(), Default::default());
        worker.register_handler(&task.task_type, handler.clone());
        tasks::enqueue(
            &deps.db,
            &task.task_id,
            &task.task_type,
            &task.payload,
            Default::default(),
        )
        .unwrap();
        worker.poll_once().await.map_err(|e| e.to_string())?;
        let stored = tasks::get(&deps.db, &task.task_id).unwrap().unwrap();
        match stored.status {
            TaskStatus::Done => Ok(()),
            _ => Err(stored.last_error.unwrap_or_else(|| "failed".into())),
        }
    }
}
