//! Conversation-facing tools for managing automations.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::info;

use haven_core::types::{ActionKind, AutomationKind};
use haven_storage::automations::{
    self, ListenerUpdate, NewAutomation, NewListener, ScheduleUpdate,
};
use haven_tools::local::{require_str, LocalToolsProvider, ToolHandler};
use haven_tools::{ToolDefinition, ToolError, ToolOutput};

use crate::dispatcher::EventDispatcher;

/// Event source tags automations may subscribe to.
pub const EVENT_SOURCES: &[&str] = &["home_assistant", "document_indexing", "webhook"];

/// Register the automation management tool set on a local provider.
pub fn register_automation_tools(
    provider: &mut LocalToolsProvider,
    dispatcher: Arc<EventDispatcher>,
) -> haven_tools::Result<()> {
    provider.register(create_definition(), create_handler(dispatcher.clone()))?;
    provider.register(list_definition(), list_handler())?;
    provider.register(get_definition(), get_handler())?;
    provider.register(update_definition(), update_handler())?;
    provider.register(delete_definition(), delete_handler(dispatcher.clone()))?;
    provider.register(set_enabled_definition(), set_enabled_handler(dispatcher))?;
    provider.register(stats_definition(), stats_handler())?;
    Ok(())
}

fn parse_kind(tool: &str, args: &Value) -> haven_tools::Result<AutomationKind> {
    require_str(tool, args, "automation_type")?
        .parse()
        .map_err(|detail| ToolError::InvalidArguments {
            tool: tool.to_string(),
            detail,
        })
}

fn parse_id(tool: &str, args: &Value) -> haven_tools::Result<i64> {
    args.get("automation_id")
        .and_then(Value::as_i64)
        .ok_or_else(|| ToolError::InvalidArguments {
            tool: tool.to_string(),
            detail: "missing required integer argument 'automation_id'".into(),
        })
}

// ── create_automation ────────────────────────────────────────────────────────

fn create_definition() -> ToolDefinition {
    ToolDefinition::new(
        "create_automation",
        "Create a new automation (event-triggered or schedule-based).\n\
         Event automations trigger when matching events occur; schedule automations\n\
         run on a recurring calendar rule (RRULE format, e.g. FREQ=DAILY;BYHOUR=7).",
        json!({
            "type": "object",
            "properties": {
                "name": {"type": "string", "description": "Unique name for the automation"},
                "automation_type": {"type": "string", "enum": ["event", "schedule"]},
                "trigger_config": {
                    "type": "object",
                    "description": "For event: event_source, match_conditions, optional condition_script, one_time.\nFor schedule: recurrence_rule (RRULE string)."
                },
                "action_type": {"type": "string", "enum": ["wake_llm", "script"]},
                "action_config": {
                    "type": "object",
                    "description": "For wake_llm: {context}. For script: {script_code, task_name}."
                },
                "description": {"type": "string"}
            },
            "required": ["name", "automation_type", "trigger_config", "action_type", "action_config"]
        }),
    )
}

fn create_handler(dispatcher: Arc<EventDispatcher>) -> ToolHandler {
    Box::new(move |args, ctx| {
        let dispatcher = dispatcher.clone();
        Box::pin(async move {
            let tool = "create_automation";
            let name = require_str(tool, args, "name")?.to_string();
            let kind = parse_kind(tool, args)?;
            let action_type: ActionKind = require_str(tool, args, "action_type")?
                .parse()
                .map_err(|detail| ToolError::InvalidArguments {
                    tool: tool.to_string(),
                    detail,
                })?;
            let trigger = args.get("trigger_config").cloned().unwrap_or(json!({}));
            let action_config = args.get("action_config").cloned().unwrap_or(json!({}));
            let description = args
                .get("description")
                .and_then(Value::as_str)
                .map(String::from);

            let (available, taken_by) =
                automations::check_name_available(&ctx.db, &name, &ctx.conversation_id)
                    .map_err(storage_err(tool))?;
            if !available {
                return Ok(ToolOutput::text(format!(
                    "An automation named '{name}' already exists in this conversation ({}).",
                    taken_by.map(|k| k.to_string()).unwrap_or_default()
                )));
            }

            let base = NewAutomation {
                name: name.clone(),
                description,
                conversation_id: ctx.conversation_id.clone(),
                interface_type: ctx.interface_type.clone(),
                action_type,
                action_config,
            };

            match kind {
                AutomationKind::Schedule => {
                    let rule = trigger
                        .get("recurrence_rule")
                        .and_then(Value::as_str)
                        .ok_or_else(|| ToolError::InvalidArguments {
                            tool: tool.to_string(),
                            detail: "schedule automations need trigger_config.recurrence_rule"
                                .into(),
                        })?;
                    let automation =
                        automations::create_schedule(&ctx.db, base, rule, ctx.clock.now())
                            .map_err(storage_err(tool))?;
                    info!(automation_id = automation.id, %name, "schedule automation created via tool");
                    Ok(ToolOutput::text(format!(
                        "Created schedule automation '{name}' (ID: {}). Next run: {}.",
                        automation.id,
                        automation
                            .next_scheduled_at
                            .map(|t| t.to_rfc3339())
                            .unwrap_or_else(|| "never".into())
                    )))
                }
                AutomationKind::Event => {
                    let source_id = trigger
                        .get("event_source")
                        .and_then(Value::as_str)
                        .ok_or_else(|| ToolError::InvalidArguments {
                            tool: tool.to_string(),
                            detail: "event automations need trigger_config.event_source".into(),
                        })?;
                    if !EVENT_SOURCES.contains(&source_id) {
                        return Ok(ToolOutput::text(format!(
                            "Unknown event source '{source_id}'. Available: {}.",
                            EVENT_SOURCES.join(", ")
                        )));
                    }
                    let listener = automations::create_listener(
                        &ctx.db,
                        NewListener {
                            base,
                            source_id: source_id.to_string(),
                            match_conditions: trigger
                                .get("match_conditions")
                                .cloned()
                                .unwrap_or(json!({})),
                            condition_script: trigger
                                .get("condition_script")
                                .and_then(Value::as_str)
                                .map(String::from),
                            one_time: trigger
                                .get("one_time")
                                .and_then(Value::as_bool)
                                .unwrap_or(false),
                        },
                        ctx.clock.now(),
                    )
                    .map_err(storage_err(tool))?;
                    dispatcher.index_listener(&listener.source_id, listener.id);
                    Ok(ToolOutput::text(format!(
                        "Created event automation '{name}' (ID: {}). It will trigger when '{source_id}' events occur.",
                        listener.id
                    )))
                }
            }
        })
    })
}

// ── list_automations ─────────────────────────────────────────────────────────

fn list_definition() -> ToolDefinition {
    ToolDefinition::new(
        "list_automations",
        "List automations in this conversation, optionally filtered by type or enabled status.",
        json!({
            "type": "object",
            "properties": {
                "automation_type": {"type": "string", "enum": ["event", "schedule"]},
                "enabled_only": {"type": "boolean", "default": false}
            }
        }),
    )
}

fn list_handler() -> ToolHandler {
    Box::new(|args, ctx| {
        Box::pin(async move {
            let tool = "list_automations";
            let enabled_only = args
                .get("enabled_only")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let kind_filter = args
                .get("automation_type")
                .and_then(Value::as_str)
                .map(|s| s.parse::<AutomationKind>())
                .transpose()
                .map_err(|detail| ToolError::InvalidArguments {
                    tool: tool.to_string(),
                    detail,
                })?;

            let mut rows = Vec::new();
            if kind_filter != Some(AutomationKind::Event) {
                for a in automations::list_schedules(&ctx.db, &ctx.conversation_id, enabled_only)
                    .map_err(storage_err(tool))?
                {
                    rows.push(json!({
                        "id": a.id,
                        "type": "schedule",
                        "name": a.name,
                        "enabled": a.enabled,
                        "recurrence_rule": a.recurrence_rule,
                        "next_scheduled_at": a.next_scheduled_at.map(|t| t.to_rfc3339()),
                        "execution_count": a.execution_count,
                    }));
                }
            }
            if kind_filter != Some(AutomationKind::Schedule) {
                for l in automations::list_listeners(
                    &ctx.db,
                    Some(ctx.conversation_id.as_str()),
                    enabled_only,
                )
                .map_err(storage_err(tool))?
                {
                    rows.push(json!({
                        "id": l.id,
                        "type": "event",
                        "name": l.name,
                        "enabled": l.enabled,
                        "source": l.source_id,
                        "one_time": l.one_time,
                        "daily_executions": l.daily_executions,
                    }));
                }
            }

            if rows.is_empty() {
                return Ok(ToolOutput::text("No automations found."));
            }
            let data = Value::Array(rows);
            Ok(ToolOutput::text(serde_json::to_string_pretty(&data)?).with_data(data))
        })
    })
}

// ── get_automation ───────────────────────────────────────────────────────────

fn get_definition() -> ToolDefinition {
    ToolDefinition::new(
        "get_automation",
        "Get full details of one automation by id and type.",
        json!({
            "type": "object",
            "properties": {
                "automation_id": {"type": "integer"},
                "automation_type": {"type": "string", "enum": ["event", "schedule"]}
            },
            "required": ["automation_id", "automation_type"]
        }),
    )
}

fn get_handler() -> ToolHandler {
    Box::new(|args, ctx| {
        Box::pin(async move {
            let tool = "get_automation";
            let id = parse_id(tool, args)?;
            let data = match parse_kind(tool, args)? {
                AutomationKind::Schedule => {
                    automations::get_schedule(&ctx.db, id, Some(&ctx.conversation_id))
                        .map_err(storage_err(tool))?
                        .map(|a| serde_json::to_value(a).unwrap_or(Value::Null))
                }
                AutomationKind::Event => {
                    automations::get_listener(&ctx.db, id, Some(&ctx.conversation_id))
                        .map_err(storage_err(tool))?
                        .map(|l| serde_json::to_value(l).unwrap_or(Value::Null))
                }
            };
            match data {
                Some(data) => {
                    Ok(ToolOutput::text(serde_json::to_string_pretty(&data)?).with_data(data))
                }
                None => Ok(ToolOutput::text(format!("Automation {id} not found."))),
            }
        })
    })
}

// ── update_automation ────────────────────────────────────────────────────────

fn update_definition() -> ToolDefinition {
    ToolDefinition::new(
        "update_automation",
        "Update an automation's name, description, trigger, action, or enabled flag.\n\
         Changing a schedule's recurrence_rule cancels its pending runs and schedules\n\
         a fresh first instance. An event automation's source cannot change.",
        json!({
            "type": "object",
            "properties": {
                "automation_id": {"type": "integer"},
                "automation_type": {"type": "string", "enum": ["event", "schedule"]},
                "name": {"type": "string"},
                "description": {"type": "string"},
                "recurrence_rule": {"type": "string"},
                "match_conditions": {"type": "object"},
                "condition_script": {"type": "string"},
                "action_config": {"type": "object"},
                "one_time": {"type": "boolean"},
                "enabled": {"type": "boolean"}
            },
            "required": ["automation_id", "automation_type"]
        }),
    )
}

fn update_handler() -> ToolHandler {
    Box::new(|args, ctx| {
        Box::pin(async move {
            let tool = "update_automation";
            let id = parse_id(tool, args)?;
            let updated = match parse_kind(tool, args)? {
                AutomationKind::Schedule => automations::update_schedule(
                    &ctx.db,
                    id,
                    &ctx.conversation_id,
                    ScheduleUpdate {
                        name: args.get("name").and_then(Value::as_str).map(String::from),
                        description: args
                            .get("description")
                            .and_then(Value::as_str)
                            .map(|s| Some(s.to_string())),
                        recurrence_rule: args
                            .get("recurrence_rule")
                            .and_then(Value::as_str)
                            .map(String::from),
                        action_config: args.get("action_config").cloned(),
                        enabled: args.get("enabled").and_then(Value::as_bool),
                    },
                    ctx.clock.now(),
                )
                .map_err(storage_err(tool))?,
                AutomationKind::Event => automations::update_listener(
                    &ctx.db,
                    id,
                    &ctx.conversation_id,
                    ListenerUpdate {
                        name: args.get("name").and_then(Value::as_str).map(String::from),
                        description: args
                            .get("description")
                            .and_then(Value::as_str)
                            .map(|s| Some(s.to_string())),
                        match_conditions: args.get("match_conditions").cloned(),
                        condition_script: args
                            .get("condition_script")
                            .and_then(Value::as_str)
                            .map(|s| Some(s.to_string())),
                        action_config: args.get("action_config").cloned(),
                        one_time: args.get("one_time").and_then(Value::as_bool),
                        enabled: args.get("enabled").and_then(Value::as_bool),
                    },
                )
                .map_err(storage_err(tool))?,
            };
            Ok(ToolOutput::text(if updated {
                format!("Updated automation {id}.")
            } else {
                format!("Automation {id} not found.")
            }))
        })
    })
}

// ── delete / enable / stats ──────────────────────────────────────────────────

fn delete_definition() -> ToolDefinition {
    ToolDefinition::new(
        "delete_automation",
        "Delete an automation. Schedule automations also cancel their pending runs.",
        json!({
            "type": "object",
            "properties": {
                "automation_id": {"type": "integer"},
                "automation_type": {"type": "string", "enum": ["event", "schedule"]}
            },
            "required": ["automation_id", "automation_type"]
        }),
    )
}

fn delete_handler(dispatcher: Arc<EventDispatcher>) -> ToolHandler {
    Box::new(move |args, ctx| {
        let dispatcher = dispatcher.clone();
        Box::pin(async move {
            let tool = "delete_automation";
            let id = parse_id(tool, args)?;
            let deleted = match parse_kind(tool, args)? {
                AutomationKind::Schedule => {
                    automations::delete_schedule(&ctx.db, id, &ctx.conversation_id)
                        .map_err(storage_err(tool))?
                }
                AutomationKind::Event => {
                    let listener =
                        automations::get_listener(&ctx.db, id, Some(&ctx.conversation_id))
                            .map_err(storage_err(tool))?;
                    let deleted = automations::delete_listener(&ctx.db, id, &ctx.conversation_id)
                        .map_err(storage_err(tool))?;
                    if let (true, Some(listener)) = (deleted, listener) {
                        dispatcher.unindex_listener(&listener.source_id, id);
                    }
                    deleted
                }
            };
            Ok(ToolOutput::text(if deleted {
                format!("Deleted automation {id}.")
            } else {
                format!("Automation {id} not found.")
            }))
        })
    })
}

fn set_enabled_definition() -> ToolDefinition {
    ToolDefinition::new(
        "set_automation_enabled",
        "Enable or disable an automation without deleting it.",
        json!({
            "type": "object",
            "properties": {
                "automation_id": {"type": "integer"},
                "automation_type": {"type": "string", "enum": ["event", "schedule"]},
                "enabled": {"type": "boolean"}
            },
            "required": ["automation_id", "automation_type", "enabled"]
        }),
    )
}

fn set_enabled_handler(dispatcher: Arc<EventDispatcher>) -> ToolHandler {
    Box::new(move |args, ctx| {
        let dispatcher = dispatcher.clone();
        Box::pin(async move {
            let tool = "set_automation_enabled";
            let id = parse_id(tool, args)?;
            let enabled = args
                .get("enabled")
                .and_then(Value::as_bool)
                .ok_or_else(|| ToolError::InvalidArguments {
                    tool: tool.to_string(),
                    detail: "missing required boolean argument 'enabled'".into(),
                })?;
            let changed = match parse_kind(tool, args)? {
                AutomationKind::Schedule => {
                    automations::set_schedule_enabled(&ctx.db, id, &ctx.conversation_id, enabled)
                        .map_err(storage_err(tool))?
                }
                AutomationKind::Event => {
                    let changed = automations::set_listener_enabled(
                        &ctx.db,
                        id,
                        &ctx.conversation_id,
                        enabled,
                    )
                    .map_err(storage_err(tool))?;
                    if changed {
                        if let Some(listener) = automations::get_listener(&ctx.db, id, None)
                            .map_err(storage_err(tool))?
                        {
                            if enabled {
                                dispatcher.index_listener(&listener.source_id, id);
                            } else {
                                dispatcher.unindex_listener(&listener.source_id, id);
                            }
                        }
                    }
                    changed
                }
            };
            Ok(ToolOutput::text(if changed {
                format!(
                    "Automation {id} is now {}.",
                    if enabled { "enabled" } else { "disabled" }
                )
            } else {
                format!("Automation {id} not found.")
            }))
        })
    })
}

fn stats_definition() -> ToolDefinition {
    ToolDefinition::new(
        "get_automation_stats",
        "Execution statistics and recent runs for a schedule automation.",
        json!({
            "type": "object",
            "properties": {"automation_id": {"type": "integer"}},
            "required": ["automation_id"]
        }),
    )
}

fn stats_handler() -> ToolHandler {
    Box::new(|args, ctx| {
        Box::pin(async move {
            let tool = "get_automation_stats";
            let id = parse_id(tool, args)?;
            let Some(automation) =
                automations::get_schedule(&ctx.db, id, Some(&ctx.conversation_id))
                    .map_err(storage_err(tool))?
            else {
                return Ok(ToolOutput::text(format!("Automation {id} not found.")));
            };
            let recent = haven_storage::tasks::list_for_automation(&ctx.db, id, 10)
                .map_err(storage_err(tool))?;
            let data = json!({
                "total_executions": automation.execution_count,
                "last_execution_at": automation.last_execution_at.map(|t| t.to_rfc3339()),
                "next_scheduled_at": automation.next_scheduled_at.map(|t| t.to_rfc3339()),
                "recent_executions": recent.iter().map(|t| json!({
                    "task_id": t.task_id,
                    "status": t.status.to_string(),
                    "scheduled_at": t.scheduled_at.to_rfc3339(),
                    "last_error": t.last_error,
                })).collect::<Vec<_>>(),
            });
            Ok(ToolOutput::text(serde_json::to_string_pretty(&data)?).with_data(data))
        })
    })
}

fn storage_err(tool: &str) -> impl Fn(haven_storage::StorageError) -> ToolError + '_ {
    move |e| ToolError::Execution {
        tool: tool.to_string(),
        detail: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use haven_queue::WorkerSignal;
    use haven_storage::Db;
    use haven_tools::{ToolExecutionContext, ToolsProvider};

    fn setup() -> (LocalToolsProvider, ToolExecutionContext) {
        let db = Db::open_in_memory().unwrap();
        let dir = std::env::temp_dir().join(format!("haven-auto-tools-{}", uuid::Uuid::new_v4()));
        let store = haven_attachments::BlobStore::new(&dir).unwrap();
        let registry =
            haven_attachments::AttachmentRegistry::new(db.clone(), store, "/attachments");
        let ctx = ToolExecutionContext::new("api", "c1", db.clone(), registry);

        let dispatcher = Arc::new(EventDispatcher::new(db, WorkerSignal::new(), None));
        let mut provider = LocalToolsProvider::new();
        register_automation_tools(&mut provider, dispatcher).unwrap();
        (provider, ctx)
    }

    #[tokio::test]
    async fn create_list_and_delete_schedule_automation() {
        let (provider, ctx) = setup();

        let out = provider
            .execute(
                "create_automation",
                &json!({
                    "name": "morning",
                    "automation_type": "schedule",
                    "trigger_config": {"recurrence_rule": "FREQ=DAILY;BYHOUR=7"},
                    "action_type": "wake_llm",
                    "action_config": {"context": "Daily briefing"},
                }),
                &ctx,
            )
            .await
            .unwrap();
        assert!(out.text.contains("Created schedule automation 'morning'"));

        // Duplicate name across variants is refused.
        let out = provider
            .execute(
                "create_automation",
                &json!({
                    "name": "morning",
                    "automation_type": "event",
                    "trigger_config": {"event_source": "webhook"},
                    "action_type": "script",
                    "action_config": {"script_code": "None"},
                }),
                &ctx,
            )
            .await
            .unwrap();
        assert!(out.text.contains("already exists"));

        let out = provider
            .execute("list_automations", &json!({}), &ctx)
            .await
            .unwrap();
        let data = out.data.unwrap();
        assert_eq!(data.as_array().unwrap().len(), 1);
        let id = data[0]["id"].as_i64().unwrap();

        let out = provider
            .execute(
                "delete_automation",
                &json!({"automation_id": id, "automation_type": "schedule"}),
                &ctx,
            )
            .await
            .unwrap();
        assert!(out.text.contains("Deleted"));

        let out = provider
            .execute("list_automations", &json!({}), &ctx)
            .await
            .unwrap();
        assert!(out.text.contains("No automations found"));
    }

    #[tokio::test]
    async fn unknown_event_source_is_reported() {
        let (provider, ctx) = setup();
        let out = provider
            .execute(
                "create_automation",
                &json!({
                    "name": "weird",
                    "automation_type": "event",
                    "trigger_config": {"event_source": "telepathy"},
                    "action_type": "script",
                    "action_config": {"script_code": "None"},
                }),
                &ctx,
            )
            .await
            .unwrap();
        assert!(out.text.contains("Unknown event source"));
    }

    #[tokio::test]
    async fn enable_disable_round_trip() {
        let (provider, ctx) = setup();
        provider
            .execute(
                "create_automation",
                &json!({
                    "name": "door",
                    "automation_type": "event",
                    "trigger_config": {
                        "event_source": "home_assistant",
                        "match_conditions": {"entity_id": "sensor.door"},
                    },
                    "action_type": "wake_llm",
                    "action_config": {"context": "door"},
                }),
                &ctx,
            )
            .await
            .unwrap();

        let out = provider
            .execute(
                "set_automation_enabled",
                &json!({"automation_id": 1, "automation_type": "event", "enabled": false}),
                &ctx,
            )
            .await
            .unwrap();
        assert!(out.text.contains("disabled"));

        let out = provider
            .execute(
                "get_automation",
                &json!({"automation_id": 1, "automation_type": "event"}),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(out.data.unwrap()["enabled"], false);
    }
}
