//! Built-in local tools: notes, attachments, and the script sandbox.

use serde_json::{json, Value};

use haven_core::HavenConfig;
use haven_scripting::{execute_script_definition, run_script_tool, ScriptConfig};
use haven_storage::notes;
use haven_tools::local::{require_str, LocalToolsProvider, ToolHandler};
use haven_tools::{ToolDefinition, ToolError, ToolOutput};

pub fn register_builtin_tools(
    provider: &mut LocalToolsProvider,
    config: &HavenConfig,
) -> haven_tools::Result<()> {
    provider.register(note_upsert_definition(), note_upsert_handler())?;
    provider.register(note_list_definition(), note_list_handler())?;
    provider.register(note_delete_definition(), note_delete_handler())?;
    provider.register(attachment_list_definition(), attachment_list_handler())?;
    provider.register(attachment_info_definition(), attachment_info_handler())?;
    provider.register(
        execute_script_definition(),
        execute_script_handler(config.scripting.max_execution_secs),
    )?;
    Ok(())
}

// ── Notes ────────────────────────────────────────────────────────────────────

fn note_upsert_definition() -> ToolDefinition {
    ToolDefinition::new(
        "add_or_update_note",
        "Create a note, or replace the note with the same title. Optional visibility \
         labels restrict who sees it; unlabelled notes are visible to everyone.",
        json!({
            "type": "object",
            "properties": {
                "title": {"type": "string"},
                "content": {"type": "string"},
                "visibility_labels": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["title", "content"]
        }),
    )
}

fn note_upsert_handler() -> ToolHandler {
    Box::new(|args, ctx| {
        Box::pin(async move {
            let title = require_str("add_or_update_note", args, "title")?;
            let content = require_str("add_or_update_note", args, "content")?;
            let labels: Vec<String> = args
                .get("visibility_labels")
                .and_then(Value::as_array)
                .map(|labels| {
                    labels
                        .iter()
                        .filter_map(Value::as_str)
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_else(|| ctx.default_note_visibility_labels.clone());
            notes::upsert(&ctx.db, title, content, &labels).map_err(|e| {
                ToolError::Execution {
                    tool: "add_or_update_note".into(),
                    detail: e.to_string(),
                }
            })?;
            Ok(ToolOutput::text(format!("Saved note '{title}'.")))
        })
    })
}

fn note_list_definition() -> ToolDefinition {
    ToolDefinition::new(
        "get_all_notes",
        "List the notes visible in this conversation (titles and contents).",
        json!({"type": "object", "properties": {}}),
    )
}

fn note_list_handler() -> ToolHandler {
    Box::new(|_args, ctx| {
        Box::pin(async move {
            let all = notes::get_all(&ctx.db, &ctx.visibility_grants).map_err(|e| {
                ToolError::Execution {
                    tool: "get_all_notes".into(),
                    detail: e.to_string(),
                }
            })?;
            if all.is_empty() {
                return Ok(ToolOutput::text("No notes found."));
            }
            let data = Value::Array(
                all.iter()
                    .map(|note| {
                        json!({
                            "title": note.title,
                            "content": note.content,
                            "visibility_labels": note.visibility_labels,
                        })
                    })
                    .collect(),
            );
            Ok(ToolOutput::text(serde_json::to_string_pretty(&data)?).with_data(data))
        })
    })
}

fn note_delete_definition() -> ToolDefinition {
    ToolDefinition::new(
        "delete_note",
        "Delete a note by title.",
        json!({
            "type": "object",
            "properties": {"title": {"type": "string"}},
            "required": ["title"]
        }),
    )
}

fn note_delete_handler() -> ToolHandler {
    Box::new(|args, ctx| {
        Box::pin(async move {
            let title = require_str("delete_note", args, "title")?;
            let deleted = notes::delete(&ctx.db, title).map_err(|e| ToolError::Execution {
                tool: "delete_note".into(),
                detail: e.to_string(),
            })?;
            Ok(ToolOutput::text(if deleted {
                format!("Deleted note '{title}'.")
            } else {
                format!("No note titled '{title}'.")
            }))
        })
    })
}

// ── Attachments ──────────────────────────────────────────────────────────────

fn attachment_list_definition() -> ToolDefinition {
    ToolDefinition::new(
        "list_attachments",
        "List attachments in this conversation, most recent first.",
        json!({
            "type": "object",
            "properties": {"limit": {"type": "integer", "default": 20}}
        }),
    )
}

fn attachment_list_handler() -> ToolHandler {
    Box::new(|args, ctx| {
        Box::pin(async move {
            let limit = args
                .get("limit")
                .and_then(Value::as_u64)
                .unwrap_or(20)
                .min(100) as usize;
            let items = ctx
                .attachments
                .list_attachments(Some(&ctx.conversation_id), None, limit)
                .await
                .map_err(|e| ToolError::Execution {
                    tool: "list_attachments".into(),
                    detail: e.to_string(),
                })?;
            if items.is_empty() {
                return Ok(ToolOutput::text("No attachments in this conversation."));
            }
            let data = Value::Array(
                items
                    .iter()
                    .map(|meta| {
                        json!({
                            "attachment_id": meta.attachment_id,
                            "mime_type": meta.mime_type,
                            "description": meta.description,
                            "size": meta.size,
                        })
                    })
                    .collect(),
            );
            Ok(ToolOutput::text(serde_json::to_string_pretty(&data)?).with_data(data))
        })
    })
}

fn attachment_info_definition() -> ToolDefinition {
    ToolDefinition::new(
        "get_attachment_info",
        "Get metadata for one attachment by id.",
        json!({
            "type": "object",
            "properties": {"attachment_id": {"type": "string"}},
            "required": ["attachment_id"]
        }),
    )
}

fn attachment_info_handler() -> ToolHandler {
    Box::new(|args, ctx| {
        Box::pin(async move {
            let id = require_str("get_attachment_info", args, "attachment_id")?;
            let meta = ctx.attachments.get_attachment(id).await.map_err(|e| {
                ToolError::Execution {
                    tool: "get_attachment_info".into(),
                    detail: e.to_string(),
                }
            })?;
            match meta {
                Some(meta) => {
                    let data = json!({
                        "attachment_id": meta.attachment_id,
                        "source_type": meta.source_type.to_string(),
                        "mime_type": meta.mime_type,
                        "description": meta.description,
                        "size": meta.size,
                        "conversation_id": meta.conversation_id,
                    });
                    Ok(ToolOutput::text(serde_json::to_string_pretty(&data)?).with_data(data))
                }
                None => Ok(ToolOutput::text(format!("Attachment {id} not found."))),
            }
        })
    })
}

// ── Scripts ──────────────────────────────────────────────────────────────────

fn execute_script_handler(max_execution_secs: u64) -> ToolHandler {
    Box::new(move |args, ctx| {
        Box::pin(async move {
            let script = require_str("execute_script", args, "script")?;
            let globals = args.get("globals").cloned();
            let config = ScriptConfig {
                max_execution_secs,
                ..Default::default()
            };
            Ok(run_script_tool(config, ctx, script, globals.as_ref()).await)
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use haven_storage::Db;
    use haven_tools::{ToolExecutionContext, ToolsProvider};
    use std::sync::Arc;

    fn setup() -> (Arc<LocalToolsProvider>, ToolExecutionContext) {
        let db = Db::open_in_memory().unwrap();
        let dir = std::env::temp_dir().join(format!("haven-server-tools-{}", uuid::Uuid::new_v4()));
        let store = haven_attachments::BlobStore::new(&dir).unwrap();
        let registry =
            haven_attachments::AttachmentRegistry::new(db.clone(), store, "/attachments");
        let mut provider = LocalToolsProvider::new();
        register_builtin_tools(&mut provider, &HavenConfig::default()).unwrap();
        let provider = Arc::new(provider);
        let ctx = ToolExecutionContext::new("api", "c1", db, registry)
            .with_tools_provider(provider.clone());
        (provider, ctx)
    }

    #[tokio::test]
    async fn note_round_trip_through_tools() {
        let (provider, ctx) = setup();
        provider
            .execute(
                "add_or_update_note",
                &json!({"title": "Groceries", "content": "milk, eggs"}),
                &ctx,
            )
            .await
            .unwrap();

        let out = provider
            .execute("get_all_notes", &json!({}), &ctx)
            .await
            .unwrap();
        assert!(out.text.contains("Groceries"));

        let out = provider
            .execute("delete_note", &json!({"title": "Groceries"}), &ctx)
            .await
            .unwrap();
        assert!(out.text.contains("Deleted"));
    }

    #[tokio::test]
    async fn labelled_notes_hidden_without_grants() {
        let (provider, ctx) = setup();
        provider
            .execute(
                "add_or_update_note",
                &json!({"title": "Private", "content": "…", "visibility_labels": ["adults"]}),
                &ctx,
            )
            .await
            .unwrap();
        let out = provider
            .execute("get_all_notes", &json!({}), &ctx)
            .await
            .unwrap();
        assert!(out.text.contains("No notes found"));
    }

    #[tokio::test]
    async fn execute_script_reaches_other_tools() {
        let (provider, ctx) = setup();
        let out = provider
            .execute(
                "execute_script",
                &json!({
                    "script": "add_or_update_note(title=\"From script\", content=\"hi\")\ntools_list()",
                }),
                &ctx,
            )
            .await
            .unwrap();
        assert!(out.text.contains("Script result"), "{}", out.text);

        let out = provider
            .execute("get_all_notes", &json!({}), &ctx)
            .await
            .unwrap();
        assert!(out.text.contains("From script"));
    }
}
