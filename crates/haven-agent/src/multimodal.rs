//! Per-provider adaptation of tool results that carry binary attachments.
//!
//! Providers with multimodal tool support get structured blocks inlined
//! into the tool message; providers without get a textual tool message
//! plus an immediately-following user message carrying the actual binary.

use base64::Engine;
use serde_json::{json, Value};
use tracing::warn;

use haven_attachments::AttachmentRegistry;
use haven_tools::ToolOutput;

use crate::provider::ProviderCapabilities;

/// Bodies at or under this size are inlined verbatim.
pub const INLINE_LIMIT: usize = 10 * 1024;

/// The provider-ready messages for one executed tool call.
#[derive(Debug, Clone)]
pub struct AdaptedToolResult {
    pub tool_message: Value,
    /// Binary carrier for providers without multimodal tool messages.
    pub follow_up_user_message: Option<Value>,
}

pub async fn adapt_tool_result(
    caps: ProviderCapabilities,
    tool_call_id: &str,
    output: &ToolOutput,
    registry: &AttachmentRegistry,
) -> AdaptedToolResult {
    if output.attachments.is_empty() {
        return AdaptedToolResult {
            tool_message: json!({
                "role": "tool",
                "tool_call_id": tool_call_id,
                "content": output.text,
            }),
            follow_up_user_message: None,
        };
    }

    let mut inline_blocks: Vec<Value> = vec![json!({"type": "text", "text": output.text})];
    let mut textual_lines: Vec<String> = vec![output.text.clone()];
    let mut follow_up_blocks: Vec<Value> = Vec::new();

    for reference in &output.attachments {
        let id = &reference.attachment_id;
        let meta = match registry.get_attachment(id).await {
            Ok(Some(meta)) => meta,
            Ok(None) => {
                warn!(attachment_id = %id, "tool result references unknown attachment");
                textual_lines.push(format!("[attachment {id}: metadata missing]"));
                continue;
            }
            Err(e) => {
                warn!(attachment_id = %id, error = %e, "attachment lookup failed");
                textual_lines.push(format!("[attachment {id}: unavailable]"));
                continue;
            }
        };

        let summary_line = format!(
            "[attachment {id}: {mime}, {size} bytes — {desc}]",
            mime = meta.mime_type,
            size = meta.size,
            desc = meta.description
        );
        textual_lines.push(summary_line.clone());

        let content = registry.get_attachment_content(id).await.ok().flatten();
        let block = attachment_block(&meta.mime_type, id, meta.size, content.as_deref(), caps);

        if caps.multimodal_tool_results {
            inline_blocks.push(block);
        } else {
            follow_up_blocks.push(json!({
                "type": "text",
                "text": format!("Content of attachment {id} ({mime}):", mime = meta.mime_type),
            }));
            follow_up_blocks.push(block);
        }
    }

    if caps.multimodal_tool_results {
        AdaptedToolResult {
            tool_message: json!({
                "role": "tool",
                "tool_call_id": tool_call_id,
                "content": inline_blocks,
            }),
            follow_up_user_message: None,
        }
    } else {
        AdaptedToolResult {
            tool_message: json!({
                "role": "tool",
                "tool_call_id": tool_call_id,
                "content": textual_lines.join("\n"),
            }),
            follow_up_user_message: Some(json!({
                "role": "user",
                "content": follow_up_blocks,
            })),
        }
    }
}

/// Render one attachment as a provider content block, applying the inline
/// size policy.
fn attachment_block(
    mime_type: &str,
    attachment_id: &str,
    size: u64,
    content: Option<&[u8]>,
    caps: ProviderCapabilities,
) -> Value {
    let Some(content) = content else {
        return json!({
            "type": "text",
            "text": format!("[attachment {attachment_id}: content unavailable]"),
        });
    };

    if is_json_mime(mime_type) {
        return json_block(attachment_id, content);
    }

    if mime_type.starts_with("text/") {
        if content.len() <= INLINE_LIMIT {
            let text = String::from_utf8_lossy(content);
            return json!({"type": "text", "text": text});
        }
        return json!({
            "type": "text",
            "text": format!(
                "[attachment {attachment_id}: {mime_type}, {size} bytes — too large to inline; \
                 request it by attachment id]"
            ),
        });
    }

    if mime_type.starts_with("image/") && caps.image_input {
        let encoded = base64::engine::general_purpose::STANDARD.encode(content);
        return json!({
            "type": "image_url",
            "image_url": {"url": format!("data:{mime_type};base64,{encoded}")},
        });
    }

    if mime_type == "application/pdf" && caps.multimodal_tool_results {
        let encoded = base64::engine::general_purpose::STANDARD.encode(content);
        return json!({
            "type": "file",
            "file": {"file_data": format!("data:{mime_type};base64,{encoded}")},
        });
    }

    json!({
        "type": "text",
        "text": format!("[attachment {attachment_id}: {mime_type}, {size} bytes — binary content]"),
    })
}

fn json_block(attachment_id: &str, content: &[u8]) -> Value {
    if content.len() <= INLINE_LIMIT {
        let text = String::from_utf8_lossy(content);
        return json!({"type": "text", "text": text});
    }
    // Large JSON: a structural schema instead of the body.
    match serde_json::from_slice::<Value>(content) {
        Ok(parsed) => {
            let schema = induce_schema(&parsed, 0);
            json!({
                "type": "text",
                "text": format!(
                    "[attachment {attachment_id}: large JSON ({} bytes). Structural summary:\n{}\n\
                     Query specific fields by attachment id instead of loading the whole body.]",
                    content.len(),
                    serde_json::to_string_pretty(&schema).unwrap_or_else(|_| "{}".into())
                ),
            })
        }
        Err(_) => json!({
            "type": "text",
            "text": format!(
                "[attachment {attachment_id}: {} bytes of malformed JSON]",
                content.len()
            ),
        }),
    }
}

/// Generate a JSON-Schema-shaped structural summary of a value. Arrays are
/// summarized from their first element; recursion is depth-capped.
pub fn induce_schema(value: &Value, depth: usize) -> Value {
    if depth > 6 {
        return json!({"type": "object"});
    }
    match value {
        Value::Null => json!({"type": "null"}),
        Value::Bool(_) => json!({"type": "boolean"}),
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                json!({"type": "integer"})
            } else {
                json!({"type": "number"})
            }
        }
        Value::String(_) => json!({"type": "string"}),
        Value::Array(items) => match items.first() {
            Some(first) => json!({
                "type": "array",
                "items": induce_schema(first, depth + 1),
                "length": items.len(),
            }),
            None => json!({"type": "array", "items": {}, "length": 0}),
        },
        Value::Object(map) => {
            let mut properties = serde_json::Map::new();
            for (key, val) in map {
                properties.insert(key.clone(), induce_schema(val, depth + 1));
            }
            json!({"type": "object", "properties": properties})
        }
    }
}

fn is_json_mime(mime_type: &str) -> bool {
    mime_type == "application/json" || mime_type.ends_with("+json")
}
