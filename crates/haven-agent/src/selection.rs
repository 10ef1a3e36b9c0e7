//! Attachment selection for the final reply.
//!
//! Few attachments are forwarded as-is; past the threshold the model picks
//! which ones belong on the reply via the `attach_to_response` selection
//! tool, with a first-N fallback when selection fails.

use serde_json::{json, Value};
use tracing::warn;

use haven_tools::ToolDefinition;

use crate::provider::LlmClient;

/// Name of the internal selection tool.
pub const SELECTION_TOOL: &str = "attach_to_response";

pub fn selection_tool_definition(max: usize) -> ToolDefinition {
    ToolDefinition::new(
        SELECTION_TOOL,
        format!(
            "Select up to {max} attachments (by id) to include with the reply to the user."
        ),
        json!({
            "type": "object",
            "properties": {
                "attachment_ids": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Ids of the attachments to forward, most relevant first."
                }
            },
            "required": ["attachment_ids"]
        }),
    )
}

/// Decide which of `pending` attachment ids accompany the reply.
pub async fn select_attachments(
    llm: &dyn LlmClient,
    reply_text: &str,
    pending: &[String],
    threshold: usize,
    max: usize,
) -> Vec<String> {
    if pending.len() <= threshold {
        return pending.to_vec();
    }

    let prompt = format!(
        "The reply below was produced together with {count} candidate attachments.\n\
         Reply:\n{reply_text}\n\nCandidate attachment ids:\n{ids}\n\n\
         Call {SELECTION_TOOL} with the ids (at most {max}) that should accompany the reply.",
        count = pending.len(),
        ids = pending.join("\n"),
    );
    let messages = vec![json!({"role": "user", "content": prompt})];
    let tools = vec![selection_tool_definition(max)];

    match llm.generate(&messages, &tools, "auto").await {
        Ok(output) => {
            let selected: Vec<String> = output
                .tool_calls
                .iter()
                .filter(|call| call.name == SELECTION_TOOL)
                .filter_map(|call| call.arguments.get("attachment_ids"))
                .filter_map(Value::as_array)
                .flatten()
                .filter_map(Value::as_str)
                // The model can only pick from what actually exists.
                .filter(|id| pending.iter().any(|p| p == id))
                .map(String::from)
                .collect();
            if selected.is_empty() {
                warn!("attachment selection returned nothing usable — falling back to first {max}");
                pending.iter().take(max).cloned().collect()
            } else {
                selected.into_iter().take(max).collect()
            }
        }
        Err(e) => {
            warn!(error = %e, "attachment selection call failed — falling back to first {max}");
            pending.iter().take(max).cloned().collect()
        }
    }
}
