use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tool definition sent to the LLM API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's parameters.
    pub parameters: Value,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// A binary artifact referenced by a tool result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolAttachment {
    pub attachment_id: String,
    pub mime_type: String,
}

/// Result of executing a tool: a text body plus optional structured data
/// and attachments. Cancellation (confirmation denied) is a normal value,
/// not an error — the orchestrator records it like any other tool message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<ToolAttachment>,
    #[serde(default)]
    pub cancelled: bool,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            data: None,
            attachments: Vec::new(),
            cancelled: false,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<ToolAttachment>) -> Self {
        self.attachments = attachments;
        self
    }

    /// The user declined (or the confirmation timed out).
    pub fn cancelled(action: &str) -> Self {
        Self {
            text: format!("OK. Action cancelled by user: {action}"),
            data: None,
            attachments: Vec::new(),
            cancelled: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_a_value() {
        let out = ToolOutput::cancelled("delete_calendar_event");
        assert!(out.cancelled);
        assert!(out.text.starts_with("OK. Action cancelled by user"));
    }

    #[test]
    fn output_serializes_compactly() {
        let out = ToolOutput::text("done");
        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(json["text"], "done");
        assert!(json.get("data").is_none());
        assert!(json.get("attachments").is_none());
    }
}
