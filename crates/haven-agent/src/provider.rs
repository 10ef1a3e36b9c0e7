use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use haven_tools::ToolDefinition;

use crate::error::{AgentError, Result};

/// A tool call extracted from an LLM response, with arguments already
/// parsed out of the provider's JSON-string encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Standardized output of one LLM call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmOutput {
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRequest>,
    /// Provider-opaque usage/reasoning blob, stored verbatim in history.
    pub reasoning_info: Option<Value>,
}

impl LlmOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn tool_call(id: &str, name: &str, arguments: Value) -> Self {
        Self {
            content: None,
            tool_calls: vec![ToolCallRequest {
                id: id.to_string(),
                name: name.to_string(),
                arguments,
            }],
            reasoning_info: None,
        }
    }

    /// The raw tool-call structures as persisted in message history —
    /// provider wire format so the round trip is byte-exact.
    pub fn tool_calls_json(&self) -> Option<Value> {
        if self.tool_calls.is_empty() {
            return None;
        }
        Some(Value::Array(
            self.tool_calls
                .iter()
                .map(|call| {
                    serde_json::json!({
                        "id": call.id,
                        "type": "function",
                        "function": {
                            "name": call.name,
                            "arguments": call.arguments.to_string(),
                        }
                    })
                })
                .collect(),
        ))
    }
}

/// Incremental output from a streaming call.
#[derive(Debug, Clone)]
pub enum StreamDelta {
    Content(String),
}

/// What a provider's message format can carry. Drives the multimodal
/// adaptation of tool results.
#[derive(Debug, Clone, Copy)]
pub struct ProviderCapabilities {
    /// Tool messages may contain structured multimodal blocks.
    pub multimodal_tool_results: bool,
    /// User messages may carry images (as data URLs).
    pub image_input: bool,
}

impl Default for ProviderCapabilities {
    fn default() -> Self {
        Self {
            multimodal_tool_results: false,
            image_input: true,
        }
    }
}

/// Contract every LLM adapter implements. Messages travel in the
/// OpenAI-style wire shape (`{"role": …, "content": …}` JSON objects) —
/// the lingua franca the history layer stores.
#[async_trait]
pub trait LlmClient: Send + Sync {
    fn model(&self) -> &str;

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities::default()
    }

    async fn generate(
        &self,
        messages: &[Value],
        tools: &[ToolDefinition],
        tool_choice: &str,
    ) -> Result<LlmOutput>;

    /// Streaming variant. Default: one non-streaming call, content emitted
    /// as a single delta.
    async fn generate_stream(
        &self,
        messages: &[Value],
        tools: &[ToolDefinition],
        tool_choice: &str,
        tx: mpsc::Sender<StreamDelta>,
    ) -> Result<LlmOutput> {
        let output = self.generate(messages, tools, tool_choice).await?;
        if let Some(content) = &output.content {
            let _ = tx.send(StreamDelta::Content(content.clone())).await;
        }
        Ok(output)
    }
}

/// Parse provider-side tool calls (arguments as JSON strings) into
/// [`ToolCallRequest`]s.
pub fn parse_tool_calls(raw: &Value) -> Result<Vec<ToolCallRequest>> {
    let Some(calls) = raw.as_array() else {
        return Ok(Vec::new());
    };
    calls
        .iter()
        .map(|call| {
            let id = call
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| AgentError::Parse("tool call without id".into()))?
                .to_string();
            let function = call
                .get("function")
                .ok_or_else(|| AgentError::Parse("tool call without function".into()))?;
            let name = function
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| AgentError::Parse("tool call without name".into()))?
                .to_string();
            let arguments = match function.get("arguments") {
                Some(Value::String(s)) if !s.trim().is_empty() => serde_json::from_str(s)
                    .map_err(|e| {
                        AgentError::Parse(format!("tool call arguments are not JSON: {e}"))
                    })?,
                Some(Value::Object(map)) => Value::Object(map.clone()),
                _ => Value::Object(Default::default()),
            };
            Ok(ToolCallRequest {
                id,
                name,
                arguments,
            })
        })
        .collect()
}
