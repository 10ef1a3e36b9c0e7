//! OpenAI-compatible chat-completions adapter — the one concrete provider
//! the core ships. Anything speaking the same wire shape (many local
//! servers do) can be pointed at via `base_url`/`chat_path`.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use haven_core::config::LlmConfig;
use haven_tools::ToolDefinition;

use crate::error::{AgentError, Result};
use crate::provider::{parse_tool_calls, LlmClient, LlmOutput, ProviderCapabilities};

pub struct OpenAiClient {
    client: reqwest::Client,
    api_key: String,
    url: String,
    model: String,
    /// Extra request-body parameters from the active profile.
    params: serde_json::Map<String, Value>,
    capabilities: ProviderCapabilities,
}

impl OpenAiClient {
    pub fn new(config: &LlmConfig, timeout_secs: u64) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(timeout_secs))
                .build()
                .unwrap_or_default(),
            api_key: config.api_key.clone(),
            url: format!("{}{}", config.base_url, config.chat_path),
            model: config.model.clone(),
            params: serde_json::Map::new(),
            capabilities: ProviderCapabilities {
                multimodal_tool_results: false,
                image_input: true,
            },
        }
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    pub fn with_params(mut self, params: serde_json::Map<String, Value>) -> Self {
        self.params = params;
        self
    }

    fn build_body(
        &self,
        messages: &[Value],
        tools: &[ToolDefinition],
        tool_choice: &str,
    ) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": messages,
        });
        let map = body.as_object_mut().expect("body is an object");
        if !tools.is_empty() {
            map.insert(
                "tools".into(),
                Value::Array(
                    tools
                        .iter()
                        .map(|t| {
                            json!({
                                "type": "function",
                                "function": {
                                    "name": t.name,
                                    "description": t.description,
                                    "parameters": t.parameters,
                                }
                            })
                        })
                        .collect(),
                ),
            );
            map.insert("tool_choice".into(), Value::String(tool_choice.to_string()));
        }
        for (key, value) in &self.params {
            map.insert(key.clone(), value.clone());
        }
        body
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn model(&self) -> &str {
        &self.model
    }

    fn capabilities(&self) -> ProviderCapabilities {
        self.capabilities
    }

    async fn generate(
        &self,
        messages: &[Value],
        tools: &[ToolDefinition],
        tool_choice: &str,
    ) -> Result<LlmOutput> {
        let body = self.build_body(messages, tools, tool_choice);
        debug!(model = %self.model, messages = messages.len(), tools = tools.len(), "LLM request");

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    AgentError::Transient(e.to_string())
                } else {
                    AgentError::Request(e.to_string())
                }
            })?;

        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .map_err(|e| AgentError::Parse(format!("non-JSON provider response: {e}")))?;

        if !status.is_success() {
            let message = payload["error"]["message"]
                .as_str()
                .unwrap_or("unknown provider error")
                .to_string();
            warn!(status = %status, %message, "LLM provider error");
            return Err(if status.as_u16() == 429 || status.is_server_error() {
                AgentError::Transient(format!("{status}: {message}"))
            } else {
                AgentError::Request(format!("{status}: {message}"))
            });
        }

        let message = payload["choices"]
            .get(0)
            .and_then(|c| c.get("message"))
            .ok_or_else(|| AgentError::Parse("response has no choices".into()))?;

        let content = message
            .get("content")
            .and_then(Value::as_str)
            .map(String::from);
        let tool_calls = message
            .get("tool_calls")
            .map(parse_tool_calls)
            .transpose()?
            .unwrap_or_default();
        let reasoning_info = payload.get("usage").cloned();

        Ok(LlmOutput {
            content,
            tool_calls,
            reasoning_info,
        })
    }
}
