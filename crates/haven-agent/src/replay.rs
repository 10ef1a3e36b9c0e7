//! Recording and playback LLM clients.
//!
//! The recording client proxies a real client and appends each interaction
//! to a JSON Lines file; the playback client replays a recording by exact
//! input match. The scripted client is the in-memory workhorse for tests:
//! it returns a queue of canned outputs in order.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, error, info};

use haven_tools::ToolDefinition;

use crate::error::{AgentError, Result};
use crate::provider::{LlmClient, LlmOutput, ProviderCapabilities};

/// Returns canned outputs in order; panics in tests when drained.
pub struct ScriptedClient {
    outputs: Mutex<VecDeque<LlmOutput>>,
    /// Inputs observed, for assertions.
    pub requests: Mutex<Vec<Vec<Value>>>,
    capabilities: ProviderCapabilities,
}

impl ScriptedClient {
    pub fn new(outputs: Vec<LlmOutput>) -> Self {
        Self {
            outputs: Mutex::new(outputs.into()),
            requests: Mutex::new(Vec::new()),
            capabilities: ProviderCapabilities::default(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: ProviderCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn remaining(&self) -> usize {
        self.outputs.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmClient for ScriptedClient {
    fn model(&self) -> &str {
        "scripted"
    }

    fn capabilities(&self) -> ProviderCapabilities {
        self.capabilities
    }

    async fn generate(
        &self,
        messages: &[Value],
        _tools: &[ToolDefinition],
        _tool_choice: &str,
    ) -> Result<LlmOutput> {
        self.requests.lock().unwrap().push(messages.to_vec());
        self.outputs
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| AgentError::Request("scripted client has no more outputs".into()))
    }
}

/// Proxies another client, appending `{input, output}` JSONL records.
pub struct RecordingClient<C: LlmClient> {
    inner: C,
    path: PathBuf,
}

impl<C: LlmClient> RecordingClient<C> {
    pub fn new(inner: C, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        info!(path = %path.display(), "recording LLM interactions");
        Self { inner, path }
    }
}

#[async_trait]
impl<C: LlmClient> LlmClient for RecordingClient<C> {
    fn model(&self) -> &str {
        self.inner.model()
    }

    fn capabilities(&self) -> ProviderCapabilities {
        self.inner.capabilities()
    }

    async fn generate(
        &self,
        messages: &[Value],
        tools: &[ToolDefinition],
        tool_choice: &str,
    ) -> Result<LlmOutput> {
        let output = self.inner.generate(messages, tools, tool_choice).await?;
        let record = json!({
            "input": {
                "messages": messages,
                "tools": tools,
                "tool_choice": tool_choice,
            },
            "output": output,
        });
        // Recording trouble must not fail the live call.
        if let Err(e) = append_line(&self.path, &record) {
            error!(path = %self.path.display(), error = %e, "failed to record interaction");
        }
        Ok(output)
    }
}

fn append_line(path: &PathBuf, record: &Value) -> std::io::Result<()> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{record}")
}

/// Replays a recording file by exact input match.
pub struct PlaybackClient {
    interactions: Vec<(Value, LlmOutput)>,
}

impl PlaybackClient {
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| AgentError::Request(format!("cannot read recording: {e}")))?;
        let mut interactions = Vec::new();
        for (line_no, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let record: Value = serde_json::from_str(line).map_err(|e| {
                AgentError::Parse(format!("bad recording line {}: {e}", line_no + 1))
            })?;
            let input = record
                .get("input")
                .cloned()
                .ok_or_else(|| AgentError::Parse("recording line without input".into()))?;
            let output: LlmOutput = serde_json::from_value(
                record
                    .get("output")
                    .cloned()
                    .ok_or_else(|| AgentError::Parse("recording line without output".into()))?,
            )?;
            interactions.push((input, output));
        }
        if interactions.is_empty() {
            return Err(AgentError::Request("recording file is empty".into()));
        }
        info!(count = interactions.len(), "playback client loaded");
        Ok(Self { interactions })
    }
}

#[async_trait]
impl LlmClient for PlaybackClient {
    fn model(&self) -> &str {
        "playback"
    }

    async fn generate(
        &self,
        messages: &[Value],
        tools: &[ToolDefinition],
        tool_choice: &str,
    ) -> Result<LlmOutput> {
        let current = json!({
            "messages": messages,
            "tools": tools,
            "tool_choice": tool_choice,
        });
        for (input, output) in &self.interactions {
            if input == &current {
                debug!("playback matched a recorded interaction");
                return Ok(output.clone());
            }
        }
        Err(AgentError::Request(
            "no recorded interaction matches the current input".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_then_playback_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.jsonl");

        let scripted = ScriptedClient::new(vec![LlmOutput::text("hello back")]);
        let recorder = RecordingClient::new(scripted, &path);
        let messages = vec![json!({"role": "user", "content": "hello"})];
        let live = recorder.generate(&messages, &[], "auto").await.unwrap();
        assert_eq!(live.content.as_deref(), Some("hello back"));

        let playback = PlaybackClient::load(&path).unwrap();
        let replayed = playback.generate(&messages, &[], "auto").await.unwrap();
        assert_eq!(replayed.content.as_deref(), Some("hello back"));

        // Different input: no match.
        let other = vec![json!({"role": "user", "content": "different"})];
        assert!(playback.generate(&other, &[], "auto").await.is_err());
    }

    #[tokio::test]
    async fn scripted_client_drains_in_order() {
        let client = ScriptedClient::new(vec![LlmOutput::text("one"), LlmOutput::text("two")]);
        assert_eq!(
            client.generate(&[], &[], "auto").await.unwrap().content.as_deref(),
            Some("one")
        );
        assert_eq!(
            client.generate(&[], &[], "auto").await.unwrap().content.as_deref(),
            Some("two")
        );
        assert!(client.generate(&[], &[], "auto").await.is_err());
    }
}
