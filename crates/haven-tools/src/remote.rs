//! Remote tool servers.
//!
//! Two transports: a child process speaking line-delimited JSON-RPC on
//! stdin/stdout, and an HTTP endpoint taking the same envelope in a POST
//! body. Servers are connected at startup; their tool lists are aggregated
//! with first-wins duplicate handling and calls are dispatched by name.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{info, warn};

use async_trait::async_trait;

use haven_core::config::{resolve_secret, RemoteToolServerConfig, RemoteToolTransport};

use crate::context::ToolExecutionContext;
use crate::error::{Result, ToolError};
use crate::provider::ToolsProvider;
use crate::types::{ToolDefinition, ToolOutput};

const PROTOCOL_VERSION: &str = "2024-11-05";

struct StdioTransport {
    child: Mutex<Child>,
    writer: Mutex<FramedWrite<ChildStdin, LinesCodec>>,
    reader: Mutex<FramedRead<ChildStdout, LinesCodec>>,
}

struct HttpTransport {
    client: reqwest::Client,
    url: String,
    secret: Option<String>,
}

enum Transport {
    Stdio(StdioTransport),
    Http(HttpTransport),
}

struct ServerHandle {
    name: String,
    transport: Transport,
    next_id: AtomicU64,
}

impl ServerHandle {
    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let envelope = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = match &self.transport {
            Transport::Stdio(stdio) => {
                let line = serde_json::to_string(&envelope)?;
                stdio
                    .writer
                    .lock()
                    .await
                    .send(line)
                    .await
                    .map_err(|e| self.remote_err(format!("write failed: {e}")))?;

                // Read lines until the matching response id; servers may
                // interleave notifications we don't care about.
                let mut reader = stdio.reader.lock().await;
                loop {
                    let Some(line) = reader.next().await else {
                        return Err(self.remote_err("server closed its stdout".into()));
                    };
                    let line = line.map_err(|e| self.remote_err(format!("read failed: {e}")))?;
                    let Ok(value) = serde_json::from_str::<Value>(&line) else {
                        warn!(server = %self.name, "skipping non-JSON line from server");
                        continue;
                    };
                    if value.get("id").and_then(Value::as_u64) == Some(id) {
                        break value;
                    }
                }
            }
            Transport::Http(http) => {
                let mut req = http.client.post(&http.url).json(&envelope);
                if let Some(secret) = &http.secret {
                    req = req.bearer_auth(secret);
                }
                let resp = req
                    .send()
                    .await
                    .map_err(|e| self.remote_err(format!("http error: {e}")))?;
                if !resp.status().is_success() {
                    return Err(self.remote_err(format!("http status {}", resp.status())));
                }
                resp.json()
                    .await
                    .map_err(|e| self.remote_err(format!("bad response body: {e}")))?
            }
        };

        if let Some(err) = response.get("error") {
            return Err(self.remote_err(format!("rpc error: {err}")));
        }
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }

    fn remote_err(&self, detail: String) -> ToolError {
        ToolError::Remote {
            server: self.name.clone(),
            detail,
        }
    }
}

/// Aggregates every configured remote tool server behind the provider trait.
pub struct RemoteToolsProvider {
    servers: Vec<ServerHandle>,
    /// tool name → index into `servers` (first source wins).
    routing: HashMap<String, usize>,
    definitions: Vec<ToolDefinition>,
}

impl RemoteToolsProvider {
    /// Spawn/connect every configured server, run the initialize handshake,
    /// and aggregate `tools/list` results.
    pub async fn connect(configs: &[RemoteToolServerConfig]) -> Result<Self> {
        let mut servers = Vec::new();

        for cfg in configs {
            match Self::connect_one(cfg).await {
                Ok(handle) => servers.push(handle),
                Err(e) => {
                    // One broken server must not take the whole surface down.
                    warn!(server = %cfg.name, error = %e, "remote tool server unavailable");
                }
            }
        }

        let mut provider = Self {
            servers,
            routing: HashMap::new(),
            definitions: Vec::new(),
        };
        provider.refresh_definitions().await?;
        Ok(provider)
    }

    async fn connect_one(cfg: &RemoteToolServerConfig) -> Result<ServerHandle> {
        let transport = match cfg.transport {
            RemoteToolTransport::Stdio => {
                let command = cfg.command.as_deref().ok_or_else(|| ToolError::Remote {
                    server: cfg.name.clone(),
                    detail: "stdio transport requires 'command'".into(),
                })?;
                let mut cmd = tokio::process::Command::new(command);
                cmd.args(&cfg.args)
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::null());
                for (key, value) in &cfg.env {
                    let resolved = resolve_secret(value).map_err(|e| ToolError::Remote {
                        server: cfg.name.clone(),
                        detail: e.to_string(),
                    })?;
                    cmd.env(key, resolved);
                }
                let mut child = cmd.spawn()?;
                let stdin = child.stdin.take().expect("piped stdin");
                let stdout = child.stdout.take().expect("piped stdout");
                Transport::Stdio(StdioTransport {
                    child: Mutex::new(child),
                    writer: Mutex::new(FramedWrite::new(stdin, LinesCodec::new())),
                    reader: Mutex::new(FramedRead::new(stdout, LinesCodec::new())),
                })
            }
            RemoteToolTransport::Http => {
                let url = cfg.url.clone().ok_or_else(|| ToolError::Remote {
                    server: cfg.name.clone(),
                    detail: "http transport requires 'url'".into(),
                })?;
                let secret = cfg
                    .secret
                    .as_deref()
                    .map(resolve_secret)
                    .transpose()
                    .map_err(|e| ToolError::Remote {
                        server: cfg.name.clone(),
                        detail: e.to_string(),
                    })?;
                Transport::Http(HttpTransport {
                    client: reqwest::Client::new(),
                    url,
                    secret,
                })
            }
        };

        let handle = ServerHandle {
            name: cfg.name.clone(),
            transport,
            next_id: AtomicU64::new(1),
        };

        handle
            .request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "clientInfo": {"name": "haven", "version": env!("CARGO_PKG_VERSION")},
                    "capabilities": {},
                }),
            )
            .await?;
        info!(server = %handle.name, "remote tool server connected");
        Ok(handle)
    }

    async fn refresh_definitions(&mut self) -> Result<()> {
        self.routing.clear();
        self.definitions.clear();

        for (idx, server) in self.servers.iter().enumerate() {
            let result = match server.request("tools/list", json!({})).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(server = %server.name, error = %e, "tools/list failed");
                    continue;
                }
            };
            let Some(tools) = result.get("tools").and_then(Value::as_array) else {
                warn!(server = %server.name, "tools/list returned no tool array");
                continue;
            };
            for tool in tools {
                let Some(name) = tool.get("name").and_then(Value::as_str) else {
                    continue;
                };
                if self.routing.contains_key(name) {
                    warn!(tool = %name, server = %server.name, "duplicate remote tool skipped");
                    continue;
                }
                self.routing.insert(name.to_string(), idx);
                self.definitions.push(ToolDefinition {
                    name: name.to_string(),
                    description: tool
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    parameters: tool
                        .get("inputSchema")
                        .cloned()
                        .unwrap_or_else(|| json!({"type": "object"})),
                });
            }
        }
        info!(tools = self.definitions.len(), "remote tool definitions aggregated");
        Ok(())
    }
}

#[async_trait]
impl ToolsProvider for RemoteToolsProvider {
    async fn list_definitions(&self) -> Result<Vec<ToolDefinition>> {
        Ok(self.definitions.clone())
    }

    async fn execute(
        &self,
        name: &str,
        args: &Value,
        _ctx: &ToolExecutionContext,
    ) -> Result<ToolOutput> {
        let Some(&idx) = self.routing.get(name) else {
            return Err(ToolError::NotFound {
                name: name.to_string(),
            });
        };
        let server = &self.servers[idx];
        let result = server
            .request("tools/call", json!({"name": name, "arguments": args}))
            .await?;
        Ok(parse_call_result(&result))
    }

    async fn close(&self) {
        for server in &self.servers {
            if let Transport::Stdio(stdio) = &server.transport {
                let mut child = stdio.child.lock().await;
                if let Err(e) = child.kill().await {
                    warn!(server = %server.name, error = %e, "failed to kill tool server");
                }
            }
        }
    }
}

/// Normalize a `tools/call` result into a [`ToolOutput`]. Servers reply
/// either with a content-block list, a bare string, or arbitrary JSON.
fn parse_call_result(result: &Value) -> ToolOutput {
    if let Some(blocks) = result.get("content").and_then(Value::as_array) {
        let text = blocks
            .iter()
            .filter_map(|b| match b.get("type").and_then(Value::as_str) {
                Some("text") => b.get("text").and_then(Value::as_str).map(String::from),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        let mut out = ToolOutput::text(text);
        if result
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            out.text = format!("Error: {}", out.text);
        }
        return out;
    }
    match result {
        Value::String(s) => ToolOutput::text(s.clone()),
        Value::Null => ToolOutput::text(""),
        other => ToolOutput::text(other.to_string()).with_data(other.clone()),
    }
}
