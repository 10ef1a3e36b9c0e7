//! The host surface scripts can reach: curated tool, attachment, and wake
//! APIs, with the per-tool allow/deny policy enforced on every call.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value as Json};
use tracing::{info, warn};

use haven_tools::{ToolExecutionContext, ToolsProvider};

use crate::error::{Result, ScriptError};
use crate::value::ScriptValue;

/// What the interpreter asks of its host. `Ok(None)` means "not a host
/// name" and surfaces to the script as an undefined-name error.
#[async_trait]
pub trait ScriptHost: Send + Sync {
    async fn call(
        &self,
        name: &str,
        args: Vec<ScriptValue>,
        kwargs: Vec<(String, ScriptValue)>,
    ) -> Result<Option<ScriptValue>>;

    fn print(&self, text: &str);
}

/// A `wake_llm` request captured during a run. Contexts are returned as
/// part of the tool result, never invoked from inside the script.
#[derive(Debug, Clone)]
pub struct WakeRequest {
    pub context: Json,
    pub include_event: bool,
}

/// Tool visibility policy. `deny_all` takes precedence over `allowed`.
#[derive(Debug, Clone, Default)]
pub struct ToolPolicy {
    pub deny_all: bool,
    /// None = all tools visible; Some(set) = only these (empty = none).
    pub allowed: Option<HashSet<String>>,
}

impl ToolPolicy {
    pub fn deny_all() -> Self {
        Self {
            deny_all: true,
            allowed: None,
        }
    }

    pub fn allow_only(names: impl IntoIterator<Item = String>) -> Self {
        Self {
            deny_all: false,
            allowed: Some(names.into_iter().collect()),
        }
    }

    fn allows(&self, name: &str) -> bool {
        if self.deny_all {
            return false;
        }
        match &self.allowed {
            Some(set) => set.contains(name),
            None => true,
        }
    }
}

/// The concrete host wired to the active execution context.
pub struct SandboxHost {
    tools: Option<Arc<dyn ToolsProvider>>,
    ctx: Option<ToolExecutionContext>,
    policy: ToolPolicy,
    enable_print: bool,
    prints: Mutex<Vec<String>>,
    wakes: Mutex<Vec<WakeRequest>>,
}

impl SandboxHost {
    pub fn new(
        tools: Option<Arc<dyn ToolsProvider>>,
        ctx: Option<ToolExecutionContext>,
        policy: ToolPolicy,
        enable_print: bool,
    ) -> Self {
        Self {
            tools,
            ctx,
            policy,
            enable_print,
            prints: Mutex::new(Vec::new()),
            wakes: Mutex::new(Vec::new()),
        }
    }

    pub fn printed_lines(&self) -> Vec<String> {
        self.prints.lock().unwrap().clone()
    }

    pub fn wake_requests(&self) -> Vec<WakeRequest> {
        self.wakes.lock().unwrap().clone()
    }

    async fn visible_definitions(&self) -> Vec<haven_tools::ToolDefinition> {
        if self.policy.deny_all {
            return Vec::new();
        }
        let Some(tools) = &self.tools else {
            return Vec::new();
        };
        match tools.list_definitions().await {
            Ok(defs) => defs
                .into_iter()
                .filter(|d| self.policy.allows(&d.name))
                .collect(),
            Err(e) => {
                warn!(error = %e, "tools_list failed inside sandbox");
                Vec::new()
            }
        }
    }

    async fn execute_tool(&self, name: &str, args: Json) -> Result<ScriptValue> {
        if !self.policy.allows(name) {
            // Security-relevant: a script reached for something outside its
            // allow set. Log the attempted name.
            warn!(tool = %name, "script attempted to execute denied tool");
            return Err(ScriptError::exec(format!("Tool '{name}' is not allowed")));
        }
        let (Some(tools), Some(ctx)) = (&self.tools, &self.ctx) else {
            return Err(ScriptError::exec(format!(
                "Tool '{name}' is unavailable: no tools provider in this context"
            )));
        };
        match tools.execute(name, &args, ctx).await {
            Ok(output) => {
                // Scripts see the textual result; structured data rides along
                // when present so json_decode is unnecessary.
                if let Some(data) = output.data {
                    Ok(ScriptValue::from_json(&data))
                } else {
                    Ok(ScriptValue::Str(output.text))
                }
            }
            Err(e) => Err(ScriptError::exec(format!("Tool '{name}' failed: {e}"))),
        }
    }

    /// True when the composite surface knows this tool name at all (used
    /// for the direct-call sugar: enabled tools are callable as functions).
    async fn is_known_tool(&self, name: &str) -> bool {
        let Some(tools) = &self.tools else {
            return false;
        };
        match tools.list_definitions().await {
            Ok(defs) => defs.iter().any(|d| d.name == name),
            Err(_) => false,
        }
    }
}

fn kwargs_to_json(kwargs: Vec<(String, ScriptValue)>) -> Result<Json> {
    let mut map = serde_json::Map::new();
    for (key, value) in kwargs {
        map.insert(key, value.to_json()?);
    }
    Ok(Json::Object(map))
}

fn definition_to_value(def: &haven_tools::ToolDefinition) -> ScriptValue {
    ScriptValue::from_json(&json!({
        "name": def.name,
        "description": def.description,
        "parameters": def.parameters,
    }))
}

#[async_trait]
impl ScriptHost for SandboxHost {
    async fn call(
        &self,
        name: &str,
        args: Vec<ScriptValue>,
        kwargs: Vec<(String, ScriptValue)>,
    ) -> Result<Option<ScriptValue>> {
        match name {
            "tools_list" => {
                let defs = self.visible_definitions().await;
                Ok(Some(ScriptValue::List(
                    defs.iter().map(definition_to_value).collect(),
                )))
            }
            "tools_get" => {
                let Some(ScriptValue::Str(tool_name)) = args.first() else {
                    return Err(ScriptError::exec("tools_get(name) takes a tool name"));
                };
                let defs = self.visible_definitions().await;
                Ok(Some(
                    defs.iter()
                        .find(|d| &d.name == tool_name)
                        .map(definition_to_value)
                        .unwrap_or(ScriptValue::None),
                ))
            }
            "tools_execute" => {
                let Some(ScriptValue::Str(tool_name)) = args.first() else {
                    return Err(ScriptError::exec(
                        "tools_execute(name, **kwargs) takes a tool name",
                    ));
                };
                let tool_args = kwargs_to_json(kwargs)?;
                Ok(Some(self.execute_tool(tool_name, tool_args).await?))
            }
            "tools_execute_json" => {
                let (Some(ScriptValue::Str(tool_name)), Some(ScriptValue::Str(json_args))) =
                    (args.first(), args.get(1))
                else {
                    return Err(ScriptError::exec(
                        "tools_execute_json(name, json_args) takes a name and a JSON string",
                    ));
                };
                let tool_args: Json = serde_json::from_str(json_args).map_err(|e| {
                    ScriptError::exec(format!("tools_execute_json: invalid JSON args: {e}"))
                })?;
                Ok(Some(self.execute_tool(tool_name, tool_args).await?))
            }
            "attachment_get" => {
                let Some(ScriptValue::Str(attachment_id)) = args.first() else {
                    return Err(ScriptError::exec("attachment_get(id) takes an attachment id"));
                };
                let Some(ctx) = &self.ctx else {
                    return Ok(Some(ScriptValue::None));
                };
                let meta = ctx
                    .attachments
                    .get_attachment(attachment_id)
                    .await
                    .map_err(|e| ScriptError::exec(format!("attachment lookup failed: {e}")))?;
                // Scripts only see attachments already visible to this
                // conversation; enumeration of other conversations is not
                // possible from the sandbox.
                let visible = meta
                    .as_ref()
                    .map(|m| m.conversation_id.as_deref() == Some(ctx.conversation_id.as_str()))
                    .unwrap_or(false);
                if !visible {
                    return Ok(Some(ScriptValue::None));
                }
                let meta = meta.expect("checked above");
                Ok(Some(ScriptValue::from_json(&json!({
                    "attachment_id": meta.attachment_id,
                    "source_type": meta.source_type.to_string(),
                    "source_id": meta.source_id,
                    "mime_type": meta.mime_type,
                    "description": meta.description,
                    "size": meta.size,
                    "conversation_id": meta.conversation_id,
                }))))
            }
            "wake_llm" => {
                let context = args
                    .first()
                    .map(|v| v.to_json())
                    .transpose()?
                    .unwrap_or(Json::Null);
                let include_event = kwargs
                    .iter()
                    .find(|(k, _)| k == "include_event")
                    .map(|(_, v)| v.truthy())
                    .or_else(|| args.get(1).map(|v| v.truthy()))
                    .unwrap_or(true);
                self.wakes.lock().unwrap().push(WakeRequest {
                    context,
                    include_event,
                });
                info!("script queued a wake_llm request");
                Ok(Some(ScriptValue::None))
            }
            // Direct tool sugar: enabled tools are callable as functions.
            other => {
                if self.is_known_tool(other).await {
                    let tool_args = kwargs_to_json(kwargs)?;
                    Ok(Some(self.execute_tool(other, tool_args).await?))
                } else {
                    Ok(None)
                }
            }
        }
    }

    fn print(&self, text: &str) {
        if self.enable_print {
            self.prints.lock().unwrap().push(text.to_string());
        }
    }
}
