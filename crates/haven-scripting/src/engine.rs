//! Script engine: parse → interpret under a wall-clock budget, plus the
//! `execute_script` tool adapter the orchestrator registers.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value as Json};
use tracing::error;

use haven_tools::{ToolAttachment, ToolExecutionContext, ToolOutput, ToolsProvider};

use crate::apis::{SandboxHost, ToolPolicy, WakeRequest};
use crate::error::{Result, ScriptError};
use crate::interp::{Env, Interpreter};
use crate::parser::parse;
use crate::value::ScriptValue;

#[derive(Debug, Clone)]
pub struct ScriptConfig {
    /// Wall-clock cap for one run.
    pub max_execution_secs: u64,
    pub policy: ToolPolicy,
    pub enable_print: bool,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            max_execution_secs: 600,
            policy: ToolPolicy::default(),
            enable_print: true,
        }
    }
}

/// Everything a finished run produced.
#[derive(Debug)]
pub struct ScriptOutcome {
    pub value: ScriptValue,
    pub prints: Vec<String>,
    pub wake_requests: Vec<WakeRequest>,
}

pub struct ScriptEngine {
    config: ScriptConfig,
}

impl ScriptEngine {
    pub fn new(config: ScriptConfig) -> Self {
        Self { config }
    }

    /// Parse and run `script` with `globals` bound at module scope.
    pub async fn evaluate(
        &self,
        script: &str,
        globals: &Json,
        tools: Option<Arc<dyn ToolsProvider>>,
        ctx: Option<ToolExecutionContext>,
    ) -> Result<ScriptOutcome> {
        let program = parse(script)?;

        let host = SandboxHost::new(
            tools,
            ctx,
            self.config.policy.clone(),
            self.config.enable_print,
        );

        let mut env_globals: HashMap<String, ScriptValue> = HashMap::new();
        if let Json::Object(map) = globals {
            for (key, value) in map {
                env_globals.insert(key.clone(), ScriptValue::from_json(value));
            }
        }
        let mut env = Env::new(env_globals);

        let mut interp = Interpreter::new(&host, self.config.max_execution_secs);
        let value = interp.run(&program, &mut env).await?;

        Ok(ScriptOutcome {
            value,
            prints: host.printed_lines(),
            wake_requests: host.wake_requests(),
        })
    }

}

/// Evaluate a listener condition script: the event is bound to `event` and
/// the run happens under a deny-all tool policy. Truthy result = condition
/// holds.
pub async fn evaluate_condition(script: &str, event: &Json, timeout_secs: u64) -> Result<bool> {
    let engine = ScriptEngine::new(ScriptConfig {
        max_execution_secs: timeout_secs,
        policy: ToolPolicy::deny_all(),
        enable_print: false,
    });
    let globals = json!({ "event": event });
    let outcome = engine.evaluate(script, &globals, None, None).await?;
    Ok(outcome.value.truthy())
}

/// Pull attachment ids out of a script's return value: a bare UUID string,
/// a list containing them, or a dict with `attachments`/`attachment_ids`
/// keys. Deduplicated preserving order.
pub fn extract_attachment_ids(value: &ScriptValue) -> Vec<String> {
    fn push_if_uuid(out: &mut Vec<String>, candidate: &ScriptValue) {
        if let ScriptValue::Str(s) = candidate {
            if uuid::Uuid::parse_str(s).is_ok() && !out.contains(s) {
                out.push(s.clone());
            }
        }
    }

    let mut ids = Vec::new();
    match value {
        ScriptValue::Str(_) => push_if_uuid(&mut ids, value),
        ScriptValue::List(items) => {
            for item in items {
                push_if_uuid(&mut ids, item);
            }
        }
        ScriptValue::Dict(_) => {
            for key in ["attachments", "attachment_ids"] {
                if let Some(ScriptValue::List(items)) = value.dict_get(key) {
                    for item in items {
                        push_if_uuid(&mut ids, item);
                    }
                }
            }
        }
        _ => {}
    }
    ids
}

/// Tool-call entry point: run a script and shape the outcome into a
/// [`ToolOutput`]. Script failures come back as an error *text* — the turn
/// continues, the model sees what went wrong.
pub async fn run_script_tool(
    config: ScriptConfig,
    ctx: &ToolExecutionContext,
    script: &str,
    globals: Option<&Json>,
) -> ToolOutput {
    let engine = ScriptEngine::new(config);
    let tools = ctx.tools_provider.clone();
    let empty = json!({});
    let globals = globals.unwrap_or(&empty);

    let outcome = match engine.evaluate(script, globals, tools, Some(ctx.clone())).await {
        Ok(outcome) => outcome,
        Err(e @ ScriptError::Syntax { .. }) => {
            error!(error = %e, "script failed to parse");
            return ToolOutput::text(format!("Error: {e}"));
        }
        Err(e @ ScriptError::Timeout { .. }) => {
            error!(error = %e, "script timed out");
            return ToolOutput::text(format!("Error: {e}"));
        }
        Err(e) => {
            error!(error = %e, "script execution failed");
            return ToolOutput::text(format!("Error: {e}"));
        }
    };

    let mut parts: Vec<String> = Vec::new();
    if !outcome.prints.is_empty() {
        parts.push(outcome.prints.join("\n"));
    }
    match &outcome.value {
        ScriptValue::None => {
            parts.push("Script executed successfully with no return value.".to_string())
        }
        value @ (ScriptValue::Dict(_) | ScriptValue::List(_)) => {
            let pretty = value
                .to_json()
                .and_then(|j| {
                    serde_json::to_string_pretty(&j)
                        .map_err(|e| ScriptError::exec(e.to_string()))
                })
                .unwrap_or_else(|_| value.to_string());
            parts.push(format!("Script result:\n{pretty}"));
        }
        value => parts.push(format!("Script result: {}", value.to_display_string())),
    }

    if !outcome.wake_requests.is_empty() {
        parts.push("\n--- Wake LLM Contexts ---".to_string());
        for (i, wake) in outcome.wake_requests.iter().enumerate() {
            parts.push(format!(
                "\nWake Context {}:\nInclude Event: {}\nContext: {}",
                i + 1,
                wake.include_event,
                wake.context
            ));
        }
    }

    let attachments: Vec<ToolAttachment> = extract_attachment_ids(&outcome.value)
        .into_iter()
        .map(|attachment_id| ToolAttachment {
            attachment_id,
            // Reference only; the registry knows the real type.
            mime_type: "application/octet-stream".to_string(),
        })
        .collect();

    let data = match &outcome.value {
        v @ (ScriptValue::Dict(_) | ScriptValue::List(_)) => v.to_json().ok(),
        _ => None,
    };

    let mut output = ToolOutput::text(parts.join("\n"));
    output.attachments = attachments;
    output.data = data;
    output
}

/// Definition for registering `execute_script` with the local provider.
pub fn execute_script_definition() -> haven_tools::ToolDefinition {
    haven_tools::ToolDefinition::new(
        "execute_script",
        "Execute a script in a sandboxed environment for automation and complex operations.\n\
         The language is Python-flavoured but restricted: no while loops, no try/except,\n\
         no imports, no classes; if/for only inside functions; integer division uses //.\n\
         Builtins: type conversions, len/range/sorted/reversed/enumerate/zip, all/any/max/min,\n\
         type(), print(), fail(), json_encode(), json_decode().\n\
         Tool API: tools_list(), tools_get(name), tools_execute(name, **kwargs),\n\
         tools_execute_json(name, json_args); enabled tools are also callable directly\n\
         as functions. Attachment API: attachment_get(attachment_id). Wake API:\n\
         wake_llm(context, include_event=True) queues a follow-up request for the assistant.\n\
         The value of the last top-level expression is the script result.",
        json!({
            "type": "object",
            "properties": {
                "script": {
                    "type": "string",
                    "description": "The script code to execute."
                },
                "globals": {
                    "type": "object",
                    "description": "Optional global variables injected into the script scope.",
                    "additionalProperties": true
                }
            },
            "required": ["script"]
        }),
    )
}
