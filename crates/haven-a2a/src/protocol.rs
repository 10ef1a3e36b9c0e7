//! Wire types for the agent-to-agent protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use haven_storage::a2a_tasks::{A2aTaskRecord, A2aTaskState};

// JSON-RPC 2.0 error codes, plus the protocol-specific task errors.
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
pub const TASK_NOT_FOUND: i64 = -32001;
pub const TASK_NOT_CANCELABLE: i64 = -32002;

/// Incoming JSON-RPC request envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Outgoing JSON-RPC response envelope.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

impl JsonRpcResponse {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

/// The agent card served from /.well-known/.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCard {
    pub name: String,
    pub description: String,
    pub url: String,
    pub version: String,
    pub capabilities: AgentCapabilities,
    pub skills: Vec<AgentSkill>,
    pub default_input_modes: Vec<String>,
    pub default_output_modes: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCapabilities {
    pub streaming: bool,
    pub push_notifications: bool,
    pub state_transition_history: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentSkill {
    pub id: String,
    pub name: String,
    pub description: String,
}

/// One message part. Text and inline data are the supported kinds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Part {
    Text { text: String },
    Data { data: Value },
}

/// A protocol message (incoming user content or outgoing agent content).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub role: String,
    pub parts: Vec<Part>,
    pub message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
}

impl Message {
    /// Concatenated text content of all text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text { text } => Some(text.as_str()),
                Part::Data { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn agent_text(task_id: &str, context_id: &str, text: &str) -> Self {
        Self {
            role: "agent".to_string(),
            parts: vec![Part::Text {
                text: text.to_string(),
            }],
            message_id: uuid::Uuid::new_v4().to_string(),
            task_id: Some(task_id.to_string()),
            context_id: Some(context_id.to_string()),
        }
    }
}

/// Artifact produced by a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub artifact_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub parts: Vec<Part>,
}

impl Artifact {
    pub fn text(name: &str, text: &str) -> Self {
        Self {
            artifact_id: uuid::Uuid::new_v4().to_string(),
            name: Some(name.to_string()),
            parts: vec![Part::Text {
                text: text.to_string(),
            }],
        }
    }
}

/// The wire view of a task, built from its storage row.
pub fn task_to_wire(record: &A2aTaskRecord) -> Value {
    serde_json::json!({
        "kind": "task",
        "id": record.task_id,
        "contextId": record.context_id,
        "status": {"state": record.status.to_string()},
        "artifacts": record.artifacts,
        "history": record.history,
    })
}

/// SSE `status` event payload. `final: true` terminates the stream.
pub fn status_update(task_id: &str, context_id: &str, state: A2aTaskState, is_final: bool) -> Value {
    serde_json::json!({
        "kind": "status-update",
        "taskId": task_id,
        "contextId": context_id,
        "status": {"state": state.to_string()},
        "final": is_final,
    })
}

/// SSE `artifact` event payload.
pub fn artifact_update(
    task_id: &str,
    context_id: &str,
    artifact: &Artifact,
    append: bool,
    last_chunk: bool,
) -> Value {
    serde_json::json!({
        "kind": "artifact-update",
        "taskId": task_id,
        "contextId": context_id,
        "artifact": artifact,
        "append": append,
        "lastChunk": last_chunk,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_round_trip() {
        let raw = r#"{"jsonrpc":"2.0","id":1,"method":"message/send","params":{"message":{"role":"user","parts":[{"kind":"text","text":"hi"}],"messageId":"m1"}}}"#;
        let request: JsonRpcRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(request.method, "message/send");
        let message: Message =
            serde_json::from_value(request.params["message"].clone()).unwrap();
        assert_eq!(message.text(), "hi");
        assert_eq!(message.message_id, "m1");
    }

    #[test]
    fn response_shapes() {
        let ok = serde_json::to_value(JsonRpcResponse::ok(json!(1), json!({"x": 1}))).unwrap();
        assert_eq!(ok["jsonrpc"], "2.0");
        assert!(ok.get("error").is_none());

        let err = serde_json::to_value(JsonRpcResponse::err(
            json!(2),
            METHOD_NOT_FOUND,
            "no such method",
        ))
        .unwrap();
        assert_eq!(err["error"]["code"], -32601);
        assert!(err.get("result").is_none());
    }

    #[test]
    fn parts_tagged_by_kind() {
        let part: Part = serde_json::from_value(json!({"kind": "text", "text": "x"})).unwrap();
        assert_eq!(part, Part::Text { text: "x".into() });
        let wire = serde_json::to_value(&Part::Data { data: json!({"a": 1}) }).unwrap();
        assert_eq!(wire["kind"], "data");
    }

    #[test]
    fn mixed_parts_text_extraction() {
        let message = Message {
            role: "user".into(),
            parts: vec![
                Part::Text { text: "line 1".into() },
                Part::Data { data: json!({"k": "v"}) },
                Part::Text { text: "line 2".into() },
            ],
            message_id: "m".into(),
            task_id: None,
            context_id: None,
        };
        assert_eq!(message.text(), "line 1\nline 2");
    }
}
