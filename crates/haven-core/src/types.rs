use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Role of a message in the conversation log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
            Role::System => "system",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "tool" => Ok(Role::Tool),
            "system" => Ok(Role::System),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Lifecycle state of a queued task row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Done,
    Failed,
    Cancelled,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "done" => Ok(TaskStatus::Done),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Discriminator between the two automation variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutomationKind {
    Schedule,
    Event,
}

impl fmt::Display for AutomationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AutomationKind::Schedule => write!(f, "schedule"),
            AutomationKind::Event => write!(f, "event"),
        }
    }
}

impl std::str::FromStr for AutomationKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "schedule" => Ok(AutomationKind::Schedule),
            "event" => Ok(AutomationKind::Event),
            other => Err(format!("unknown automation kind: {other}")),
        }
    }
}

/// What an automation does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Wake the turn orchestrator with a configured context string.
    WakeLlm,
    /// Run a sandboxed script.
    Script,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::WakeLlm => write!(f, "wake_llm"),
            ActionKind::Script => write!(f, "script"),
        }
    }
}

impl std::str::FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "wake_llm" => Ok(ActionKind::WakeLlm),
            "script" => Ok(ActionKind::Script),
            other => Err(format!("unknown action kind: {other}")),
        }
    }
}

/// The task type each action kind maps onto in the queue.
impl ActionKind {
    pub fn task_type(&self) -> &'static str {
        match self {
            ActionKind::WakeLlm => "llm_callback",
            ActionKind::Script => "script_execution",
        }
    }
}

/// An event flowing from an event source into the dispatcher.
///
/// `payload` is untyped JSON so sources stay decoupled from listener
/// definitions — the match predicate addresses into it with dotted paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Source tag, e.g. "home_assistant", "document_indexing", "webhook".
    pub source: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: Value,
}

impl Event {
    pub fn new(source: impl Into<String>, payload: Value) -> Self {
        Self {
            source: source.into(),
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Full JSON view of the event including `source` and `timestamp`,
    /// as seen by match predicates and condition scripts.
    pub fn as_value(&self) -> Value {
        let mut v = match &self.payload {
            Value::Object(map) => Value::Object(map.clone()),
            other => serde_json::json!({ "data": other }),
        };
        if let Value::Object(map) = &mut v {
            map.insert("source".into(), Value::String(self.source.clone()));
            map.insert(
                "timestamp".into(),
                Value::String(self.timestamp.to_rfc3339()),
            );
        }
        v
    }
}
