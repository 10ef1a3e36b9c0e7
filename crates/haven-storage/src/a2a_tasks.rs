//! Persistence for agent-to-agent protocol tasks.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use serde_json::Value;

use crate::db::{parse_ts, Db};
use crate::error::{Result, StorageError};

/// Wire-protocol task state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum A2aTaskState {
    Submitted,
    Working,
    Completed,
    Failed,
    Canceled,
}

impl A2aTaskState {
    /// Terminal states cannot be cancelled.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            A2aTaskState::Completed | A2aTaskState::Failed | A2aTaskState::Canceled
        )
    }
}

impl std::fmt::Display for A2aTaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            A2aTaskState::Submitted => "submitted",
            A2aTaskState::Working => "working",
            A2aTaskState::Completed => "completed",
            A2aTaskState::Failed => "failed",
            A2aTaskState::Canceled => "canceled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for A2aTaskState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "submitted" => Ok(A2aTaskState::Submitted),
            "working" => Ok(A2aTaskState::Working),
            "completed" => Ok(A2aTaskState::Completed),
            "failed" => Ok(A2aTaskState::Failed),
            "canceled" => Ok(A2aTaskState::Canceled),
            other => Err(format!("unknown a2a task state: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct A2aTaskRecord {
    pub task_id: String,
    pub profile_id: Option<String>,
    pub conversation_id: String,
    pub context_id: String,
    pub status: A2aTaskState,
    pub artifacts: Value,
    pub history: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub fn create(
    db: &Db,
    task_id: &str,
    profile_id: Option<&str>,
    conversation_id: &str,
    context_id: &str,
) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    let conn = db.lock();
    conn.execute(
        "INSERT INTO a2a_tasks
         (task_id, profile_id, conversation_id, context_id, status,
          artifacts_json, history_json, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, 'submitted', '[]', '[]', ?5, ?5)",
        params![task_id, profile_id, conversation_id, context_id, now],
    )?;
    Ok(())
}

pub fn get(db: &Db, task_id: &str) -> Result<Option<A2aTaskRecord>> {
    let conn = db.lock();
    let raw = conn
        .query_row(
            "SELECT task_id, profile_id, conversation_id, context_id, status,
                    artifacts_json, history_json, created_at, updated_at
             FROM a2a_tasks WHERE task_id = ?1",
            params![task_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, String>(8)?,
                ))
            },
        )
        .optional()?;

    let Some((task_id, profile_id, conversation_id, context_id, status, artifacts, history, c, u)) =
        raw
    else {
        return Ok(None);
    };
    Ok(Some(A2aTaskRecord {
        status: status.parse().map_err(|detail| StorageError::CorruptRow {
            table: "a2a_tasks".into(),
            detail,
        })?,
        artifacts: serde_json::from_str(&artifacts)?,
        history: serde_json::from_str(&history)?,
        created_at: parse_ts("a2a_tasks", &c)?,
        updated_at: parse_ts("a2a_tasks", &u)?,
        task_id,
        profile_id,
        conversation_id,
        context_id,
    }))
}

pub fn set_status(db: &Db, task_id: &str, status: A2aTaskState) -> Result<bool> {
    let conn = db.lock();
    let n = conn.execute(
        "UPDATE a2a_tasks SET status = ?1, updated_at = ?2 WHERE task_id = ?3",
        params![status.to_string(), Utc::now().to_rfc3339(), task_id],
    )?;
    Ok(n > 0)
}

/// Replace the stored artifact list and append to history in one update.
pub fn finish(
    db: &Db,
    task_id: &str,
    status: A2aTaskState,
    artifacts: &Value,
    history: &Value,
) -> Result<bool> {
    let conn = db.lock();
    let n = conn.execute(
        "UPDATE a2a_tasks
         SET status = ?1, artifacts_json = ?2, history_json = ?3, updated_at = ?4
         WHERE task_id = ?5",
        params![
            status.to_string(),
            serde_json::to_string(artifacts)?,
            serde_json::to_string(history)?,
            Utc::now().to_rfc3339(),
            task_id
        ],
    )?;
    Ok(n > 0)
}

/// Mark canceled only while the task is still cancelable. Returns the state
/// the row was left in, or None when the id is unknown.
pub fn cancel(db: &Db, task_id: &str) -> Result<Option<A2aTaskState>> {
    let conn = db.lock();
    conn.execute(
        "UPDATE a2a_tasks SET status = 'canceled', updated_at = ?1
         WHERE task_id = ?2 AND status IN ('submitted', 'working')",
        params![Utc::now().to_rfc3339(), task_id],
    )?;
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM a2a_tasks WHERE task_id = ?1",
            params![task_id],
            |row| row.get(0),
        )
        .optional()?;
    status
        .map(|s| {
            s.parse().map_err(|detail| StorageError::CorruptRow {
                table: "a2a_tasks".into(),
                detail,
            })
        })
        .transpose()
}
