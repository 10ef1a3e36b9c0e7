//! Append-only message history log.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};
use serde_json::Value;

use haven_core::types::Role;

use crate::db::{parse_ts, Db};
use crate::error::{Result, StorageError};

/// One row of the conversation log.
#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub internal_id: i64,
    pub interface_type: String,
    pub conversation_id: String,
    pub interface_message_id: Option<String>,
    pub turn_id: Option<String>,
    pub thread_root_id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub role: Role,
    pub content: String,
    /// Raw provider tool-call structures, stored verbatim.
    pub tool_calls: Option<Value>,
    pub tool_call_id: Option<String>,
    pub reasoning_info: Option<Value>,
    pub error_traceback: Option<String>,
    /// Attachment ids referenced by this message.
    pub attachments: Vec<String>,
}

/// Fields for one insert. `internal_id` is assigned by the database.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub interface_type: String,
    pub conversation_id: String,
    pub interface_message_id: Option<String>,
    pub turn_id: Option<String>,
    pub thread_root_id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub role: Role,
    pub content: String,
    pub tool_calls: Option<Value>,
    pub tool_call_id: Option<String>,
    pub reasoning_info: Option<Value>,
    pub error_traceback: Option<String>,
    pub attachments: Vec<String>,
}

impl NewMessage {
    pub fn text(
        interface_type: &str,
        conversation_id: &str,
        role: Role,
        content: impl Into<String>,
    ) -> Self {
        Self {
            interface_type: interface_type.to_string(),
            conversation_id: conversation_id.to_string(),
            interface_message_id: None,
            turn_id: None,
            thread_root_id: None,
            timestamp: Utc::now(),
            role,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
            reasoning_info: None,
            error_traceback: None,
            attachments: Vec::new(),
        }
    }
}

/// Append one message. Enforces the structural invariants:
/// `tool_call_id` iff role=tool, `tool_calls` only on role=assistant, and a
/// referenced `thread_root_id` must already exist.
pub fn add_message(db: &Db, msg: &NewMessage) -> Result<i64> {
    if (msg.role == Role::Tool) != msg.tool_call_id.is_some() {
        return Err(StorageError::CorruptRow {
            table: "message_history".into(),
            detail: "tool_call_id must be present exactly when role=tool".into(),
        });
    }
    if msg.tool_calls.is_some() && msg.role != Role::Assistant {
        return Err(StorageError::CorruptRow {
            table: "message_history".into(),
            detail: "tool_calls are only valid on assistant messages".into(),
        });
    }

    let conn = db.lock();

    if let Some(root) = msg.thread_root_id {
        let exists: Option<i64> = conn
            .query_row(
                "SELECT internal_id FROM message_history WHERE internal_id = ?1",
                params![root],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(StorageError::NotFound {
                entity: "thread root message",
                id: root.to_string(),
            });
        }
    }

    conn.execute(
        "INSERT INTO message_history
         (interface_type, conversation_id, interface_message_id, turn_id,
          thread_root_id, timestamp, role, content, tool_calls, tool_call_id,
          reasoning_info, error_traceback, attachments)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)",
        params![
            msg.interface_type,
            msg.conversation_id,
            msg.interface_message_id,
            msg.turn_id,
            msg.thread_root_id,
            msg.timestamp.to_rfc3339(),
            msg.role.to_string(),
            msg.content,
            msg.tool_calls
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            msg.tool_call_id,
            msg.reasoning_info
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            msg.error_traceback,
            serde_json::to_string(&msg.attachments)?,
        ],
    )?;

    Ok(conn.last_insert_rowid())
}

const MSG_COLUMNS: &str = "internal_id, interface_type, conversation_id, interface_message_id, \
     turn_id, thread_root_id, timestamp, role, content, tool_calls, \
     tool_call_id, reasoning_info, error_traceback, attachments";

fn map_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawMessage> {
    Ok(RawMessage {
        internal_id: row.get(0)?,
        interface_type: row.get(1)?,
        conversation_id: row.get(2)?,
        interface_message_id: row.get(3)?,
        turn_id: row.get(4)?,
        thread_root_id: row.get(5)?,
        timestamp: row.get(6)?,
        role: row.get(7)?,
        content: row.get(8)?,
        tool_calls: row.get(9)?,
        tool_call_id: row.get(10)?,
        reasoning_info: row.get(11)?,
        error_traceback: row.get(12)?,
        attachments: row.get(13)?,
    })
}

struct RawMessage {
    internal_id: i64,
    interface_type: String,
    conversation_id: String,
    interface_message_id: Option<String>,
    turn_id: Option<String>,
    thread_root_id: Option<i64>,
    timestamp: String,
    role: String,
    content: String,
    tool_calls: Option<String>,
    tool_call_id: Option<String>,
    reasoning_info: Option<String>,
    error_traceback: Option<String>,
    attachments: Option<String>,
}

impl RawMessage {
    fn into_record(self) -> Result<MessageRecord> {
        let role: Role = self
            .role
            .parse()
            .map_err(|detail| StorageError::CorruptRow {
                table: "message_history".into(),
                detail,
            })?;
        Ok(MessageRecord {
            internal_id: self.internal_id,
            interface_type: self.interface_type,
            conversation_id: self.conversation_id,
            interface_message_id: self.interface_message_id,
            turn_id: self.turn_id,
            thread_root_id: self.thread_root_id,
            timestamp: parse_ts("message_history", &self.timestamp)?,
            role,
            content: self.content,
            tool_calls: self
                .tool_calls
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            tool_call_id: self.tool_call_id,
            reasoning_info: self
                .reasoning_info
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            error_traceback: self.error_traceback,
            attachments: self
                .attachments
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?
                .unwrap_or_default(),
        })
    }
}

/// The most recent messages for a conversation, oldest first, bounded by
/// count and age. This is the orchestrator's history window.
pub fn recent(
    db: &Db,
    conversation_id: &str,
    max_messages: usize,
    max_age: Option<Duration>,
    now: DateTime<Utc>,
) -> Result<Vec<MessageRecord>> {
    let cutoff = max_age.map(|age| (now - age).to_rfc3339());
    let conn = db.lock();

    let mut stmt = conn.prepare(&format!(
        "SELECT {MSG_COLUMNS} FROM message_history
         WHERE conversation_id = ?1
           AND (?2 IS NULL OR timestamp >= ?2)
         ORDER BY timestamp DESC, internal_id DESC
         LIMIT ?3"
    ))?;
    let rows = stmt
        .query_map(
            params![conversation_id, cutoff, max_messages as i64],
            map_message,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut records = rows
        .into_iter()
        .map(RawMessage::into_record)
        .collect::<Result<Vec<_>>>()?;
    records.reverse();
    Ok(records)
}

/// All messages sharing one turn id, in causal (insert) order.
pub fn by_turn(db: &Db, turn_id: &str) -> Result<Vec<MessageRecord>> {
    let conn = db.lock();
    let mut stmt = conn.prepare(&format!(
        "SELECT {MSG_COLUMNS} FROM message_history
         WHERE turn_id = ?1 ORDER BY internal_id"
    ))?;
    let rows = stmt
        .query_map(params![turn_id], map_message)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(RawMessage::into_record).collect()
}

pub fn get(db: &Db, internal_id: i64) -> Result<Option<MessageRecord>> {
    let conn = db.lock();
    let raw = conn
        .query_row(
            &format!("SELECT {MSG_COLUMNS} FROM message_history WHERE internal_id = ?1"),
            params![internal_id],
            map_message,
        )
        .optional()?;
    raw.map(RawMessage::into_record).transpose()
}

/// Record which attachments ended up linked to an already stored message.
pub fn set_attachments(db: &Db, internal_id: i64, attachment_ids: &[String]) -> Result<()> {
    let conn = db.lock();
    conn.execute(
        "UPDATE message_history SET attachments = ?1 WHERE internal_id = ?2",
        params![serde_json::to_string(attachment_ids)?, internal_id],
    )?;
    Ok(())
}
