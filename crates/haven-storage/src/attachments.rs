//! Attachment metadata rows. Blob content lives in the store owned by
//! `haven-attachments`; this module only tracks metadata and linkage.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::db::{parse_ts, Db};
use crate::error::{Result, StorageError};

/// Where an attachment came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    User,
    Tool,
    Script,
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceType::User => write!(f, "user"),
            SourceType::Tool => write!(f, "tool"),
            SourceType::Script => write!(f, "script"),
        }
    }
}

impl std::str::FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "user" => Ok(SourceType::User),
            "tool" => Ok(SourceType::Tool),
            "script" => Ok(SourceType::Script),
            other => Err(format!("unknown attachment source type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AttachmentMetadata {
    pub attachment_id: String,
    pub source_type: SourceType,
    /// User id, tool name, or script id.
    pub source_id: String,
    pub mime_type: String,
    pub description: String,
    pub size: u64,
    pub content_url: Option<String>,
    pub storage_path: Option<String>,
    /// None = unlinked staging area.
    pub conversation_id: Option<String>,
    pub message_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub accessed_at: Option<DateTime<Utc>>,
    pub metadata: Value,
}

const COLUMNS: &str = "attachment_id, source_type, source_id, mime_type, description, size, \
     content_url, storage_path, conversation_id, message_id, created_at, \
     accessed_at, metadata";

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Raw> {
    Ok(Raw {
        attachment_id: row.get(0)?,
        source_type: row.get(1)?,
        source_id: row.get(2)?,
        mime_type: row.get(3)?,
        description: row.get(4)?,
        size: row.get(5)?,
        content_url: row.get(6)?,
        storage_path: row.get(7)?,
        conversation_id: row.get(8)?,
        message_id: row.get(9)?,
        created_at: row.get(10)?,
        accessed_at: row.get(11)?,
        metadata: row.get(12)?,
    })
}

struct Raw {
    attachment_id: String,
    source_type: String,
    source_id: String,
    mime_type: String,
    description: String,
    size: i64,
    content_url: Option<String>,
    storage_path: Option<String>,
    conversation_id: Option<String>,
    message_id: Option<i64>,
    created_at: String,
    accessed_at: Option<String>,
    metadata: String,
}

impl Raw {
    fn into_record(self) -> Result<AttachmentMetadata> {
        Ok(AttachmentMetadata {
            source_type: self.source_type.parse().map_err(|detail| {
                StorageError::CorruptRow {
                    table: "attachment_metadata".into(),
                    detail,
                }
            })?,
            created_at: parse_ts("attachment_metadata", &self.created_at)?,
            accessed_at: self
                .accessed_at
                .as_deref()
                .map(|t| parse_ts("attachment_metadata", t))
                .transpose()?,
            metadata: serde_json::from_str(&self.metadata)?,
            attachment_id: self.attachment_id,
            source_id: self.source_id,
            mime_type: self.mime_type,
            description: self.description,
            size: self.size.max(0) as u64,
            content_url: self.content_url,
            storage_path: self.storage_path,
            conversation_id: self.conversation_id,
            message_id: self.message_id,
        })
    }
}

pub fn insert(db: &Db, meta: &AttachmentMetadata) -> Result<()> {
    let conn = db.lock();
    conn.execute(
        "INSERT INTO attachment_metadata
         (attachment_id, source_type, source_id, mime_type, description, size,
          content_url, storage_path, conversation_id, message_id, created_at,
          accessed_at, metadata)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)",
        params![
            meta.attachment_id,
            meta.source_type.to_string(),
            meta.source_id,
            meta.mime_type,
            meta.description,
            meta.size as i64,
            meta.content_url,
            meta.storage_path,
            meta.conversation_id,
            meta.message_id,
            meta.created_at.to_rfc3339(),
            meta.accessed_at.map(|t| t.to_rfc3339()),
            serde_json::to_string(&meta.metadata)?,
        ],
    )?;
    Ok(())
}

/// Fetch metadata without touching `accessed_at`.
pub fn get(db: &Db, attachment_id: &str) -> Result<Option<AttachmentMetadata>> {
    let conn = db.lock();
    let raw = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM attachment_metadata WHERE attachment_id = ?1"),
            params![attachment_id],
            map_row,
        )
        .optional()?;
    raw.map(Raw::into_record).transpose()
}

pub fn touch(db: &Db, attachment_id: &str, now: DateTime<Utc>) -> Result<()> {
    let conn = db.lock();
    conn.execute(
        "UPDATE attachment_metadata SET accessed_at = ?1 WHERE attachment_id = ?2",
        params![now.to_rfc3339(), attachment_id],
    )?;
    Ok(())
}

/// Most-recent-first listing with optional conversation / source filters.
pub fn list(
    db: &Db,
    conversation_id: Option<&str>,
    source_type: Option<SourceType>,
    limit: usize,
) -> Result<Vec<AttachmentMetadata>> {
    let conn = db.lock();
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM attachment_metadata
         WHERE (?1 IS NULL OR conversation_id = ?1)
           AND (?2 IS NULL OR source_type = ?2)
         ORDER BY created_at DESC LIMIT ?3"
    ))?;
    let rows = stmt
        .query_map(
            params![
                conversation_id,
                source_type.map(|s| s.to_string()),
                limit as i64
            ],
            map_row,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(Raw::into_record).collect()
}

/// Atomic delete of a *linked* attachment gated on conversation match.
pub fn delete_linked(db: &Db, attachment_id: &str, conversation_id: &str) -> Result<bool> {
    let conn = db.lock();
    let n = conn.execute(
        "DELETE FROM attachment_metadata
         WHERE attachment_id = ?1 AND conversation_id = ?2",
        params![attachment_id, conversation_id],
    )?;
    Ok(n > 0)
}

/// Atomic delete of an *unlinked* attachment gated on user ownership.
pub fn delete_unlinked(db: &Db, attachment_id: &str, user_id: &str) -> Result<bool> {
    let conn = db.lock();
    let n = conn.execute(
        "DELETE FROM attachment_metadata
         WHERE attachment_id = ?1 AND conversation_id IS NULL
           AND source_type = 'user' AND source_id = ?2",
        params![attachment_id, user_id],
    )?;
    Ok(n > 0)
}

/// Atomically claim an unlinked attachment for a conversation.
///
/// The single UPDATE only succeeds while the row is still unlinked and owned
/// by `required_source_id`, so exactly one of N concurrent claimers wins.
pub fn claim_unlinked(
    db: &Db,
    attachment_id: &str,
    conversation_id: &str,
    required_source_id: &str,
) -> Result<Option<AttachmentMetadata>> {
    let claimed = {
        let conn = db.lock();
        conn.execute(
            "UPDATE attachment_metadata SET conversation_id = ?1
             WHERE attachment_id = ?2 AND conversation_id IS NULL
               AND source_type = 'user' AND source_id = ?3",
            params![conversation_id, attachment_id, required_source_id],
        )?
    };
    if claimed == 0 {
        debug!(%attachment_id, "claim lost: already linked, missing, or not owned");
        return Ok(None);
    }
    get(db, attachment_id)
}

/// Unconditional linking (tool/script outputs joining a conversation).
pub fn update_conversation(db: &Db, attachment_id: &str, conversation_id: &str) -> Result<bool> {
    let conn = db.lock();
    let n = conn.execute(
        "UPDATE attachment_metadata SET conversation_id = ?1 WHERE attachment_id = ?2",
        params![conversation_id, attachment_id],
    )?;
    Ok(n > 0)
}

/// Attach a metadata row to the message it was delivered with.
pub fn link_to_message(db: &Db, attachment_id: &str, message_id: i64) -> Result<bool> {
    let conn = db.lock();
    let n = conn.execute(
        "UPDATE attachment_metadata SET message_id = ?1 WHERE attachment_id = ?2",
        params![message_id, attachment_id],
    )?;
    Ok(n > 0)
}

/// Distinct set of ids still referenced in metadata — the orphan sweep's
/// keep-list.
pub fn referenced_ids(db: &Db) -> Result<std::collections::HashSet<String>> {
    let conn = db.lock();
    let mut stmt = conn.prepare("SELECT DISTINCT attachment_id FROM attachment_metadata")?;
    let ids = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<_>>()?;
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn db() -> Db {
        Db::open_in_memory().unwrap()
    }

    fn meta(id: &str, conversation: Option<&str>) -> AttachmentMetadata {
        AttachmentMetadata {
            attachment_id: id.to_string(),
            source_type: SourceType::User,
            source_id: "alice".to_string(),
            mime_type: "image/png".to_string(),
            description: "a picture".to_string(),
            size: 1024,
            content_url: None,
            storage_path: Some(format!("/blobs/{id}")),
            conversation_id: conversation.map(String::from),
            message_id: None,
            created_at: Utc::now(),
            accessed_at: None,
            metadata: json!({"original_filename": "p.png"}),
        }
    }

    #[test]
    fn claim_succeeds_exactly_once() {
        let db = db();
        insert(&db, &meta("a1", None)).unwrap();

        let first = claim_unlinked(&db, "a1", "c1", "alice").unwrap();
        assert_eq!(first.unwrap().conversation_id.as_deref(), Some("c1"));

        // Second claim — even for a different conversation — loses.
        assert!(claim_unlinked(&db, "a1", "c2", "alice").unwrap().is_none());
    }

    #[test]
    fn claim_requires_ownership_and_unlinked() {
        let db = db();
        insert(&db, &meta("a1", None)).unwrap();
        insert(&db, &meta("a2", Some("c9"))).unwrap();

        assert!(claim_unlinked(&db, "a1", "c1", "mallory").unwrap().is_none());
        assert!(claim_unlinked(&db, "a2", "c1", "alice").unwrap().is_none());
        assert!(claim_unlinked(&db, "missing", "c1", "alice").unwrap().is_none());
    }

    #[test]
    fn delete_paths_are_scoped() {
        let db = db();
        insert(&db, &meta("linked", Some("c1"))).unwrap();
        insert(&db, &meta("staged", None)).unwrap();

        // Wrong conversation → no delete.
        assert!(!delete_linked(&db, "linked", "c2").unwrap());
        assert!(delete_linked(&db, "linked", "c1").unwrap());

        // Unlinked path checks ownership.
        assert!(!delete_unlinked(&db, "staged", "bob").unwrap());
        assert!(delete_unlinked(&db, "staged", "alice").unwrap());

        assert!(referenced_ids(&db).unwrap().is_empty());
    }

    #[test]
    fn list_filters_and_orders() {
        let db = db();
        let mut older = meta("a1", Some("c1"));
        older.created_at = Utc::now() - chrono::Duration::hours(1);
        insert(&db, &older).unwrap();
        insert(&db, &meta("a2", Some("c1"))).unwrap();
        let mut tool = meta("a3", Some("c1"));
        tool.source_type = SourceType::Tool;
        tool.source_id = "render_chart".into();
        insert(&db, &tool).unwrap();

        let all = list(&db, Some("c1"), None, 10).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].attachment_id, "a3");

        let tools_only = list(&db, Some("c1"), Some(SourceType::Tool), 10).unwrap();
        assert_eq!(tools_only.len(), 1);
        assert_eq!(tools_only[0].attachment_id, "a3");
    }
}
