//! Notes with label-based visibility.
//!
//! A note is visible under a grant set G iff its label set is a subset of G;
//! unlabelled notes are visible to everyone.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use std::collections::HashSet;

use crate::db::{parse_ts, Db};
use crate::error::Result;

#[derive(Debug, Clone, Serialize)]
pub struct NoteRecord {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub visibility_labels: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NoteRecord {
    /// Visibility rule: label set ⊆ grant set (empty label set always passes).
    pub fn visible_to(&self, grants: &HashSet<String>) -> bool {
        self.visibility_labels.iter().all(|l| grants.contains(l))
    }
}

/// Insert or replace by title.
pub fn upsert(
    db: &Db,
    title: &str,
    content: &str,
    visibility_labels: &[String],
) -> Result<i64> {
    let now = Utc::now().to_rfc3339();
    let conn = db.lock();
    conn.execute(
        "INSERT INTO notes (title, content, visibility_labels, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?4)
         ON CONFLICT(title) DO UPDATE SET
             content = excluded.content,
             visibility_labels = excluded.visibility_labels,
             updated_at = excluded.updated_at",
        params![title, content, serde_json::to_string(visibility_labels)?, now],
    )?;
    let id = conn.query_row(
        "SELECT id FROM notes WHERE title = ?1",
        params![title],
        |row| row.get(0),
    )?;
    Ok(id)
}

pub fn get_by_title(db: &Db, title: &str) -> Result<Option<NoteRecord>> {
    let conn = db.lock();
    let raw = conn
        .query_row(
            "SELECT id, title, content, visibility_labels, created_at, updated_at
             FROM notes WHERE title = ?1",
            params![title],
            map_row,
        )
        .optional()?;
    raw.map(into_record).transpose()
}

/// All notes visible under `grants`, most recently updated first.
pub fn get_all(db: &Db, grants: &HashSet<String>) -> Result<Vec<NoteRecord>> {
    let conn = db.lock();
    let mut stmt = conn.prepare(
        "SELECT id, title, content, visibility_labels, created_at, updated_at
         FROM notes ORDER BY updated_at DESC",
    )?;
    let rows = stmt
        .query_map([], map_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    let mut notes = Vec::new();
    for raw in rows {
        let note = into_record(raw)?;
        if note.visible_to(grants) {
            notes.push(note);
        }
    }
    Ok(notes)
}

pub fn delete(db: &Db, title: &str) -> Result<bool> {
    let conn = db.lock();
    let n = conn.execute("DELETE FROM notes WHERE title = ?1", params![title])?;
    Ok(n > 0)
}

type RawNote = (i64, String, String, String, String, String);

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawNote> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn into_record(raw: RawNote) -> Result<NoteRecord> {
    let (id, title, content, labels, created_at, updated_at) = raw;
    Ok(NoteRecord {
        id,
        title,
        content,
        visibility_labels: serde_json::from_str(&labels)?,
        created_at: parse_ts("notes", &created_at)?,
        updated_at: parse_ts("notes", &updated_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Db {
        Db::open_in_memory().unwrap()
    }

    fn grants(labels: &[&str]) -> HashSet<String> {
        labels.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn visibility_is_label_subset() {
        let db = db();
        upsert(&db, "open", "no labels", &[]).unwrap();
        upsert(&db, "family", "family only", &["family".into()]).unwrap();
        upsert(
            &db,
            "private",
            "both labels",
            &["family".into(), "adults".into()],
        )
        .unwrap();

        let none = get_all(&db, &grants(&[])).unwrap();
        assert_eq!(none.len(), 1);
        assert_eq!(none[0].title, "open");

        let fam = get_all(&db, &grants(&["family"])).unwrap();
        assert_eq!(fam.len(), 2);

        let all = get_all(&db, &grants(&["family", "adults"])).unwrap();
        assert_eq!(all.len(), 3);

        // A grant the note doesn't carry is irrelevant.
        let other = get_all(&db, &grants(&["guests"])).unwrap();
        assert_eq!(other.len(), 1);
    }

    #[test]
    fn upsert_replaces_by_title() {
        let db = db();
        let id1 = upsert(&db, "t", "v1", &[]).unwrap();
        let id2 = upsert(&db, "t", "v2", &[]).unwrap();
        assert_eq!(id1, id2);
        assert_eq!(get_by_title(&db, "t").unwrap().unwrap().content, "v2");
    }
}
