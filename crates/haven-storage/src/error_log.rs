//! Append-only error log, fed by the tracing bridge in the binary.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;

use crate::db::{parse_ts, Db};
use crate::error::Result;

#[derive(Debug, Clone, Serialize)]
pub struct ErrorLogRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub logger_name: String,
    pub message: String,
    pub traceback: Option<String>,
}

pub fn append(
    db: &Db,
    level: &str,
    logger_name: &str,
    message: &str,
    traceback: Option<&str>,
) -> Result<i64> {
    let conn = db.lock();
    conn.execute(
        "INSERT INTO error_logs (timestamp, level, logger_name, message, traceback)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![Utc::now().to_rfc3339(), level, logger_name, message, traceback],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Most recent entries, newest first.
pub fn recent(db: &Db, limit: usize) -> Result<Vec<ErrorLogRecord>> {
    let conn = db.lock();
    let mut stmt = conn.prepare(
        "SELECT id, timestamp, level, logger_name, message, traceback
         FROM error_logs ORDER BY id DESC LIMIT ?1",
    )?;
    let rows = stmt
        .query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter()
        .map(|(id, ts, level, logger_name, message, traceback)| {
            Ok(ErrorLogRecord {
                id,
                timestamp: parse_ts("error_logs", &ts)?,
                level,
                logger_name,
                message,
                traceback,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_read_back() {
        let db = Db::open_in_memory().unwrap();
        append(&db, "error", "haven_queue::worker", "task failed", Some("trace")).unwrap();
        append(&db, "warn", "haven_tools", "denied tool", None).unwrap();

        let entries = recent(&db, 10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].level, "warn");
        assert_eq!(entries[1].traceback.as_deref(), Some("trace"));
    }
}
