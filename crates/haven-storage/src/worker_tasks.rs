//! Tracking rows for external compute workers reporting over the webhook
//! ingress (`worker_completion` events).

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use crate::db::{parse_ts, Db};
use crate::error::Result;

#[derive(Debug, Clone, Serialize)]
pub struct WorkerTaskRecord {
    pub task_id: String,
    pub status: String,
    pub exit_code: Option<i64>,
    pub summary: Option<String>,
    pub output_files: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert or update by worker task id — completion webhooks may arrive for
/// tasks we never saw started.
pub fn upsert_completion(
    db: &Db,
    task_id: &str,
    status: &str,
    exit_code: Option<i64>,
    summary: Option<&str>,
    output_files: &[String],
) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    let conn = db.lock();
    conn.execute(
        "INSERT INTO worker_tasks
         (task_id, status, exit_code, summary, output_files, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
         ON CONFLICT(task_id) DO UPDATE SET
             status = excluded.status,
             exit_code = excluded.exit_code,
             summary = excluded.summary,
             output_files = excluded.output_files,
             updated_at = excluded.updated_at",
        params![
            task_id,
            status,
            exit_code,
            summary,
            serde_json::to_string(output_files)?,
            now
        ],
    )?;
    Ok(())
}

pub fn get(db: &Db, task_id: &str) -> Result<Option<WorkerTaskRecord>> {
    let conn = db.lock();
    let raw = conn
        .query_row(
            "SELECT task_id, status, exit_code, summary, output_files, created_at, updated_at
             FROM worker_tasks WHERE task_id = ?1",
            params![task_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            },
        )
        .optional()?;

    let Some((task_id, status, exit_code, summary, files, c, u)) = raw else {
        return Ok(None);
    };
    Ok(Some(WorkerTaskRecord {
        task_id,
        status,
        exit_code,
        summary,
        output_files: serde_json::from_str(&files)?,
        created_at: parse_ts("worker_tasks", &c)?,
        updated_at: parse_ts("worker_tasks", &u)?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_upsert() {
        let db = Db::open_in_memory().unwrap();
        upsert_completion(&db, "job-1", "running", None, None, &[]).unwrap();
        upsert_completion(
            &db,
            "job-1",
            "completed",
            Some(0),
            Some("done"),
            &["out.txt".to_string()],
        )
        .unwrap();

        let t = get(&db, "job-1").unwrap().unwrap();
        assert_eq!(t.status, "completed");
        assert_eq!(t.exit_code, Some(0));
        assert_eq!(t.output_files, vec!["out.txt"]);
    }
}
