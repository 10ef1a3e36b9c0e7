//! Task queue rows: enqueue, lease-based dequeue, retries, cancellation.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::{debug, info, warn};

use haven_core::types::TaskStatus;

use crate::db::{parse_ts, Db};
use crate::error::{Result, StorageError};

/// A persisted queue row.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub task_id: String,
    pub task_type: String,
    pub payload: Value,
    pub status: TaskStatus,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub worker_id: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub recurrence_rule: Option<String>,
    pub original_task_id: Option<String>,
}

/// Everything `enqueue` needs beyond the id/type/payload.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub scheduled_at: Option<DateTime<Utc>>,
    pub max_retries: Option<u32>,
    pub recurrence_rule: Option<String>,
    pub original_task_id: Option<String>,
}

const TASK_COLUMNS: &str = "task_id, task_type, payload, status, scheduled_at, created_at, \
     retry_count, max_retries, last_error, worker_id, lease_expires_at, \
     recurrence_rule, original_task_id";

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawTask> {
    Ok(RawTask {
        task_id: row.get(0)?,
        task_type: row.get(1)?,
        payload: row.get(2)?,
        status: row.get(3)?,
        scheduled_at: row.get(4)?,
        created_at: row.get(5)?,
        retry_count: row.get(6)?,
        max_retries: row.get(7)?,
        last_error: row.get(8)?,
        worker_id: row.get(9)?,
        lease_expires_at: row.get(10)?,
        recurrence_rule: row.get(11)?,
        original_task_id: row.get(12)?,
    })
}

struct RawTask {
    task_id: String,
    task_type: String,
    payload: String,
    status: String,
    scheduled_at: String,
    created_at: String,
    retry_count: u32,
    max_retries: u32,
    last_error: Option<String>,
    worker_id: Option<String>,
    lease_expires_at: Option<String>,
    recurrence_rule: Option<String>,
    original_task_id: Option<String>,
}

impl RawTask {
    fn into_record(self) -> Result<TaskRecord> {
        let status: TaskStatus =
            self.status
                .parse()
                .map_err(|detail| StorageError::CorruptRow {
                    table: "tasks".into(),
                    detail,
                })?;
        Ok(TaskRecord {
            status,
            payload: serde_json::from_str(&self.payload)?,
            scheduled_at: parse_ts("tasks", &self.scheduled_at)?,
            created_at: parse_ts("tasks", &self.created_at)?,
            lease_expires_at: self
                .lease_expires_at
                .as_deref()
                .map(|t| parse_ts("tasks", t))
                .transpose()?,
            task_id: self.task_id,
            task_type: self.task_type,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            last_error: self.last_error,
            worker_id: self.worker_id,
            recurrence_rule: self.recurrence_rule,
            original_task_id: self.original_task_id,
        })
    }
}

/// Insert a new queue row.
///
/// Idempotent on `task_id`: enqueueing an id that already exists is a no-op
/// and returns `false` — callers treat it as "already queued".
pub fn enqueue(
    db: &Db,
    task_id: &str,
    task_type: &str,
    payload: &Value,
    opts: EnqueueOptions,
) -> Result<bool> {
    let conn = db.lock();
    enqueue_on(&conn, task_id, task_type, payload, opts)
}

/// Transaction-scoped variant used when the enqueue must be atomic with
/// other writes (automation creation, one-time listener disable).
pub fn enqueue_on(
    conn: &Connection,
    task_id: &str,
    task_type: &str,
    payload: &Value,
    opts: EnqueueOptions,
) -> Result<bool> {
    let now = Utc::now();
    let scheduled_at = opts.scheduled_at.unwrap_or(now);
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO tasks
         (task_id, task_type, payload, status, scheduled_at, created_at,
          retry_count, max_retries, recurrence_rule, original_task_id)
         VALUES (?1, ?2, ?3, 'pending', ?4, ?5, 0, ?6, ?7, ?8)",
        params![
            task_id,
            task_type,
            serde_json::to_string(payload)?,
            scheduled_at.to_rfc3339(),
            now.to_rfc3339(),
            opts.max_retries.unwrap_or(3),
            opts.recurrence_rule,
            opts.original_task_id,
        ],
    )?;

    if inserted == 0 {
        debug!(%task_id, "duplicate enqueue ignored");
        return Ok(false);
    }
    info!(%task_id, %task_type, scheduled_at = %scheduled_at, "task enqueued");
    Ok(true)
}

/// Claim the oldest due task in a single transaction.
///
/// A row is dequeueable iff it is pending, due, of a handled type, and not
/// currently leased (or its lease has expired). The claim sets status,
/// worker id, and lease expiry atomically, so no two workers can observe
/// the same row as dequeued.
pub fn dequeue(
    db: &Db,
    worker_id: &str,
    handled_types: &[String],
    lease_duration: Duration,
    now: DateTime<Utc>,
) -> Result<Option<TaskRecord>> {
    if handled_types.is_empty() {
        return Ok(None);
    }

    db.with_tx(|tx| {
        let placeholders = handled_types
            .iter()
            .enumerate()
            .map(|(i, _)| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        // Pending rows are claimable unless another worker holds a live
        // lease; in-progress rows become claimable again once their lease
        // expires without a status change (crashed worker).
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE scheduled_at <= ?1
               AND task_type IN ({placeholders})
               AND ((status = 'pending'
                     AND (worker_id IS NULL OR lease_expires_at < ?1))
                 OR (status = 'in_progress' AND lease_expires_at < ?1))
             ORDER BY scheduled_at ASC
             LIMIT 1"
        );

        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> =
            vec![Box::new(now.to_rfc3339())];
        for t in handled_types {
            params_vec.push(Box::new(t.clone()));
        }
        let param_refs: Vec<&dyn rusqlite::ToSql> =
            params_vec.iter().map(|p| p.as_ref()).collect();

        let raw = {
            let mut stmt = tx.prepare_cached(&sql)?;
            stmt.query_row(param_refs.as_slice(), map_row).optional()?
        };

        let Some(raw) = raw else {
            return Ok(None);
        };

        let lease_expires = now + lease_duration;
        tx.execute(
            "UPDATE tasks
             SET status = 'in_progress', worker_id = ?1, lease_expires_at = ?2
             WHERE task_id = ?3",
            params![worker_id, lease_expires.to_rfc3339(), raw.task_id],
        )?;

        let mut record = raw.into_record()?;
        record.status = TaskStatus::InProgress;
        record.worker_id = Some(worker_id.to_string());
        record.lease_expires_at = Some(lease_expires);
        Ok(Some(record))
    })
}

/// Terminal (or cancellation) status update. Releases the lease.
pub fn update_status(
    db: &Db,
    task_id: &str,
    status: TaskStatus,
    error: Option<&str>,
) -> Result<()> {
    let conn = db.lock();
    let n = conn.execute(
        "UPDATE tasks
         SET status = ?1, last_error = ?2, worker_id = NULL, lease_expires_at = NULL
         WHERE task_id = ?3",
        params![status.to_string(), error, task_id],
    )?;
    if n == 0 {
        return Err(StorageError::NotFound {
            entity: "task",
            id: task_id.to_string(),
        });
    }
    Ok(())
}

/// Put a failed task back in the queue for a later retry attempt.
pub fn reschedule_for_retry(
    db: &Db,
    task_id: &str,
    next_scheduled_at: DateTime<Utc>,
    new_retry_count: u32,
    error: &str,
) -> Result<()> {
    let conn = db.lock();
    let n = conn.execute(
        "UPDATE tasks
         SET status = 'pending', scheduled_at = ?1, retry_count = ?2,
             last_error = ?3, worker_id = NULL, lease_expires_at = NULL
         WHERE task_id = ?4",
        params![
            next_scheduled_at.to_rfc3339(),
            new_retry_count,
            error,
            task_id
        ],
    )?;
    if n == 0 {
        return Err(StorageError::NotFound {
            entity: "task",
            id: task_id.to_string(),
        });
    }
    info!(%task_id, retry = new_retry_count, at = %next_scheduled_at, "task rescheduled for retry");
    Ok(())
}

/// Extend a running task's lease — the check-in callback handlers use for
/// long-running work.
pub fn extend_lease(
    db: &Db,
    task_id: &str,
    worker_id: &str,
    new_expiry: DateTime<Utc>,
) -> Result<bool> {
    let conn = db.lock();
    let n = conn.execute(
        "UPDATE tasks SET lease_expires_at = ?1
         WHERE task_id = ?2 AND worker_id = ?3 AND status = 'in_progress'",
        params![new_expiry.to_rfc3339(), task_id, worker_id],
    )?;
    if n == 0 {
        warn!(%task_id, %worker_id, "lease extension found no matching in-progress row");
    }
    Ok(n > 0)
}

/// Cancel all pending instances whose payload carries `automation_id`.
pub fn cancel_for_automation_on(conn: &Connection, automation_id: i64) -> Result<usize> {
    let n = conn.execute(
        "UPDATE tasks SET status = 'cancelled'
         WHERE status = 'pending'
           AND json_extract(payload, '$.automation_id') = ?1",
        params![automation_id.to_string()],
    )?;
    if n > 0 {
        info!(automation_id, cancelled = n, "pending automation instances cancelled");
    }
    Ok(n)
}

pub fn get(db: &Db, task_id: &str) -> Result<Option<TaskRecord>> {
    let conn = db.lock();
    let raw = conn
        .query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?1"),
            params![task_id],
            map_row,
        )
        .optional()?;
    raw.map(RawTask::into_record).transpose()
}

/// Most-recent-first listing, optionally filtered by status.
pub fn list(db: &Db, status: Option<TaskStatus>, limit: usize) -> Result<Vec<TaskRecord>> {
    let conn = db.lock();
    let (sql, args): (String, Vec<Box<dyn rusqlite::ToSql>>) = match status {
        Some(s) => (
            format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1
                 ORDER BY created_at DESC LIMIT ?2"
            ),
            vec![Box::new(s.to_string()), Box::new(limit as i64)],
        ),
        None => (
            format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at DESC LIMIT ?1"),
            vec![Box::new(limit as i64)],
        ),
    };
    let arg_refs: Vec<&dyn rusqlite::ToSql> = args.iter().map(|a| a.as_ref()).collect();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(arg_refs.as_slice(), map_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(RawTask::into_record).collect()
}

/// Recent task instances for one automation (execution history view).
pub fn list_for_automation(
    db: &Db,
    automation_id: i64,
    limit: usize,
) -> Result<Vec<TaskRecord>> {
    let conn = db.lock();
    let mut stmt = conn.prepare(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks
         WHERE json_extract(payload, '$.automation_id') = ?1
           AND status IN ('done', 'failed')
         ORDER BY created_at DESC LIMIT ?2"
    ))?;
    let rows = stmt
        .query_map(params![automation_id.to_string(), limit as i64], map_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(RawTask::into_record).collect()
}
