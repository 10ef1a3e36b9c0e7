//! Repositories for the two automation variants.
//!
//! Both variants share the naming namespace: an automation name must be
//! unique per conversation *across* schedule automations and event
//! listeners. Schedule recurrence is driven from the automation record via
//! [`after_task_execution`] — queue rows created here never carry a
//! `recurrence_rule`, which keeps disable/update authoritative.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use haven_core::recurrence;
use haven_core::types::{ActionKind, AutomationKind};

use crate::db::{parse_ts, Db};
use crate::error::{Result, StorageError};
use crate::tasks::{self, EnqueueOptions};

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleAutomation {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub conversation_id: String,
    pub interface_type: String,
    pub enabled: bool,
    pub action_type: ActionKind,
    pub action_config: Value,
    pub recurrence_rule: String,
    pub next_scheduled_at: Option<DateTime<Utc>>,
    pub execution_count: u32,
    pub last_execution_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventListener {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub conversation_id: String,
    pub interface_type: String,
    pub enabled: bool,
    pub action_type: ActionKind,
    pub action_config: Value,
    pub source_id: String,
    pub match_conditions: Value,
    pub condition_script: Option<String>,
    pub one_time: bool,
    pub daily_executions: u32,
    pub last_execution_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// New-automation parameters shared by both variants.
#[derive(Debug, Clone)]
pub struct NewAutomation {
    pub name: String,
    pub description: Option<String>,
    pub conversation_id: String,
    pub interface_type: String,
    pub action_type: ActionKind,
    pub action_config: Value,
}

/// Check whether `name` is free in `conversation_id` across both variants.
/// Returns `(true, None)` when available, `(false, Some(kind))` naming the
/// variant holding the name otherwise.
pub fn check_name_available(
    db: &Db,
    name: &str,
    conversation_id: &str,
) -> Result<(bool, Option<AutomationKind>)> {
    let conn = db.lock();
    check_name_available_on(&conn, name, conversation_id)
}

fn check_name_available_on(
    conn: &Connection,
    name: &str,
    conversation_id: &str,
) -> Result<(bool, Option<AutomationKind>)> {
    let in_schedules: Option<i64> = conn
        .query_row(
            "SELECT id FROM schedule_automations WHERE name = ?1 AND conversation_id = ?2",
            params![name, conversation_id],
            |row| row.get(0),
        )
        .optional()?;
    if in_schedules.is_some() {
        return Ok((false, Some(AutomationKind::Schedule)));
    }

    let in_listeners: Option<i64> = conn
        .query_row(
            "SELECT id FROM event_listeners WHERE name = ?1 AND conversation_id = ?2",
            params![name, conversation_id],
            |row| row.get(0),
        )
        .optional()?;
    if in_listeners.is_some() {
        return Ok((false, Some(AutomationKind::Event)));
    }

    Ok((true, None))
}

/// Task payload for an automation firing: the conversation routing keys
/// plus the automation markers the worker hooks key on.
pub fn action_payload(
    kind: AutomationKind,
    automation_id: i64,
    conversation_id: &str,
    interface_type: &str,
    name: &str,
    action_type: ActionKind,
    action_config: &Value,
) -> Value {
    let mut payload = serde_json::json!({
        "conversation_id": conversation_id,
        "interface_type": interface_type,
        "automation_id": automation_id.to_string(),
        "automation_type": kind.to_string(),
    });
    let map = payload.as_object_mut().expect("payload is an object");
    match action_type {
        ActionKind::WakeLlm => {
            map.insert(
                "callback_context".into(),
                action_config
                    .get("context")
                    .cloned()
                    .unwrap_or(Value::String(String::new())),
            );
        }
        ActionKind::Script => {
            map.insert(
                "script_code".into(),
                action_config
                    .get("script_code")
                    .cloned()
                    .unwrap_or(Value::String(String::new())),
            );
            map.insert(
                "task_name".into(),
                action_config
                    .get("task_name")
                    .cloned()
                    .unwrap_or(Value::String(name.to_string())),
            );
        }
    }
    payload
}

/// Deterministic instance id: the hook dedupes repeat runs by
/// (automation_id, occurrence time) through the task-id primary key.
fn schedule_instance_id(automation_id: i64, at: DateTime<Utc>) -> String {
    format!("sched_auto_{automation_id}_{}", at.timestamp())
}

// ── Schedule variant ─────────────────────────────────────────────────────────

/// Create a schedule automation and enqueue its first task instance in the
/// same transaction.
pub fn create_schedule(
    db: &Db,
    new: NewAutomation,
    recurrence_rule: &str,
    now: DateTime<Utc>,
) -> Result<ScheduleAutomation> {
    let first = recurrence::next_after(recurrence_rule, now)
        .map_err(|e| StorageError::Recurrence(e.to_string()))?
        .ok_or_else(|| {
            StorageError::Recurrence(format!("rule produces no occurrences: {recurrence_rule}"))
        })?;

    db.with_tx(|tx| {
        if let (false, Some(kind)) = check_name_available_on(tx, &new.name, &new.conversation_id)? {
            return Err(StorageError::NameTaken {
                name: new.name.clone(),
                kind: kind.to_string(),
            });
        }

        tx.execute(
            "INSERT INTO schedule_automations
             (name, description, conversation_id, interface_type, enabled,
              action_type, action_config, recurrence_rule, next_scheduled_at,
              execution_count, created_at)
             VALUES (?1,?2,?3,?4,1,?5,?6,?7,?8,0,?9)",
            params![
                new.name,
                new.description,
                new.conversation_id,
                new.interface_type,
                new.action_type.to_string(),
                serde_json::to_string(&new.action_config)?,
                recurrence_rule,
                first.to_rfc3339(),
                now.to_rfc3339(),
            ],
        )?;
        let id = tx.last_insert_rowid();

        let payload = action_payload(
            AutomationKind::Schedule,
            id,
            &new.conversation_id,
            &new.interface_type,
            &new.name,
            new.action_type,
            &new.action_config,
        );
        tasks::enqueue_on(
            tx,
            &schedule_instance_id(id, first),
            new.action_type.task_type(),
            &payload,
            EnqueueOptions {
                scheduled_at: Some(first),
                ..Default::default()
            },
        )?;

        info!(automation_id = id, name = %new.name, first_run = %first, "schedule automation created");

        get_schedule_on(tx, id, None)?.ok_or(StorageError::NotFound {
            entity: "schedule automation",
            id: id.to_string(),
        })
    })
}

const SCHEDULE_COLUMNS: &str = "id, name, description, conversation_id, interface_type, enabled, \
     action_type, action_config, recurrence_rule, next_scheduled_at, \
     execution_count, last_execution_at, created_at";

fn map_schedule(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawSchedule> {
    Ok(RawSchedule {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        conversation_id: row.get(3)?,
        interface_type: row.get(4)?,
        enabled: row.get(5)?,
        action_type: row.get(6)?,
        action_config: row.get(7)?,
        recurrence_rule: row.get(8)?,
        next_scheduled_at: row.get(9)?,
        execution_count: row.get(10)?,
        last_execution_at: row.get(11)?,
        created_at: row.get(12)?,
    })
}

struct RawSchedule {
    id: i64,
    name: String,
    description: Option<String>,
    conversation_id: String,
    interface_type: String,
    enabled: bool,
    action_type: String,
    action_config: String,
    recurrence_rule: String,
    next_scheduled_at: Option<String>,
    execution_count: u32,
    last_execution_at: Option<String>,
    created_at: String,
}

impl RawSchedule {
    fn into_record(self) -> Result<ScheduleAutomation> {
        Ok(ScheduleAutomation {
            id: self.id,
            name: self.name,
            description: self.description,
            conversation_id: self.conversation_id,
            interface_type: self.interface_type,
            enabled: self.enabled,
            action_type: self.action_type.parse().map_err(|detail| {
                StorageError::CorruptRow {
                    table: "schedule_automations".into(),
                    detail,
                }
            })?,
            action_config: serde_json::from_str(&self.action_config)?,
            recurrence_rule: self.recurrence_rule,
            next_scheduled_at: self
                .next_scheduled_at
                .as_deref()
                .map(|t| parse_ts("schedule_automations", t))
                .transpose()?,
            execution_count: self.execution_count,
            last_execution_at: self
                .last_execution_at
                .as_deref()
                .map(|t| parse_ts("schedule_automations", t))
                .transpose()?,
            created_at: parse_ts("schedule_automations", &self.created_at)?,
        })
    }
}

pub fn get_schedule(
    db: &Db,
    id: i64,
    conversation_id: Option<&str>,
) -> Result<Option<ScheduleAutomation>> {
    let conn = db.lock();
    get_schedule_on(&conn, id, conversation_id)
}

fn get_schedule_on(
    conn: &Connection,
    id: i64,
    conversation_id: Option<&str>,
) -> Result<Option<ScheduleAutomation>> {
    let raw = conn
        .query_row(
            &format!(
                "SELECT {SCHEDULE_COLUMNS} FROM schedule_automations
                 WHERE id = ?1 AND (?2 IS NULL OR conversation_id = ?2)"
            ),
            params![id, conversation_id],
            map_schedule,
        )
        .optional()?;
    raw.map(RawSchedule::into_record).transpose()
}

pub fn list_schedules(
    db: &Db,
    conversation_id: &str,
    enabled_only: bool,
) -> Result<Vec<ScheduleAutomation>> {
    let conn = db.lock();
    let mut stmt = conn.prepare(&format!(
        "SELECT {SCHEDULE_COLUMNS} FROM schedule_automations
         WHERE conversation_id = ?1 AND (?2 = 0 OR enabled = 1)
         ORDER BY created_at DESC"
    ))?;
    let rows = stmt
        .query_map(params![conversation_id, enabled_only], map_schedule)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(RawSchedule::into_record).collect()
}

/// Fields a schedule update may change. `None` leaves the field untouched.
#[derive(Debug, Clone, Default)]
pub struct ScheduleUpdate {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub recurrence_rule: Option<String>,
    pub action_config: Option<Value>,
    pub enabled: Option<bool>,
}

/// Update a schedule automation. A recurrence change cancels every pending
/// instance and enqueues the fresh first instance in the same transaction.
pub fn update_schedule(
    db: &Db,
    id: i64,
    conversation_id: &str,
    update: ScheduleUpdate,
    now: DateTime<Utc>,
) -> Result<bool> {
    // Validate outside the transaction so rule errors surface cleanly.
    let new_first = update
        .recurrence_rule
        .as_deref()
        .map(|rule| {
            recurrence::next_after(rule, now)
                .map_err(|e| StorageError::Recurrence(e.to_string()))?
                .ok_or_else(|| {
                    StorageError::Recurrence(format!("rule produces no occurrences: {rule}"))
                })
        })
        .transpose()?;

    db.with_tx(|tx| {
        let Some(existing) = get_schedule_on(tx, id, Some(conversation_id))? else {
            warn!(automation_id = id, "schedule automation not found for update");
            return Ok(false);
        };

        if let Some(name) = &update.name {
            tx.execute(
                "UPDATE schedule_automations SET name = ?1 WHERE id = ?2",
                params![name, id],
            )?;
        }
        if let Some(description) = &update.description {
            tx.execute(
                "UPDATE schedule_automations SET description = ?1 WHERE id = ?2",
                params![description, id],
            )?;
        }
        if let Some(config) = &update.action_config {
            tx.execute(
                "UPDATE schedule_automations SET action_config = ?1 WHERE id = ?2",
                params![serde_json::to_string(config)?, id],
            )?;
        }
        if let Some(enabled) = update.enabled {
            tx.execute(
                "UPDATE schedule_automations SET enabled = ?1 WHERE id = ?2",
                params![enabled, id],
            )?;
        }

        if let (Some(rule), Some(first)) = (&update.recurrence_rule, new_first) {
            tx.execute(
                "UPDATE schedule_automations
                 SET recurrence_rule = ?1, next_scheduled_at = ?2 WHERE id = ?3",
                params![rule, first.to_rfc3339(), id],
            )?;

            tasks::cancel_for_automation_on(tx, id)?;

            let action_config = update
                .action_config
                .clone()
                .unwrap_or(existing.action_config.clone());
            let name = update.name.clone().unwrap_or(existing.name.clone());
            let payload = action_payload(
                AutomationKind::Schedule,
                id,
                conversation_id,
                &existing.interface_type,
                &name,
                existing.action_type,
                &action_config,
            );
            tasks::enqueue_on(
                tx,
                &schedule_instance_id(id, first),
                existing.action_type.task_type(),
                &payload,
                EnqueueOptions {
                    scheduled_at: Some(first),
                    ..Default::default()
                },
            )?;
            info!(automation_id = id, next_run = %first, "schedule rule updated");
        }

        Ok(true)
    })
}

/// Delete a schedule automation, cancelling its pending instances.
pub fn delete_schedule(db: &Db, id: i64, conversation_id: &str) -> Result<bool> {
    db.with_tx(|tx| {
        tasks::cancel_for_automation_on(tx, id)?;
        let n = tx.execute(
            "DELETE FROM schedule_automations WHERE id = ?1 AND conversation_id = ?2",
            params![id, conversation_id],
        )?;
        if n > 0 {
            info!(automation_id = id, "schedule automation deleted");
        }
        Ok(n > 0)
    })
}

pub fn set_schedule_enabled(
    db: &Db,
    id: i64,
    conversation_id: &str,
    enabled: bool,
) -> Result<bool> {
    let conn = db.lock();
    let n = conn.execute(
        "UPDATE schedule_automations SET enabled = ?1
         WHERE id = ?2 AND conversation_id = ?3",
        params![enabled, id, conversation_id],
    )?;
    Ok(n > 0)
}

/// Repository hook run after a schedule automation's task completes.
///
/// Loads the automation (stop when deleted/disabled), bumps execution
/// stats, computes the occurrence strictly after `execution_time`, and
/// enqueues the next instance. Idempotent: the derived task id makes a
/// repeat run a no-op enqueue.
pub fn after_task_execution(
    db: &Db,
    automation_id: i64,
    execution_time: DateTime<Utc>,
) -> Result<()> {
    db.with_tx(|tx| {
        let Some(automation) = get_schedule_on(tx, automation_id, None)? else {
            warn!(automation_id, "automation vanished before after-execution hook");
            return Ok(());
        };
        if !automation.enabled {
            info!(automation_id, "automation disabled, not scheduling next instance");
            return Ok(());
        }

        tx.execute(
            "UPDATE schedule_automations
             SET execution_count = execution_count + 1, last_execution_at = ?1
             WHERE id = ?2",
            params![execution_time.to_rfc3339(), automation_id],
        )?;

        let next = recurrence::next_after(&automation.recurrence_rule, execution_time)
            .map_err(|e| StorageError::Recurrence(e.to_string()))?;
        let Some(next) = next else {
            info!(automation_id, rule = %automation.recurrence_rule, "no further occurrences");
            return Ok(());
        };

        tx.execute(
            "UPDATE schedule_automations SET next_scheduled_at = ?1 WHERE id = ?2",
            params![next.to_rfc3339(), automation_id],
        )?;

        let payload = action_payload(
            AutomationKind::Schedule,
            automation_id,
            &automation.conversation_id,
            &automation.interface_type,
            &automation.name,
            automation.action_type,
            &automation.action_config,
        );
        tasks::enqueue_on(
            tx,
            &schedule_instance_id(automation_id, next),
            automation.action_type.task_type(),
            &payload,
            EnqueueOptions {
                scheduled_at: Some(next),
                ..Default::default()
            },
        )?;

        info!(automation_id, next_run = %next, "next schedule instance enqueued");
        Ok(())
    })
}

// ── Event variant ────────────────────────────────────────────────────────────

/// Parameters specific to the event variant.
#[derive(Debug, Clone)]
pub struct NewListener {
    pub base: NewAutomation,
    pub source_id: String,
    pub match_conditions: Value,
    pub condition_script: Option<String>,
    pub one_time: bool,
}

pub fn create_listener(db: &Db, new: NewListener, now: DateTime<Utc>) -> Result<EventListener> {
    db.with_tx(|tx| {
        if let (false, Some(kind)) =
            check_name_available_on(tx, &new.base.name, &new.base.conversation_id)?
        {
            return Err(StorageError::NameTaken {
                name: new.base.name.clone(),
                kind: kind.to_string(),
            });
        }

        tx.execute(
            "INSERT INTO event_listeners
             (name, description, conversation_id, interface_type, enabled,
              action_type, action_config, source_id, match_conditions,
              condition_script, one_time, daily_executions, created_at)
             VALUES (?1,?2,?3,?4,1,?5,?6,?7,?8,?9,?10,0,?11)",
            params![
                new.base.name,
                new.base.description,
                new.base.conversation_id,
                new.base.interface_type,
                new.base.action_type.to_string(),
                serde_json::to_string(&new.base.action_config)?,
                new.source_id,
                serde_json::to_string(&new.match_conditions)?,
                new.condition_script,
                new.one_time,
                now.to_rfc3339(),
            ],
        )?;
        let id = tx.last_insert_rowid();
        info!(listener_id = id, name = %new.base.name, source = %new.source_id, "event listener created");

        get_listener_on(tx, id, None)?.ok_or(StorageError::NotFound {
            entity: "event listener",
            id: id.to_string(),
        })
    })
}

const LISTENER_COLUMNS: &str = "id, name, description, conversation_id, interface_type, enabled, \
     action_type, action_config, source_id, match_conditions, \
     condition_script, one_time, daily_executions, last_execution_at, created_at";

fn map_listener(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawListener> {
    Ok(RawListener {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        conversation_id: row.get(3)?,
        interface_type: row.get(4)?,
        enabled: row.get(5)?,
        action_type: row.get(6)?,
        action_config: row.get(7)?,
        source_id: row.get(8)?,
        match_conditions: row.get(9)?,
        condition_script: row.get(10)?,
        one_time: row.get(11)?,
        daily_executions: row.get(12)?,
        last_execution_at: row.get(13)?,
        created_at: row.get(14)?,
    })
}

struct RawListener {
    id: i64,
    name: String,
    description: Option<String>,
    conversation_id: String,
    interface_type: String,
    enabled: bool,
    action_type: String,
    action_config: String,
    source_id: String,
    match_conditions: String,
    condition_script: Option<String>,
    one_time: bool,
    daily_executions: u32,
    last_execution_at: Option<String>,
    created_at: String,
}

impl RawListener {
    fn into_record(self) -> Result<EventListener> {
        Ok(EventListener {
            id: self.id,
            name: self.name,
            description: self.description,
            conversation_id: self.conversation_id,
            interface_type: self.interface_type,
            enabled: self.enabled,
            action_type: self.action_type.parse().map_err(|detail| {
                StorageError::CorruptRow {
                    table: "event_listeners".into(),
                    detail,
                }
            })?,
            action_config: serde_json::from_str(&self.action_config)?,
            source_id: self.source_id,
            match_conditions: serde_json::from_str(&self.match_conditions)?,
            condition_script: self.condition_script,
            one_time: self.one_time,
            daily_executions: self.daily_executions,
            last_execution_at: self
                .last_execution_at
                .as_deref()
                .map(|t| parse_ts("event_listeners", t))
                .transpose()?,
            created_at: parse_ts("event_listeners", &self.created_at)?,
        })
    }
}

pub fn get_listener(
    db: &Db,
    id: i64,
    conversation_id: Option<&str>,
) -> Result<Option<EventListener>> {
    let conn = db.lock();
    get_listener_on(&conn, id, conversation_id)
}

fn get_listener_on(
    conn: &Connection,
    id: i64,
    conversation_id: Option<&str>,
) -> Result<Option<EventListener>> {
    let raw = conn
        .query_row(
            &format!(
                "SELECT {LISTENER_COLUMNS} FROM event_listeners
                 WHERE id = ?1 AND (?2 IS NULL OR conversation_id = ?2)"
            ),
            params![id, conversation_id],
            map_listener,
        )
        .optional()?;
    raw.map(RawListener::into_record).transpose()
}

pub fn list_listeners(
    db: &Db,
    conversation_id: Option<&str>,
    enabled_only: bool,
) -> Result<Vec<EventListener>> {
    let conn = db.lock();
    let mut stmt = conn.prepare(&format!(
        "SELECT {LISTENER_COLUMNS} FROM event_listeners
         WHERE (?1 IS NULL OR conversation_id = ?1) AND (?2 = 0 OR enabled = 1)
         ORDER BY created_at DESC"
    ))?;
    let rows = stmt
        .query_map(params![conversation_id, enabled_only], map_listener)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(RawListener::into_record).collect()
}

/// Listeners subscribed to one event source (dispatcher index rebuild).
pub fn listeners_for_source(db: &Db, source_id: &str) -> Result<Vec<EventListener>> {
    let conn = db.lock();
    let mut stmt = conn.prepare(&format!(
        "SELECT {LISTENER_COLUMNS} FROM event_listeners
         WHERE source_id = ?1 AND enabled = 1"
    ))?;
    let rows = stmt
        .query_map(params![source_id], map_listener)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(RawListener::into_record).collect()
}

/// Fields an event-listener update may change.
#[derive(Debug, Clone, Default)]
pub struct ListenerUpdate {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub match_conditions: Option<Value>,
    pub condition_script: Option<Option<String>>,
    pub action_config: Option<Value>,
    pub one_time: Option<bool>,
    pub enabled: Option<bool>,
}

/// Update an event listener. `source_id` is immutable — recreate instead.
pub fn update_listener(
    db: &Db,
    id: i64,
    conversation_id: &str,
    update: ListenerUpdate,
) -> Result<bool> {
    db.with_tx(|tx| {
        if get_listener_on(tx, id, Some(conversation_id))?.is_none() {
            return Ok(false);
        }
        if let Some(name) = &update.name {
            tx.execute(
                "UPDATE event_listeners SET name = ?1 WHERE id = ?2",
                params![name, id],
            )?;
        }
        if let Some(description) = &update.description {
            tx.execute(
                "UPDATE event_listeners SET description = ?1 WHERE id = ?2",
                params![description, id],
            )?;
        }
        if let Some(conditions) = &update.match_conditions {
            tx.execute(
                "UPDATE event_listeners SET match_conditions = ?1 WHERE id = ?2",
                params![serde_json::to_string(conditions)?, id],
            )?;
        }
        if let Some(script) = &update.condition_script {
            tx.execute(
                "UPDATE event_listeners SET condition_script = ?1 WHERE id = ?2",
                params![script, id],
            )?;
        }
        if let Some(config) = &update.action_config {
            tx.execute(
                "UPDATE event_listeners SET action_config = ?1 WHERE id = ?2",
                params![serde_json::to_string(config)?, id],
            )?;
        }
        if let Some(one_time) = update.one_time {
            tx.execute(
                "UPDATE event_listeners SET one_time = ?1 WHERE id = ?2",
                params![one_time, id],
            )?;
        }
        if let Some(enabled) = update.enabled {
            tx.execute(
                "UPDATE event_listeners SET enabled = ?1 WHERE id = ?2",
                params![enabled, id],
            )?;
        }
        Ok(true)
    })
}

pub fn delete_listener(db: &Db, id: i64, conversation_id: &str) -> Result<bool> {
    let conn = db.lock();
    let n = conn.execute(
        "DELETE FROM event_listeners WHERE id = ?1 AND conversation_id = ?2",
        params![id, conversation_id],
    )?;
    Ok(n > 0)
}

pub fn set_listener_enabled(
    db: &Db,
    id: i64,
    conversation_id: &str,
    enabled: bool,
) -> Result<bool> {
    let conn = db.lock();
    let n = conn.execute(
        "UPDATE event_listeners SET enabled = ?1
         WHERE id = ?2 AND conversation_id = ?3",
        params![enabled, id, conversation_id],
    )?;
    Ok(n > 0)
}

/// Outcome of [`trigger_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// Task enqueued (listener also disabled when one_time).
    Fired,
    /// Listener was already disabled or deleted by the time we committed.
    NotEligible,
    /// Daily execution cap reached.
    RateLimited,
}

/// Record a listener firing: enqueue the action task, bump the daily
/// counter (reset across UTC days), and — for one-time listeners — disable
/// the listener, all in one transaction.
pub fn trigger_listener(
    db: &Db,
    listener_id: i64,
    task_id: &str,
    task_type: &str,
    payload: &Value,
    max_daily: Option<u32>,
    now: DateTime<Utc>,
) -> Result<TriggerOutcome> {
    db.with_tx(|tx| {
        let Some(listener) = get_listener_on(tx, listener_id, None)? else {
            return Ok(TriggerOutcome::NotEligible);
        };
        if !listener.enabled {
            return Ok(TriggerOutcome::NotEligible);
        }

        let same_day = listener
            .last_execution_at
            .map(|last| last.date_naive() == now.date_naive())
            .unwrap_or(false);
        let daily = if same_day { listener.daily_executions } else { 0 };

        if let Some(cap) = max_daily {
            if daily >= cap {
                warn!(listener_id, cap, "listener daily execution cap reached");
                return Ok(TriggerOutcome::RateLimited);
            }
        }

        tasks::enqueue_on(
            tx,
            task_id,
            task_type,
            payload,
            EnqueueOptions {
                scheduled_at: Some(now),
                ..Default::default()
            },
        )?;

        tx.execute(
            "UPDATE event_listeners
             SET daily_executions = ?1, last_execution_at = ?2,
                 enabled = CASE WHEN one_time = 1 THEN 0 ELSE enabled END
             WHERE id = ?3",
            params![daily + 1, now.to_rfc3339(), listener_id],
        )?;

        Ok(TriggerOutcome::Fired)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use haven_core::types::TaskStatus;
    use serde_json::json;

    fn db() -> Db {
        Db::open_in_memory().unwrap()
    }

    fn base(name: &str) -> NewAutomation {
        NewAutomation {
            name: name.to_string(),
            description: None,
            conversation_id: "c1".to_string(),
            interface_type: "api".to_string(),
            action_type: ActionKind::WakeLlm,
            action_config: json!({"context": "Daily briefing"}),
        }
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, h, m, 0).unwrap()
    }

    #[test]
    fn create_schedule_enqueues_first_instance() {
        let db = db();
        let auto =
            create_schedule(&db, base("morning"), "FREQ=DAILY;BYHOUR=7", at(9, 0)).unwrap();
        assert!(auto.enabled);
        assert_eq!(auto.execution_count, 0);
        // 09:00 on 03-01 → next 07:00 is 03-02.
        assert_eq!(auto.next_scheduled_at.unwrap(), at(7, 0) + chrono::Duration::days(1));

        let pending = tasks::list(&db, Some(TaskStatus::Pending), 10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].task_type, "llm_callback");
        assert_eq!(pending[0].payload["automation_type"], "schedule");
        assert_eq!(pending[0].payload["callback_context"], "Daily briefing");
        // Hook-driven recurrence: the queue row itself must not recur.
        assert!(pending[0].recurrence_rule.is_none());
    }

    #[test]
    fn name_unique_across_variants() {
        let db = db();
        create_schedule(&db, base("shared"), "FREQ=DAILY;BYHOUR=7", at(9, 0)).unwrap();

        let (ok, kind) = check_name_available(&db, "shared", "c1").unwrap();
        assert!(!ok);
        assert_eq!(kind, Some(AutomationKind::Schedule));

        let listener = NewListener {
            base: base("shared"),
            source_id: "home_assistant".into(),
            match_conditions: json!({}),
            condition_script: None,
            one_time: false,
        };
        let err = create_listener(&db, listener, at(9, 0)).unwrap_err();
        assert!(matches!(err, StorageError::NameTaken { .. }));

        // Other conversations are unaffected.
        let (ok, _) = check_name_available(&db, "shared", "c2").unwrap();
        assert!(ok);
    }

    #[test]
    fn after_execution_schedules_exactly_one_successor() {
        let db = db();
        let auto =
            create_schedule(&db, base("morning"), "FREQ=DAILY;BYHOUR=7", at(5, 0)).unwrap();
        let first_run = auto.next_scheduled_at.unwrap();
        assert_eq!(first_run, at(7, 0));

        after_task_execution(&db, auto.id, first_run).unwrap();
        // Running the hook twice must not double-enqueue.
        after_task_execution(&db, auto.id, first_run).unwrap();

        let updated = get_schedule(&db, auto.id, None).unwrap().unwrap();
        assert_eq!(updated.execution_count, 2); // both hook runs bump stats
        assert_eq!(
            updated.next_scheduled_at.unwrap(),
            at(7, 0) + chrono::Duration::days(1)
        );

        let pending = tasks::list(&db, Some(TaskStatus::Pending), 10).unwrap();
        // first instance + exactly one successor
        assert_eq!(pending.len(), 2);
    }

    #[test]
    fn disabled_automation_gets_no_successor() {
        let db = db();
        let auto =
            create_schedule(&db, base("morning"), "FREQ=DAILY;BYHOUR=7", at(5, 0)).unwrap();
        set_schedule_enabled(&db, auto.id, "c1", false).unwrap();
        after_task_execution(&db, auto.id, at(7, 0)).unwrap();
        let pending = tasks::list(&db, Some(TaskStatus::Pending), 10).unwrap();
        assert_eq!(pending.len(), 1); // only the original first instance
    }

    #[test]
    fn rule_update_cancels_pending_instances() {
        let db = db();
        let auto =
            create_schedule(&db, base("morning"), "FREQ=DAILY;BYHOUR=7", at(5, 0)).unwrap();

        let update = ScheduleUpdate {
            recurrence_rule: Some("FREQ=DAILY;BYHOUR=9".into()),
            ..Default::default()
        };
        assert!(update_schedule(&db, auto.id, "c1", update, at(5, 30)).unwrap());

        let cancelled = tasks::list(&db, Some(TaskStatus::Cancelled), 10).unwrap();
        assert_eq!(cancelled.len(), 1);
        let pending = tasks::list(&db, Some(TaskStatus::Pending), 10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(
            pending[0].scheduled_at,
            at(9, 0),
            "new first instance follows the updated rule"
        );
    }

    #[test]
    fn invalid_rule_rejected() {
        let db = db();
        let err = create_schedule(&db, base("bad"), "FREQ=SOMETIMES", at(5, 0)).unwrap_err();
        assert!(matches!(err, StorageError::Recurrence(_)));
        // Nothing persisted.
        assert!(list_schedules(&db, "c1", false).unwrap().is_empty());
        assert!(tasks::list(&db, None, 10).unwrap().is_empty());
    }

    #[test]
    fn one_time_listener_disables_atomically() {
        let db = db();
        let listener = create_listener(
            &db,
            NewListener {
                base: NewAutomation {
                    action_type: ActionKind::Script,
                    action_config: json!({"script_code": "print('door opened')"}),
                    ..base("door")
                },
                source_id: "home_assistant".into(),
                match_conditions: json!({"entity_id": "sensor.door"}),
                condition_script: None,
                one_time: true,
            },
            at(9, 0),
        )
        .unwrap();

        let payload = json!({"conversation_id": "c1"});
        let outcome = trigger_listener(
            &db,
            listener.id,
            "evt_1",
            "script_execution",
            &payload,
            None,
            at(9, 1),
        )
        .unwrap();
        assert_eq!(outcome, TriggerOutcome::Fired);

        let after = get_listener(&db, listener.id, None).unwrap().unwrap();
        assert!(!after.enabled);
        assert_eq!(after.daily_executions, 1);

        // Second trigger: listener disabled, no new task.
        let outcome = trigger_listener(
            &db,
            listener.id,
            "evt_2",
            "script_execution",
            &payload,
            None,
            at(9, 2),
        )
        .unwrap();
        assert_eq!(outcome, TriggerOutcome::NotEligible);
        assert_eq!(tasks::list(&db, None, 10).unwrap().len(), 1);
    }

    #[test]
    fn daily_cap_and_reset() {
        let db = db();
        let listener = create_listener(
            &db,
            NewListener {
                base: base("cap"),
                source_id: "webhook".into(),
                match_conditions: json!({}),
                condition_script: None,
                one_time: false,
            },
            at(9, 0),
        )
        .unwrap();

        let payload = json!({});
        for i in 0..2 {
            let outcome = trigger_listener(
                &db,
                listener.id,
                &format!("t{i}"),
                "llm_callback",
                &payload,
                Some(2),
                at(10, i),
            )
            .unwrap();
            assert_eq!(outcome, TriggerOutcome::Fired);
        }
        let outcome =
            trigger_listener(&db, listener.id, "t9", "llm_callback", &payload, Some(2), at(11, 0))
                .unwrap();
        assert_eq!(outcome, TriggerOutcome::RateLimited);

        // Next UTC day resets the counter.
        let tomorrow = at(10, 0) + chrono::Duration::days(1);
        let outcome = trigger_listener(
            &db,
            listener.id,
            "t10",
            "llm_callback",
            &payload,
            Some(2),
            tomorrow,
        )
        .unwrap();
        assert_eq!(outcome, TriggerOutcome::Fired);
        let after = get_listener(&db, listener.id, None).unwrap().unwrap();
        assert_eq!(after.daily_executions, 1);
    }
}
