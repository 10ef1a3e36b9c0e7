//! The worker-side hook that drives schedule-automation recurrence.

use std::sync::Arc;

use tracing::{debug, error};

use haven_core::clock::{Clock, SystemClock};
use haven_core::types::AutomationKind;
use haven_queue::{AfterTaskHook, WorkerSignal};
use haven_storage::automations;
use haven_storage::tasks::TaskRecord;
use haven_storage::Db;

/// Runs after every successful task: when the payload marks the task as a
/// schedule-automation instance, update the automation's stats and enqueue
/// the next occurrence. Recurrence is driven here — from the automation
/// record — so disabling or editing the automation is always authoritative.
pub struct ScheduleAfterHook {
    db: Db,
    signal: WorkerSignal,
    clock: Arc<dyn Clock>,
}

impl ScheduleAfterHook {
    pub fn new(db: Db, signal: WorkerSignal) -> Self {
        Self {
            db,
            signal,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

#[async_trait::async_trait]
impl AfterTaskHook for ScheduleAfterHook {
    async fn on_task_done(&self, task: &TaskRecord) {
        let automation_type = task
            .payload
            .get("automation_type")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<AutomationKind>().ok());
        if automation_type != Some(AutomationKind::Schedule) {
            return;
        }
        let Some(automation_id) = task
            .payload
            .get("automation_id")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<i64>().ok())
        else {
            debug!(task_id = %task.task_id, "schedule task without a usable automation_id");
            return;
        };

        // Hook failures are logged only — the task itself already succeeded.
        if let Err(e) =
            automations::after_task_execution(&self.db, automation_id, self.clock.now())
        {
            error!(
                automation_id,
                task_id = %task.task_id,
                error = %e,
                "schedule after-execution hook failed"
            );
            return;
        }
        self.signal.notify();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use haven_core::clock::ManualClock;
    use haven_core::types::{ActionKind, TaskStatus};
    use haven_storage::automations::NewAutomation;
    use haven_storage::tasks;
    use serde_json::json;

    #[tokio::test]
    async fn done_schedule_task_schedules_the_next_instance() {
        let db = Db::open_in_memory().unwrap();
        let t0 = Utc.with_ymd_and_hms(2025, 3, 1, 5, 0, 0).unwrap();
        let automation = automations::create_schedule(
            &db,
            NewAutomation {
                name: "morning".into(),
                description: None,
                conversation_id: "c1".into(),
                interface_type: "api".into(),
                action_type: ActionKind::WakeLlm,
                action_config: json!({"context": "Daily briefing"}),
            },
            "FREQ=DAILY;BYHOUR=7",
            t0,
        )
        .unwrap();

        // Pretend the first instance just ran at 07:00.
        let ran_at = Utc.with_ymd_and_hms(2025, 3, 1, 7, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(ran_at));
        let hook = ScheduleAfterHook::new(db.clone(), WorkerSignal::new())
            .with_clock(clock);

        let first = tasks::list(&db, Some(TaskStatus::Pending), 10)
            .unwrap()
            .remove(0);
        hook.on_task_done(&first).await;

        let updated = automations::get_schedule(&db, automation.id, None)
            .unwrap()
            .unwrap();
        assert_eq!(updated.execution_count, 1);
        assert_eq!(updated.last_execution_at, Some(ran_at));
        assert_eq!(
            updated.next_scheduled_at,
            Some(Utc.with_ymd_and_hms(2025, 3, 2, 7, 0, 0).unwrap())
        );

        let pending = tasks::list(&db, Some(TaskStatus::Pending), 10).unwrap();
        assert_eq!(pending.len(), 2);
    }

    #[tokio::test]
    async fn non_schedule_tasks_are_ignored() {
        let db = Db::open_in_memory().unwrap();
        let hook = ScheduleAfterHook::new(db.clone(), WorkerSignal::new());

        tasks::enqueue(
            &db,
            "plain",
            "llm_callback",
            &json!({"conversation_id": "c1"}),
            Default::default(),
        )
        .unwrap();
        let task = tasks::get(&db, "plain").unwrap().unwrap();
        hook.on_task_done(&task).await;
        assert_eq!(tasks::list(&db, None, 10).unwrap().len(), 1);
    }
}
