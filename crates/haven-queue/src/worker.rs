use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures_util::future::BoxFuture;
use rand::Rng;
use serde_json::Value;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use haven_core::clock::{Clock, SystemClock};
use haven_core::config::WorkerConfig;
use haven_core::recurrence;
use haven_core::types::TaskStatus;
use haven_storage::tasks::{self, EnqueueOptions, TaskRecord};
use haven_storage::Db;

use crate::error::Result;

/// Wake-up signal producers ping after an enqueue so an idle worker picks
/// the task up without waiting out the poll interval.
#[derive(Clone, Default)]
pub struct WorkerSignal(Arc<Notify>);

impl WorkerSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        self.0.notify_one();
    }

    async fn wait(&self) {
        self.0.notified().await;
    }
}

/// Enqueue plus wake-up in one call.
pub fn enqueue_task(
    db: &Db,
    signal: Option<&WorkerSignal>,
    task_id: &str,
    task_type: &str,
    payload: &Value,
    opts: EnqueueOptions,
) -> Result<bool> {
    let inserted = tasks::enqueue(db, task_id, task_type, payload, opts)?;
    if inserted {
        if let Some(signal) = signal {
            signal.notify();
        }
    }
    Ok(inserted)
}

/// Handle given to handlers for lease keep-alive during long work.
#[derive(Clone)]
pub struct TaskHandle {
    db: Db,
    task_id: String,
    worker_id: String,
    lease_duration: Duration,
    clock: Arc<dyn Clock>,
}

impl TaskHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Extend the lease by another full lease duration from now.
    pub fn check_in(&self) -> Result<bool> {
        let expiry = self.clock.now() + self.lease_duration;
        Ok(tasks::extend_lease(
            &self.db,
            &self.task_id,
            &self.worker_id,
            expiry,
        )?)
    }
}

/// Handler closure registered per task type. A `String` error routes the
/// task through the retry path.
pub type TaskHandler = Arc<
    dyn Fn(TaskRecord, TaskHandle) -> BoxFuture<'static, std::result::Result<(), String>>
        + Send
        + Sync,
>;

/// Observer invoked after a task reaches `done`. Hook failures are logged,
/// never propagated — the task already succeeded.
#[async_trait::async_trait]
pub trait AfterTaskHook: Send + Sync {
    async fn on_task_done(&self, task: &TaskRecord);
}

/// The polling worker. One instance per process is typical; several
/// instances cooperate safely through the lease protocol.
pub struct TaskWorker {
    db: Db,
    worker_id: String,
    config: WorkerConfig,
    handlers: HashMap<String, TaskHandler>,
    hooks: Vec<Arc<dyn AfterTaskHook>>,
    signal: WorkerSignal,
    clock: Arc<dyn Clock>,
}

impl TaskWorker {
    pub fn new(db: Db, config: WorkerConfig) -> Self {
        let worker_id = format!("worker-{}", Uuid::new_v4());
        info!(%worker_id, "task worker created");
        Self {
            db,
            worker_id,
            config,
            handlers: HashMap::new(),
            hooks: Vec::new(),
            signal: WorkerSignal::new(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn register_handler(&mut self, task_type: &str, handler: TaskHandler) {
        info!(worker = %self.worker_id, %task_type, "handler registered");
        self.handlers.insert(task_type.to_string(), handler);
    }

    pub fn add_after_hook(&mut self, hook: Arc<dyn AfterTaskHook>) {
        self.hooks.push(hook);
    }

    /// The signal enqueuers should ping for immediate pickup.
    pub fn signal(&self) -> WorkerSignal {
        self.signal.clone()
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Main loop. Polls until `shutdown` broadcasts `true`; sleeps on the
    /// wake signal with a bounded timeout when the queue is idle.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(worker = %self.worker_id, "task worker loop started");
        let poll_interval = std::time::Duration::from_secs(self.config.poll_interval_secs);

        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.poll_once().await {
                Ok(true) => continue, // drained one task — look for the next
                Ok(false) => {}
                Err(e) => {
                    error!(worker = %self.worker_id, error = %e, "worker poll error");
                }
            }
            tokio::select! {
                _ = self.signal.wait() => {
                    debug!(worker = %self.worker_id, "woken by enqueue signal");
                }
                _ = tokio::time::sleep(poll_interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(worker = %self.worker_id, "task worker stopped");
    }

    /// Dequeue and process at most one task. Returns whether one ran.
    pub async fn poll_once(&self) -> Result<bool> {
        let handled: Vec<String> = self.handlers.keys().cloned().collect();
        if handled.is_empty() {
            warn!(worker = %self.worker_id, "no handlers registered");
            return Ok(false);
        }

        let now = self.clock.now();
        let lease = Duration::seconds(self.config.lease_duration_secs as i64);
        let Some(task) = tasks::dequeue(&self.db, &self.worker_id, &handled, lease, now)? else {
            return Ok(false);
        };

        self.process(task).await;
        Ok(true)
    }

    async fn process(&self, task: TaskRecord) {
        info!(
            worker = %self.worker_id,
            task_id = %task.task_id,
            task_type = %task.task_type,
            "processing task"
        );

        let Some(handler) = self.handlers.get(&task.task_type) else {
            // Dequeue respects handled types, so this is a wiring bug —
            // make it loudly visible instead of silently dropping the row.
            error!(task_id = %task.task_id, task_type = %task.task_type, "no handler for dequeued task");
            let message = format!("No handler registered for type {}", task.task_type);
            if let Err(e) =
                tasks::update_status(&self.db, &task.task_id, TaskStatus::Failed, Some(&message))
            {
                error!(task_id = %task.task_id, error = %e, "failed to mark handlerless task");
            }
            return;
        };

        let handle = TaskHandle {
            db: self.db.clone(),
            task_id: task.task_id.clone(),
            worker_id: self.worker_id.clone(),
            lease_duration: Duration::seconds(self.config.lease_duration_secs as i64),
            clock: self.clock.clone(),
        };

        match handler(task.clone(), handle).await {
            Ok(()) => self.complete(task).await,
            Err(message) => self.fail(task, message),
        }
    }

    async fn complete(&self, task: TaskRecord) {
        if let Err(e) = tasks::update_status(&self.db, &task.task_id, TaskStatus::Done, None) {
            error!(task_id = %task.task_id, error = %e, "failed to mark task done");
            return;
        }
        info!(worker = %self.worker_id, task_id = %task.task_id, "task completed");

        for hook in &self.hooks {
            hook.on_task_done(&task).await;
        }

        // Row-level recurrence: only successful runs expand, and the next
        // occurrence anchors on the completed row's scheduled_at, not now.
        if let Some(rule) = &task.recurrence_rule {
            if let Err(e) = self.enqueue_next_occurrence(&task, rule) {
                // The original run already succeeded; recurrence trouble is
                // logged, not propagated into the task status.
                error!(task_id = %task.task_id, error = %e, "failed to schedule recurrence");
            }
        }
    }

    fn enqueue_next_occurrence(&self, task: &TaskRecord, rule: &str) -> Result<()> {
        let next = recurrence::next_after(rule, task.scheduled_at)
            .map_err(|e| crate::error::QueueError::Recurrence(e.to_string()))?;
        let Some(next) = next else {
            info!(task_id = %task.task_id, "recurrence exhausted — no successor");
            return Ok(());
        };

        let original = task
            .original_task_id
            .clone()
            .unwrap_or_else(|| task.task_id.clone());
        let next_id = recurrence_task_id(&original, next);

        let inserted = enqueue_task(
            &self.db,
            Some(&self.signal),
            &next_id,
            &task.task_type,
            &task.payload,
            EnqueueOptions {
                scheduled_at: Some(next),
                max_retries: Some(task.max_retries),
                recurrence_rule: Some(rule.to_string()),
                original_task_id: Some(original.clone()),
            },
        )?;
        if inserted {
            info!(task_id = %task.task_id, %next_id, at = %next, "recurring successor enqueued");
        }
        Ok(())
    }

    fn fail(&self, task: TaskRecord, message: String) {
        error!(
            worker = %self.worker_id,
            task_id = %task.task_id,
            retry = task.retry_count,
            max_retries = task.max_retries,
            error = %message,
            "task handler failed"
        );

        if task.retry_count < task.max_retries {
            let backoff = self.backoff_delay(task.retry_count);
            let next_attempt = self.clock.now() + backoff;
            if let Err(e) = tasks::reschedule_for_retry(
                &self.db,
                &task.task_id,
                next_attempt,
                task.retry_count + 1,
                &message,
            ) {
                error!(task_id = %task.task_id, error = %e, "reschedule failed — marking task failed");
                let combined = format!("Handler error: {message}. Reschedule failed: {e}");
                let _ = tasks::update_status(
                    &self.db,
                    &task.task_id,
                    TaskStatus::Failed,
                    Some(&combined),
                );
            }
        } else {
            warn!(task_id = %task.task_id, "max retries reached — marking failed");
            if let Err(e) =
                tasks::update_status(&self.db, &task.task_id, TaskStatus::Failed, Some(&message))
            {
                error!(task_id = %task.task_id, error = %e, "failed to mark task failed");
            }
        }
    }

    /// base · 2^retry + jitter ∈ [0, jitter_max].
    fn backoff_delay(&self, retry_count: u32) -> Duration {
        let base = self.config.retry_backoff_base_secs as f64;
        let exponential = base * 2f64.powi(retry_count.min(16) as i32);
        let jitter = rand::thread_rng().gen_range(0.0..=self.config.retry_jitter_max_secs as f64);
        Duration::milliseconds(((exponential + jitter) * 1000.0) as i64)
    }
}

/// Compute the deterministic recurrence id used for successor rows.
/// Exposed for tests and listings.
pub fn recurrence_task_id(original_task_id: &str, next: DateTime<Utc>) -> String {
    format!("{original_task_id}_recur_{}", next.to_rfc3339())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use haven_core::clock::ManualClock;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn worker_with_clock(db: &Db, clock: Arc<ManualClock>) -> TaskWorker {
        TaskWorker::new(db.clone(), WorkerConfig::default()).with_clock(clock)
    }

    fn now0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    fn counting_handler(
        calls: Arc<AtomicUsize>,
        fail_first_n: usize,
    ) -> TaskHandler {
        Arc::new(move |_task, _handle| {
            let calls = calls.clone();
            Box::pin(async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < fail_first_n {
                    Err("transient failure".to_string())
                } else {
                    Ok(())
                }
            })
        })
    }

    #[tokio::test]
    async fn retry_then_success() {
        let db = Db::open_in_memory().unwrap();
        let clock = Arc::new(ManualClock::new(now0()));
        let mut worker = worker_with_clock(&db, clock.clone());
        let calls = Arc::new(AtomicUsize::new(0));
        worker.register_handler("llm_callback", counting_handler(calls.clone(), 1));

        enqueue_task(
            &db,
            None,
            "t1",
            "llm_callback",
            &json!({"conversation_id": "c1"}),
            EnqueueOptions {
                max_retries: Some(3),
                ..Default::default()
            },
        )
        .unwrap();

        // First run fails → rescheduled with backoff ≈ 5s + jitter.
        assert!(worker.poll_once().await.unwrap());
        let task = tasks::get(&db, "t1").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.last_error.as_deref(), Some("transient failure"));
        let delay = task.scheduled_at - now0();
        assert!(delay >= Duration::seconds(5) && delay <= Duration::seconds(8));

        // Not due yet.
        assert!(!worker.poll_once().await.unwrap());

        // Past the backoff: second run succeeds.
        clock.advance(Duration::seconds(10));
        assert!(worker.poll_once().await.unwrap());
        let task = tasks::get(&db, "t1").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // No recurrence rule — no extra rows.
        assert_eq!(tasks::list(&db, None, 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_mark_failed() {
        let db = Db::open_in_memory().unwrap();
        let clock = Arc::new(ManualClock::new(now0()));
        let mut worker = worker_with_clock(&db, clock.clone());
        let calls = Arc::new(AtomicUsize::new(0));
        worker.register_handler("llm_callback", counting_handler(calls.clone(), 99));

        enqueue_task(
            &db,
            None,
            "t1",
            "llm_callback",
            &json!({}),
            EnqueueOptions {
                max_retries: Some(1),
                ..Default::default()
            },
        )
        .unwrap();

        assert!(worker.poll_once().await.unwrap());
        clock.advance(Duration::seconds(30));
        assert!(worker.poll_once().await.unwrap());

        let task = tasks::get(&db, "t1").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn successful_recurring_task_enqueues_exactly_one_successor() {
        let db = Db::open_in_memory().unwrap();
        let clock = Arc::new(ManualClock::new(now0()));
        let mut worker = worker_with_clock(&db, clock.clone());
        worker.register_handler("llm_callback", counting_handler(Arc::new(AtomicUsize::new(0)), 0));

        let scheduled = now0() - Duration::minutes(5);
        enqueue_task(
            &db,
            None,
            "daily",
            "llm_callback",
            &json!({"callback_context": "check in"}),
            EnqueueOptions {
                scheduled_at: Some(scheduled),
                recurrence_rule: Some("FREQ=DAILY;BYHOUR=11;BYMINUTE=55".into()),
                max_retries: Some(2),
                ..Default::default()
            },
        )
        .unwrap();

        assert!(worker.poll_once().await.unwrap());

        let all = tasks::list(&db, None, 10).unwrap();
        assert_eq!(all.len(), 2);
        let successor = all.iter().find(|t| t.task_id != "daily").unwrap();

        // Next occurrence is computed strictly after the completed row's
        // scheduled_at (11:55), not after "now".
        let expected = Utc.with_ymd_and_hms(2025, 3, 2, 11, 55, 0).unwrap();
        assert_eq!(successor.scheduled_at, expected);
        assert_eq!(successor.task_id, recurrence_task_id("daily", expected));
        assert_eq!(successor.original_task_id.as_deref(), Some("daily"));
        assert_eq!(successor.recurrence_rule.as_deref(), Some("FREQ=DAILY;BYHOUR=11;BYMINUTE=55"));
        assert_eq!(successor.max_retries, 2);
        assert_eq!(successor.payload, json!({"callback_context": "check in"}));
        assert_eq!(successor.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn failed_run_does_not_trigger_recurrence() {
        let db = Db::open_in_memory().unwrap();
        let clock = Arc::new(ManualClock::new(now0()));
        let mut worker = worker_with_clock(&db, clock.clone());
        worker.register_handler("llm_callback", counting_handler(Arc::new(AtomicUsize::new(0)), 99));

        enqueue_task(
            &db,
            None,
            "daily",
            "llm_callback",
            &json!({}),
            EnqueueOptions {
                recurrence_rule: Some("FREQ=DAILY;BYHOUR=7".into()),
                max_retries: Some(1),
                ..Default::default()
            },
        )
        .unwrap();

        assert!(worker.poll_once().await.unwrap());
        assert_eq!(tasks::list(&db, None, 10).unwrap().len(), 1, "retry, not recurrence");
    }

    #[tokio::test]
    async fn after_hooks_run_on_success() {
        struct Recorder(AtomicUsize);

        #[async_trait::async_trait]
        impl AfterTaskHook for Recorder {
            async fn on_task_done(&self, _task: &TaskRecord) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let db = Db::open_in_memory().unwrap();
        let clock = Arc::new(ManualClock::new(now0()));
        let mut worker = worker_with_clock(&db, clock);
        worker.register_handler("llm_callback", counting_handler(Arc::new(AtomicUsize::new(0)), 0));
        let recorder = Arc::new(Recorder(AtomicUsize::new(0)));
        worker.add_after_hook(recorder.clone());

        enqueue_task(&db, None, "t", "llm_callback", &json!({}), Default::default()).unwrap();
        assert!(worker.poll_once().await.unwrap());
        assert_eq!(recorder.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn lease_check_in_extends_expiry() {
        let db = Db::open_in_memory().unwrap();
        let clock = Arc::new(ManualClock::new(now0()));
        let mut worker = worker_with_clock(&db, clock.clone());

        let observed: Arc<std::sync::Mutex<Option<bool>>> =
            Arc::new(std::sync::Mutex::new(None));
        let observed2 = observed.clone();
        worker.register_handler(
            "llm_callback",
            Arc::new(move |_task, handle| {
                let observed = observed2.clone();
                Box::pin(async move {
                    *observed.lock().unwrap() = Some(handle.check_in().unwrap());
                    Ok(())
                })
            }),
        );

        enqueue_task(&db, None, "t", "llm_callback", &json!({}), Default::default()).unwrap();
        assert!(worker.poll_once().await.unwrap());
        assert_eq!(*observed.lock().unwrap(), Some(true));
    }
}
