// End-to-end: a schedule automation wakes the assistant at its next
// occurrence, the turn is persisted, and the hook schedules the successor.

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use serde_json::json;

use haven_agent::handlers::{llm_callback_handler, HandlerDeps};
use haven_agent::replay::ScriptedClient;
use haven_agent::{LlmOutput, Orchestrator};
use haven_attachments::{AttachmentRegistry, BlobStore};
use haven_automations::ScheduleAfterHook;
use haven_core::clock::{Clock, ManualClock};
use haven_core::types::{ActionKind, Role, TaskStatus};
use haven_core::HavenConfig;
use haven_queue::TaskWorker;
use haven_storage::automations::{self, NewAutomation};
use haven_storage::{history, tasks, Db};
use haven_tools::{LocalToolsProvider, ToolsProvider};

#[tokio::test]
async fn scheduled_wake_delivers_callback_and_recurs() {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open_in_memory().unwrap();
    let store = BlobStore::new(dir.path()).unwrap();
    let attachments = AttachmentRegistry::new(db.clone(), store, "/attachments");
    let config = HavenConfig::default();

    let t0 = Utc.with_ymd_and_hms(2025, 3, 1, 5, 0, 0).unwrap();
    let clock = Arc::new(ManualClock::new(t0));

    let tools: Arc<dyn ToolsProvider> = Arc::new(LocalToolsProvider::new());
    let llm = Arc::new(ScriptedClient::new(vec![LlmOutput::text(
        "Good morning — here's your daily briefing.",
    )]));
    let orchestrator = Arc::new(
        Orchestrator::new(
            db.clone(),
            attachments.clone(),
            tools.clone(),
            llm.clone(),
            config.clone(),
        )
        .with_clock(clock.clone()),
    );

    let mut worker = TaskWorker::new(db.clone(), config.worker.clone()).with_clock(clock.clone());
    let signal = worker.signal();
    let deps = Arc::new(HandlerDeps {
        orchestrator,
        db: db.clone(),
        attachments,
        tools,
        signal: signal.clone(),
        config,
        chat: None,
    });
    worker.register_handler("llm_callback", llm_callback_handler(deps));
    worker.add_after_hook(Arc::new(
        ScheduleAfterHook::new(db.clone(), signal).with_clock(clock.clone()),
    ));

    // Create the automation at 05:00 — first instance lands at 07:00.
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
    let seven = Utc.with_ymd_and_hms(2025, 3, 1, 7, 0, 0).unwrap();
    assert_eq!(automation.next_scheduled_at, Some(seven));

    // Nothing is due yet.
    assert!(!worker.poll_once().await.unwrap());

    // Advance past 07:00: the instance is dequeued and the turn runs.
    clock.set(seven + Duration::seconds(30));
    assert!(worker.poll_once().await.unwrap());

    // One LLM call consumed, trigger + assistant message persisted.
    assert_eq!(llm.remaining(), 0);
    let messages = history::recent(&db, "c1", 10, None, clock.now()).unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert!(messages[0].content.contains("System Callback Trigger"));
    assert!(messages[0].content.contains("Daily briefing"));
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].content, "Good morning — here's your daily briefing.");

    // The automation advanced: stats bumped, next occurrence tomorrow 07:00.
    let updated = automations::get_schedule(&db, automation.id, None)
        .unwrap()
        .unwrap();
    assert_eq!(updated.execution_count, 1);
    let tomorrow_seven = Utc.with_ymd_and_hms(2025, 3, 2, 7, 0, 0).unwrap();
    assert_eq!(updated.next_scheduled_at, Some(tomorrow_seven));

    // Exactly one done instance and one pending successor.
    let done = tasks::list(&db, Some(TaskStatus::Done), 10).unwrap();
    assert_eq!(done.len(), 1);
    let pending = tasks::list(&db, Some(TaskStatus::Pending), 10).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].scheduled_at, tomorrow_seven);
    assert_eq!(pending[0].payload["automation_type"], "schedule");

    // Successor is not due before its time.
    assert!(!worker.poll_once().await.unwrap());
}

#[tokio::test]
async fn disabled_automation_stops_recurring() {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open_in_memory().unwrap();
    let store = BlobStore::new(dir.path()).unwrap();
    let attachments = AttachmentRegistry::new(db.clone(), store, "/attachments");
    let config = HavenConfig::default();

    let t0 = Utc.with_ymd_and_hms(2025, 3, 1, 5, 0, 0).unwrap();
    let clock = Arc::new(ManualClock::new(t0));
    let tools: Arc<dyn ToolsProvider> = Arc::new(LocalToolsProvider::new());
    let llm = Arc::new(ScriptedClient::new(vec![LlmOutput::text("briefing")]));
    let orchestrator = Arc::new(
        Orchestrator::new(db.clone(), attachments.clone(), tools.clone(), llm, config.clone())
            .with_clock(clock.clone()),
    );

    let mut worker = TaskWorker::new(db.clone(), config.worker.clone()).with_clock(clock.clone());
    let signal = worker.signal();
    worker.register_handler(
        "llm_callback",
        llm_callback_handler(Arc::new(HandlerDeps {
            orchestrator,
            db: db.clone(),
            attachments,
            tools,
            signal: signal.clone(),
            config,
            chat: None,
        })),
    );
    worker.add_after_hook(Arc::new(
        ScheduleAfterHook::new(db.clone(), signal).with_clock(clock.clone()),
    ));

    let automation = automations::create_schedule(
        &db,
        NewAutomation {
            name: "once-then-off".into(),
            description: None,
            conversation_id: "c1".into(),
            interface_type: "api".into(),
            action_type: ActionKind::WakeLlm,
            action_config: json!({"context": "ping"}),
        },
        "FREQ=DAILY;BYHOUR=7",
        t0,
    )
    .unwrap();

    // Disable before the first run fires.
    automations::set_schedule_enabled(&db, automation.id, "c1", false).unwrap();

    clock.set(Utc.with_ymd_and_hms(2025, 3, 1, 7, 0, 30).unwrap());
    assert!(worker.poll_once().await.unwrap());

    // Task ran (it was already queued), but no successor was scheduled.
    assert!(tasks::list(&db, Some(TaskStatus::Pending), 10)
        .unwrap()
        .is_empty());
    let updated = automations::get_schedule(&db, automation.id, None)
        .unwrap()
        .unwrap();
    assert_eq!(updated.execution_count, 0);
}
