//! Event dispatcher: event sources in, matched automation tasks out.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use haven_core::types::{AutomationKind, Event};
use haven_queue::WorkerSignal;
use haven_storage::automations::{self, EventListener, TriggerOutcome};
use haven_storage::Db;

use crate::error::Result;
use crate::matcher::matches_conditions;

/// Wall-clock cap for a listener's condition script.
const CONDITION_SCRIPT_TIMEOUT_SECS: u64 = 10;

/// Matches inbound events against event automations and enqueues their
/// action tasks.
///
/// Keeps an in-memory `source → listener ids` index, rebuilt on startup and
/// updated on automation CRUD; the index is a routing hint only — listener
/// rows are re-read from the database at dispatch time so a concurrent
/// disable is always honored.
pub struct EventDispatcher {
    db: Db,
    signal: WorkerSignal,
    index: DashMap<String, HashSet<i64>>,
    /// Optional per-day trigger cap per listener.
    max_daily: Option<u32>,
    /// Internal subscribers receiving a copy of every event.
    subscribers: std::sync::Mutex<Vec<mpsc::Sender<Event>>>,
}

impl EventDispatcher {
    pub fn new(db: Db, signal: WorkerSignal, max_daily: Option<u32>) -> Self {
        Self {
            db,
            signal,
            index: DashMap::new(),
            max_daily,
            subscribers: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Rebuild the listener index from the database (startup, or recovery
    /// after suspected drift).
    pub fn rebuild_index(&self) -> Result<()> {
        self.index.clear();
        let listeners = automations::list_listeners(&self.db, None, true)?;
        for listener in &listeners {
            self.index
                .entry(listener.source_id.clone())
                .or_default()
                .insert(listener.id);
        }
        info!(listeners = listeners.len(), "event listener index rebuilt");
        Ok(())
    }

    /// Incremental index maintenance, called by the automation CRUD surface.
    pub fn index_listener(&self, source_id: &str, listener_id: i64) {
        self.index
            .entry(source_id.to_string())
            .or_default()
            .insert(listener_id);
    }

    pub fn unindex_listener(&self, source_id: &str, listener_id: i64) {
        if let Some(mut ids) = self.index.get_mut(source_id) {
            ids.remove(&listener_id);
        }
    }

    /// Register an internal subscriber (e.g. the worker-completion watcher).
    pub fn subscribe(&self) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(64);
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    /// Consume events from a source channel until it closes. Run as a
    /// cooperative task per process.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<Event>) {
        info!("event dispatcher started");
        while let Some(event) = events.recv().await {
            if let Err(e) = self.dispatch(&event).await {
                error!(source = %event.source, error = %e, "event dispatch failed");
            }
        }
        info!("event dispatcher stopped");
    }

    /// Match one event against its source's listeners. Returns the number
    /// of automation tasks enqueued.
    pub async fn dispatch(&self, event: &Event) -> Result<usize> {
        debug!(source = %event.source, "dispatching event");

        // Fan out to internal subscribers first; they see every event.
        {
            let mut subscribers = self.subscribers.lock().unwrap();
            subscribers.retain(|tx| tx.try_send(event.clone()).is_ok() || !tx.is_closed());
        }

        let candidate_ids: Vec<i64> = self
            .index
            .get(&event.source)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        if candidate_ids.is_empty() {
            return Ok(0);
        }

        let event_value = event.as_value();
        let mut fired = 0usize;

        for listener_id in candidate_ids {
            let Some(listener) = automations::get_listener(&self.db, listener_id, None)? else {
                // Deleted since indexing — drop the stale entry.
                self.unindex_listener(&event.source, listener_id);
                continue;
            };
            if !listener.enabled {
                continue;
            }
            if !matches_conditions(&listener.match_conditions, &event_value) {
                continue;
            }
            if !self.condition_script_holds(&listener, &event_value).await {
                continue;
            }

            if self.trigger(&listener, event, &event_value).await? {
                fired += 1;
                if listener.one_time {
                    self.unindex_listener(&event.source, listener.id);
                }
            }
        }

        if fired > 0 {
            self.signal.notify();
        }
        Ok(fired)
    }

    /// Evaluate the optional condition script. Script errors mean the
    /// listener does not trigger this time — and stays enabled.
    async fn condition_script_holds(&self, listener: &EventListener, event: &Value) -> bool {
        let Some(script) = &listener.condition_script else {
            return true;
        };
        match haven_scripting::evaluate_condition(script, event, CONDITION_SCRIPT_TIMEOUT_SECS)
            .await
        {
            Ok(holds) => holds,
            Err(e) => {
                error!(
                    listener_id = listener.id,
                    listener = %listener.name,
                    error = %e,
                    "condition script failed — listener not triggered"
                );
                false
            }
        }
    }

    async fn trigger(
        &self,
        listener: &EventListener,
        event: &Event,
        event_value: &Value,
    ) -> Result<bool> {
        let mut payload = automations::action_payload(
            AutomationKind::Event,
            listener.id,
            &listener.conversation_id,
            &listener.interface_type,
            &listener.name,
            listener.action_type,
            &listener.action_config,
        );
        if let Some(map) = payload.as_object_mut() {
            map.insert("event".into(), event_value.clone());
        }

        let task_id = format!("event_auto_{}_{}", listener.id, &Uuid::new_v4().simple().to_string()[..8]);
        let outcome = automations::trigger_listener(
            &self.db,
            listener.id,
            &task_id,
            listener.action_type.task_type(),
            &payload,
            self.max_daily,
            event.timestamp,
        )?;

        match outcome {
            TriggerOutcome::Fired => {
                info!(
                    listener_id = listener.id,
                    listener = %listener.name,
                    %task_id,
                    "event automation triggered"
                );
                Ok(true)
            }
            TriggerOutcome::NotEligible => Ok(false),
            TriggerOutcome::RateLimited => {
                warn!(listener_id = listener.id, "listener skipped: daily cap reached");
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use haven_core::types::{ActionKind, TaskStatus};
    use haven_storage::automations::{NewAutomation, NewListener};
    use haven_storage::tasks;
    use serde_json::json;

    fn listener_spec(name: &str, one_time: bool, conditions: Value) -> NewListener {
        NewListener {
            base: NewAutomation {
                name: name.to_string(),
                description: None,
                conversation_id: "c1".to_string(),
                interface_type: "api".to_string(),
                action_type: ActionKind::Script,
                action_config: json!({"script_code": "print('door opened')"}),
            },
            source_id: "home_assistant".to_string(),
            match_conditions: conditions,
            condition_script: None,
            one_time,
        }
    }

    fn dispatcher(db: &Db) -> EventDispatcher {
        EventDispatcher::new(db.clone(), WorkerSignal::new(), None)
    }

    fn door_event() -> Event {
        Event::new(
            "home_assistant",
            json!({"entity_id": "sensor.door", "new_state": {"state": "open"}}),
        )
    }

    #[tokio::test]
    async fn one_time_listener_fires_once() {
        let db = Db::open_in_memory().unwrap();
        automations::create_listener(
            &db,
            listener_spec(
                "door",
                true,
                json!({"entity_id": "sensor.door", "new_state.state": "open"}),
            ),
            Utc::now(),
        )
        .unwrap();

        let dispatcher = dispatcher(&db);
        dispatcher.rebuild_index().unwrap();

        assert_eq!(dispatcher.dispatch(&door_event()).await.unwrap(), 1);

        let pending = tasks::list(&db, Some(TaskStatus::Pending), 10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].task_type, "script_execution");
        assert_eq!(pending[0].payload["automation_type"], "event");
        assert_eq!(pending[0].payload["script_code"], "print('door opened')");
        assert_eq!(pending[0].payload["event"]["entity_id"], "sensor.door");

        // Same event again: listener is disabled, nothing fires.
        assert_eq!(dispatcher.dispatch(&door_event()).await.unwrap(), 0);
        assert_eq!(tasks::list(&db, None, 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn non_matching_events_do_not_fire() {
        let db = Db::open_in_memory().unwrap();
        automations::create_listener(
            &db,
            listener_spec("door", false, json!({"new_state.state": "open"})),
            Utc::now(),
        )
        .unwrap();
        let dispatcher = dispatcher(&db);
        dispatcher.rebuild_index().unwrap();

        let closed = Event::new(
            "home_assistant",
            json!({"entity_id": "sensor.door", "new_state": {"state": "closed"}}),
        );
        assert_eq!(dispatcher.dispatch(&closed).await.unwrap(), 0);

        // Wrong source entirely.
        let other = Event::new("webhook", json!({"new_state": {"state": "open"}}));
        assert_eq!(dispatcher.dispatch(&other).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn condition_script_gates_and_its_errors_skip() {
        let db = Db::open_in_memory().unwrap();
        let mut spec = listener_spec("guarded", false, json!({}));
        spec.condition_script = Some("event[\"new_state\"][\"state\"] == \"open\"".to_string());
        automations::create_listener(&db, spec, Utc::now()).unwrap();

        let mut broken = listener_spec("broken", false, json!({}));
        broken.condition_script = Some("fail(\"boom\")".to_string());
        automations::create_listener(&db, broken, Utc::now()).unwrap();

        let dispatcher = dispatcher(&db);
        dispatcher.rebuild_index().unwrap();

        // Guarded listener fires, broken one is skipped but stays enabled.
        assert_eq!(dispatcher.dispatch(&door_event()).await.unwrap(), 1);
        let broken_row = automations::list_listeners(&db, Some("c1"), false)
            .unwrap()
            .into_iter()
            .find(|l| l.name == "broken")
            .unwrap();
        assert!(broken_row.enabled);
    }

    #[tokio::test]
    async fn wake_llm_listener_payload_carries_context_and_event() {
        let db = Db::open_in_memory().unwrap();
        let mut spec = listener_spec("wake", false, json!({}));
        spec.base.action_type = ActionKind::WakeLlm;
        spec.base.action_config = json!({"context": "Door watch"});
        automations::create_listener(&db, spec, Utc::now()).unwrap();

        let dispatcher = dispatcher(&db);
        dispatcher.rebuild_index().unwrap();
        assert_eq!(dispatcher.dispatch(&door_event()).await.unwrap(), 1);

        let pending = tasks::list(&db, Some(TaskStatus::Pending), 10).unwrap();
        assert_eq!(pending[0].task_type, "llm_callback");
        assert_eq!(pending[0].payload["callback_context"], "Door watch");
        assert_eq!(pending[0].payload["conversation_id"], "c1");
        assert_eq!(pending[0].payload["event"]["source"], "home_assistant");
    }

    #[tokio::test]
    async fn internal_subscribers_see_every_event() {
        let db = Db::open_in_memory().unwrap();
        let dispatcher = dispatcher(&db);
        let mut rx = dispatcher.subscribe();

        dispatcher.dispatch(&door_event()).await.unwrap();
        let received = rx.try_recv().unwrap();
        assert_eq!(received.source, "home_assistant");
    }
}
