//! Tracing setup plus the bridge persisting warn/error events into the
//! `error_logs` table.

use std::fmt::Write as _;

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use haven_storage::{error_log, Db};

/// Install the stdout subscriber (HAVEN_LOG / RUST_LOG filtered) with the
/// database error-log layer attached.
pub fn init(db: Db) {
    let filter = EnvFilter::try_from_env("HAVEN_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(ErrorLogLayer { db })
        .try_init();
}

/// Persists warn/error events. Failures to write are swallowed — logging
/// must never take the process down.
struct ErrorLogLayer {
    db: Db,
}

impl<S: Subscriber> Layer<S> for ErrorLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > Level::WARN {
            return;
        }
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let _ = error_log::append(
            &self.db,
            level.to_string().to_lowercase().as_str(),
            event.metadata().target(),
            &visitor.message,
            if visitor.fields.is_empty() {
                None
            } else {
                Some(visitor.fields.as_str())
            },
        );
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            let _ = write!(self.fields, "{}={:?} ", field.name(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visitor_separates_message_from_fields() {
        // Exercised through a real event dispatch.
        let db = Db::open_in_memory().unwrap();
        let subscriber = tracing_subscriber::registry().with(ErrorLogLayer { db: db.clone() });
        tracing::subscriber::with_default(subscriber, || {
            tracing::error!(task_id = "t1", "task failed hard");
            tracing::info!("this level is not persisted");
        });

        let entries = error_log::recent(&db, 10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].level, "error");
        assert!(entries[0].message.contains("task failed hard"));
        assert!(entries[0].traceback.as_deref().unwrap().contains("task_id"));
    }
}
