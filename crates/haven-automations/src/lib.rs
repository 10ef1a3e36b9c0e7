//! `haven-automations` — the unified automation engine.
//!
//! Two automation kinds share one lifecycle: schedule automations fire on
//! calendar recurrences (driven by the worker's after-execution hook), and
//! event automations fire when the dispatcher matches an inbound event
//! against their predicate. Persistence lives in `haven-storage`; this
//! crate owns the matching, dispatch, and hook logic plus the tool surface
//! for managing automations from a conversation.

pub mod dispatcher;
pub mod error;
pub mod matcher;
pub mod schedule;
pub mod tools;

pub use dispatcher::EventDispatcher;
pub use error::{AutomationError, Result};
pub use matcher::matches_conditions;
pub use schedule::ScheduleAfterHook;
