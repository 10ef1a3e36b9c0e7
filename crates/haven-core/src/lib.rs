//! `haven-core` — shared foundation for the Haven assistant core.
//!
//! Holds the pieces every subsystem needs: configuration loading
//! (`haven.toml` + `HAVEN_*` env overrides), the shared error vocabulary,
//! common domain types (roles, task status, automation kinds, events), the
//! calendar recurrence evaluator, and the clock abstraction used to make
//! time-dependent code testable.

pub mod boundary;
pub mod clock;
pub mod config;
pub mod error;
pub mod recurrence;
pub mod types;

pub use clock::{Clock, SystemClock};
pub use config::HavenConfig;
pub use error::{HavenError, Result};
pub use recurrence::RecurrenceRule;
