//! `haven-storage` — SQLite persistence for the Haven core.
//!
//! One database file is the sole source of truth for tasks, automations,
//! message history, attachments metadata, documents, and the error log.
//! Each repository module exposes free functions over a shared [`Db`]
//! handle; multi-row operations run inside explicit transactions.

pub mod a2a_tasks;
pub mod automations;
pub mod attachments;
pub mod db;
pub mod documents;
pub mod error;
pub mod error_log;
pub mod history;
pub mod notes;
pub mod tasks;
pub mod worker_tasks;

pub use db::Db;
pub use error::{Result, StorageError};
