//! `haven-queue` — the cooperative task worker over the durable queue.
//!
//! Workers poll the `tasks` table with a lease-based dequeue, execute
//! registered handlers, retry failures with exponential backoff, expand
//! row-level recurrences after success, and run after-execution hooks
//! (the schedule-automation hook lives in `haven-automations`).

pub mod error;
pub mod worker;

pub use error::{QueueError, Result};
pub use worker::{
    enqueue_task, AfterTaskHook, TaskHandle, TaskHandler, TaskWorker, WorkerSignal,
};
