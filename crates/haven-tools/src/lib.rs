//! `haven-tools` — the tool surface the orchestrator and the script sandbox
//! execute against.
//!
//! A single [`ToolsProvider`] trait fronts four implementations: the local
//! registry of adapter closures, remote servers spoken to over stdio or
//! HTTP, the ordered composite, and the confirming decorator that gates
//! destructive tools behind a user callback.

pub mod composite;
pub mod confirming;
pub mod context;
pub mod error;
pub mod local;
pub mod provider;
pub mod remote;
pub mod types;

pub use composite::CompositeToolsProvider;
pub use confirming::ConfirmingToolsProvider;
pub use context::ToolExecutionContext;
pub use error::{Result, ToolError};
pub use local::LocalToolsProvider;
pub use provider::ToolsProvider;
pub use remote::RemoteToolsProvider;
pub use types::{ToolAttachment, ToolDefinition, ToolOutput};
