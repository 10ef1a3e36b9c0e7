//! `haven-a2a` — the agent-to-agent wire server.
//!
//! Serves the agent card, a JSON-RPC 2.0 endpoint (`message/send`,
//! `message/stream`, `tasks/get`, `tasks/cancel`), and an SSE streaming
//! endpoint wrapping the orchestrator's turn events.

pub mod protocol;
pub mod server;

pub use protocol::{AgentCard, JsonRpcRequest, JsonRpcResponse};
pub use server::{router, A2aState};
