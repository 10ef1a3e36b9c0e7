//! `haven-agent` — the LLM turn orchestrator and its provider contract.
//!
//! A *turn* is one orchestrator invocation: a trigger message, 1..N LLM
//! calls interleaved with tool executions, and one terminal assistant
//! message — every step persisted to history under a shared turn id.
//! Providers implement [`provider::LlmClient`]; one OpenAI-compatible HTTP
//! adapter ships here, plus recording/playback clients for tests.

pub mod context;
pub mod error;
pub mod handlers;
pub mod multimodal;
pub mod openai;
pub mod orchestrator;
pub mod provider;
pub mod replay;
pub mod selection;

pub use error::{AgentError, Result};
pub use orchestrator::{Orchestrator, TurnEvent, TurnInput, TurnResult};
pub use provider::{LlmClient, LlmOutput, ProviderCapabilities, StreamDelta, ToolCallRequest};
