//! Shared wire and domain types for Skein.
//!
//! This crate defines the vocabulary the rest of the workspace speaks:
//! the agent event stream, tool-call records and their streaming updates,
//! chat messages exchanged with model providers, and the provider chunk
//! protocol consumed by the tool-call engines.

pub mod chat;
pub mod chunk;
pub mod event;
pub mod tool_call;

pub use chat::{ChatMessage, ChatRequest, Role, ToolDefinition};
pub use chunk::{FinishReason, StreamChunk, ToolCallDelta};
pub use event::{AgentEvent, SystemLevel};
pub use tool_call::{StreamingToolCallUpdate, ToolCallRecord, ToolResultRecord};

/// Milliseconds since the Unix epoch, the timestamp unit used across
/// persisted records and events.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
