//! The agent event stream.
//!
//! Every event a session's runtime emits is one of these variants. The
//! stream is append-only per session; the pure streaming-delta kinds are
//! excluded from persistence to bound storage growth, and the persisted
//! subset still reconstructs the final content, reasoning, tool calls,
//! and results.

use serde::{Deserialize, Serialize};

use crate::chunk::FinishReason;
use crate::tool_call::{StreamingToolCallUpdate, ToolCallRecord, ToolResultRecord};

/// Severity of a system message event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemLevel {
    Info,
    Warning,
    Error,
}

/// One event in a session's stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// A user message entering the conversation.
    UserMessage { timestamp: i64, content: String },

    /// A completed assistant turn.
    AssistantMessage {
        timestamp: i64,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reasoning_content: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCallRecord>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        finish_reason: Option<FinishReason>,
    },

    /// An in-flight content delta. Not persisted.
    AssistantStreamingMessage { timestamp: i64, content: String },

    /// An in-flight reasoning delta. Not persisted.
    AssistantStreamingThinking { timestamp: i64, content: String },

    /// An in-flight tool-call delta. Not persisted.
    StreamingToolCall {
        timestamp: i64,
        update: StreamingToolCallUpdate,
    },

    /// A fully assembled tool call ready for execution.
    ToolCall {
        timestamp: i64,
        tool_call: ToolCallRecord,
    },

    /// The result of executing a tool call.
    ToolResult {
        timestamp: i64,
        result: ToolResultRecord,
    },

    /// A system-originated message (diagnostics, errors).
    SystemMessage {
        timestamp: i64,
        level: SystemLevel,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<serde_json::Value>,
    },

    /// Input injected by the environment rather than the user.
    EnvironmentInput { timestamp: i64, content: String },
}

impl AgentEvent {
    /// The event's timestamp in milliseconds since the epoch.
    pub fn timestamp(&self) -> i64 {
        match self {
            AgentEvent::UserMessage { timestamp, .. }
            | AgentEvent::AssistantMessage { timestamp, .. }
            | AgentEvent::AssistantStreamingMessage { timestamp, .. }
            | AgentEvent::AssistantStreamingThinking { timestamp, .. }
            | AgentEvent::StreamingToolCall { timestamp, .. }
            | AgentEvent::ToolCall { timestamp, .. }
            | AgentEvent::ToolResult { timestamp, .. }
            | AgentEvent::SystemMessage { timestamp, .. }
            | AgentEvent::EnvironmentInput { timestamp, .. } => *timestamp,
        }
    }

    /// Whether this event belongs in the persisted stream.
    ///
    /// Streaming deltas are dropped; the final `AssistantMessage`,
    /// `ToolCall`, and `ToolResult` events carry everything needed to
    /// reconstruct the turn.
    pub fn should_persist(&self) -> bool {
        !matches!(
            self,
            AgentEvent::AssistantStreamingMessage { .. }
                | AgentEvent::AssistantStreamingThinking { .. }
                | AgentEvent::StreamingToolCall { .. }
        )
    }

    /// Whether this event is a terminal error.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            AgentEvent::SystemMessage {
                level: SystemLevel::Error,
                ..
            }
        )
    }

    /// Construct a user message stamped with the current time.
    pub fn user(content: impl Into<String>) -> Self {
        AgentEvent::UserMessage {
            timestamp: crate::now_millis(),
            content: content.into(),
        }
    }

    /// Construct an error system message stamped with the current time.
    pub fn error(message: impl Into<String>, detail: Option<serde_json::Value>) -> Self {
        AgentEvent::SystemMessage {
            timestamp: crate::now_millis(),
            level: SystemLevel::Error,
            message: message.into(),
            detail,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
