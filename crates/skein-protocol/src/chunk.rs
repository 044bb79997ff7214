//! The provider chunk protocol consumed by the tool-call engines.
//!
//! Each chunk of a streamed completion carries an optional content delta,
//! an optional reasoning-content delta (a non-standard extension some
//! providers emit), an optional list of tool-call deltas with positional
//! indices, and an optional finish reason.

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Finish Reason
// ─────────────────────────────────────────────────────────────────────────────

/// Terminal classification of why a response stream ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural stop.
    Stop,
    /// A tool call is pending.
    ToolCalls,
    /// Token limit reached.
    Length,
    /// Provider-specific reason, carried verbatim.
    #[serde(untagged)]
    Other(String),
}

impl FinishReason {
    /// Parse a provider finish-reason string.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "stop" => FinishReason::Stop,
            "tool_calls" => FinishReason::ToolCalls,
            "length" => FinishReason::Length,
            other => FinishReason::Other(other.to_string()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Stream Chunk
// ─────────────────────────────────────────────────────────────────────────────

/// One chunk of a streamed model response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamChunk {
    /// User-visible content delta.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// Reasoning-content delta (non-standard provider extension).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,

    /// Pre-segmented tool-call deltas (native dialect only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallDelta>>,

    /// Finish reason, present on the final chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

impl StreamChunk {
    /// A chunk carrying only a content delta.
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            ..Default::default()
        }
    }

    /// A chunk carrying only a reasoning delta.
    pub fn reasoning(text: impl Into<String>) -> Self {
        Self {
            reasoning_content: Some(text.into()),
            ..Default::default()
        }
    }

    /// A chunk carrying only a finish reason.
    pub fn finish(reason: impl Into<String>) -> Self {
        Self {
            finish_reason: Some(reason.into()),
            ..Default::default()
        }
    }
}

/// One positional tool-call delta within a chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCallDelta {
    /// Positional index of the call this delta extends.
    pub index: usize,

    /// Call id fragment (usually complete on the first delta).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Tool name fragment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Arguments JSON fragment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finish_reason_parse() {
        assert_eq!(FinishReason::parse("stop"), FinishReason::Stop);
        assert_eq!(FinishReason::parse("tool_calls"), FinishReason::ToolCalls);
        assert_eq!(FinishReason::parse("length"), FinishReason::Length);
        assert_eq!(
            FinishReason::parse("content_filter"),
            FinishReason::Other("content_filter".to_string())
        );
    }

    #[test]
    fn test_chunk_deserialization() {
        let json = r#"{
            "content": "hello",
            "tool_calls": [{"index": 0, "id": "call_1", "name": "search", "arguments": "{\"q\""}]
        }"#;
        let chunk: StreamChunk = serde_json::from_str(json).unwrap();
        assert_eq!(chunk.content.as_deref(), Some("hello"));

        let deltas = chunk.tool_calls.unwrap();
        assert_eq!(deltas[0].index, 0);
        assert_eq!(deltas[0].name.as_deref(), Some("search"));
    }
}
