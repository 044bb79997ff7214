//! Tool-call records and streaming updates.

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Tool Call Record
// ─────────────────────────────────────────────────────────────────────────────

/// A tool invocation being assembled from model output.
///
/// `arguments` is built incrementally and is append-only: characters that
/// have been emitted to streaming consumers are never rewritten. The text
/// is guaranteed to be valid JSON only once the invocation closes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    /// Opaque id, generated once and stable for the life of the invocation.
    pub id: String,

    /// Tool name. May be filled in after the record is created when the
    /// name arrives later than the record's first byte.
    pub name: String,

    /// JSON-serialized arguments, built incrementally.
    pub arguments: String,
}

impl ToolCallRecord {
    /// Create a record with a freshly generated id.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: generate_call_id(),
            name: name.into(),
            arguments: String::new(),
        }
    }

    /// Parse the accumulated arguments as JSON.
    pub fn parsed_arguments(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_str(&self.arguments)
    }
}

/// Generate an opaque tool-call id.
pub fn generate_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

// ─────────────────────────────────────────────────────────────────────────────
// Streaming Update
// ─────────────────────────────────────────────────────────────────────────────

/// One streaming delta for a tool call.
///
/// Wire contract: concatenating every `arguments_delta` emitted for a given
/// `tool_call_id`, in emission order, yields exactly the record's arguments
/// text, and once `is_complete` has been seen that text parses as JSON.
/// The serialized field names are fixed for interop with existing clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingToolCallUpdate {
    /// Id of the tool call this delta belongs to.
    pub tool_call_id: String,

    /// Tool name (best known value at emission time).
    pub tool_name: String,

    /// Arguments fragment. Empty on the call-start update and on a purely
    /// synthetic completion update.
    pub arguments_delta: String,

    /// True exactly once per tool call, on its final update.
    pub is_complete: bool,
}

impl StreamingToolCallUpdate {
    /// A call-start update (empty delta).
    pub fn start(tool_call_id: impl Into<String>, tool_name: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            arguments_delta: String::new(),
            is_complete: false,
        }
    }

    /// An arguments-fragment update.
    pub fn delta(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments_delta: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            arguments_delta: arguments_delta.into(),
            is_complete: false,
        }
    }

    /// A completion update (empty delta, `is_complete` set).
    pub fn complete(tool_call_id: impl Into<String>, tool_name: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            arguments_delta: String::new(),
            is_complete: true,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tool Result
// ─────────────────────────────────────────────────────────────────────────────

/// The outcome of executing one tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResultRecord {
    /// Id of the tool call this result answers.
    pub tool_call_id: String,

    /// Name of the tool that was executed.
    pub tool_name: String,

    /// Result content rendered as text.
    pub content: String,

    /// Whether execution failed.
    pub is_error: bool,
}

impl ToolResultRecord {
    /// A successful result.
    pub fn success(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            content: content.into(),
            is_error: false,
        }
    }

    /// A failed result.
    pub fn error(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            content: content.into(),
            is_error: true,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_wire_shape() {
        let update = StreamingToolCallUpdate {
            tool_call_id: "call_1".to_string(),
            tool_name: "search".to_string(),
            arguments_delta: "{\"q\":".to_string(),
            is_complete: false,
        };

        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["toolCallId"], "call_1");
        assert_eq!(json["toolName"], "search");
        assert_eq!(json["argumentsDelta"], "{\"q\":");
        assert_eq!(json["isComplete"], false);
    }

    #[test]
    fn test_update_roundtrip() {
        let update = StreamingToolCallUpdate::complete("call_2", "read_file");
        let json = serde_json::to_string(&update).unwrap();
        let restored: StreamingToolCallUpdate = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, update);
        assert!(restored.is_complete);
        assert!(restored.arguments_delta.is_empty());
    }

    #[test]
    fn test_call_ids_are_unique() {
        let a = ToolCallRecord::new("t");
        let b = ToolCallRecord::new("t");
        assert_ne!(a.id, b.id);
        assert!(a.id.starts_with("call_"));
    }

    #[test]
    fn test_parsed_arguments() {
        let mut record = ToolCallRecord::new("search");
        record.arguments.push_str("{\"q\":\"space\"}");
        let parsed = record.parsed_arguments().unwrap();
        assert_eq!(parsed["q"], "space");
    }
}
