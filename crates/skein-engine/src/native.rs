//! Engine for provider-native structured tool calling.
//!
//! The provider segments tool calls itself and streams indexed deltas:
//! each chunk may extend the call at `index` with id, name, and argument
//! fragments. The engine accumulates fragments per index (sparse-safe:
//! an out-of-range index grows the array rather than assuming contiguous
//! arrival) and emits a synthetic completion update for every open call
//! when the provider reports `finish_reason = "tool_calls"`.

use tracing::warn;

use skein_protocol::{
    ChatMessage, ChatRequest, FinishReason, StreamChunk, StreamingToolCallUpdate, ToolCallRecord,
    ToolDefinition, ToolResultRecord, tool_call::generate_call_id,
};

use crate::state::{ChunkResult, FinalizedResponse, Fsm, StreamState};
use crate::ToolCallEngine;

/// Engine for providers with native function-call support.
#[derive(Debug, Default)]
pub struct NativeEngine;

impl NativeEngine {
    /// Create a native engine.
    pub fn new() -> Self {
        Self
    }
}

/// Per-index bookkeeping parallel to `state.tool_calls`.
#[derive(Debug, Default)]
pub(crate) struct NativeFsm {
    /// Whether a start update has been emitted for each index.
    started: Vec<bool>,
    /// Whether a completion update has been emitted for each index.
    completed: Vec<bool>,
}

impl NativeFsm {
    /// Grow the bookkeeping (and the record list) to cover `index`.
    fn ensure_index(&mut self, tool_calls: &mut Vec<ToolCallRecord>, index: usize) {
        while tool_calls.len() <= index {
            tool_calls.push(ToolCallRecord {
                id: generate_call_id(),
                name: String::new(),
                arguments: String::new(),
            });
            self.started.push(false);
            self.completed.push(false);
        }
    }
}

impl ToolCallEngine for NativeEngine {
    fn prepare_prompt(&self, instructions: &str, _tools: &[ToolDefinition]) -> String {
        // Tools travel out-of-band in the request.
        instructions.to_string()
    }

    fn prepare_request(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        tools: &[ToolDefinition],
    ) -> ChatRequest {
        ChatRequest::new(model, messages).with_tools(tools.to_vec())
    }

    fn new_state(&self) -> StreamState {
        StreamState::new(Fsm::Native(NativeFsm::default()))
    }

    fn process_chunk(&self, chunk: &StreamChunk, state: &mut StreamState) -> ChunkResult {
        state.streamed = true;
        let mut result = ChunkResult::default();

        if let Some(ref content) = chunk.content {
            state.raw.push_str(content);
            state.content.push_str(content);
            result.content.push_str(content);
        }

        if let Some(ref reasoning) = chunk.reasoning_content {
            state.reasoning.push_str(reasoning);
            result.reasoning.push_str(reasoning);
        }

        if let Some(ref deltas) = chunk.tool_calls {
            let Fsm::Native(ref mut fsm) = state.fsm else {
                warn!("native engine applied to foreign stream state");
                return result;
            };

            for delta in deltas {
                fsm.ensure_index(&mut state.tool_calls, delta.index);
                let record = &mut state.tool_calls[delta.index];

                // The provider id is authoritative when it arrives before
                // the call has been announced downstream.
                if let Some(ref id) = delta.id {
                    if !fsm.started[delta.index] {
                        record.id = id.clone();
                    }
                }

                if let Some(ref name) = delta.name {
                    record.name.push_str(name);
                }

                if !fsm.started[delta.index] {
                    fsm.started[delta.index] = true;
                    result
                        .tool_call_updates
                        .push(StreamingToolCallUpdate::start(&record.id, &record.name));
                }

                if let Some(ref arguments) = delta.arguments {
                    if !arguments.is_empty() {
                        record.arguments.push_str(arguments);
                        result.tool_call_updates.push(StreamingToolCallUpdate::delta(
                            &record.id,
                            &record.name,
                            arguments,
                        ));
                    }
                }
            }
        }

        if let Some(ref reason) = chunk.finish_reason {
            let reason = FinishReason::parse(reason);
            if reason == FinishReason::ToolCalls {
                let Fsm::Native(ref mut fsm) = state.fsm else {
                    return result;
                };
                for (index, record) in state.tool_calls.iter().enumerate() {
                    if fsm.started[index] && !fsm.completed[index] {
                        fsm.completed[index] = true;
                        result
                            .tool_call_updates
                            .push(StreamingToolCallUpdate::complete(&record.id, &record.name));
                    }
                }
            }
            state.finish_reason = Some(reason);
        }

        result
    }

    fn finalize(&self, state: StreamState) -> FinalizedResponse {
        let mut tool_calls = Vec::with_capacity(state.tool_calls.len());
        for record in state.tool_calls {
            if record.name.is_empty() {
                warn!(id = %record.id, "dropping tool call with no name");
                continue;
            }
            if record.parsed_arguments().is_err() && !record.arguments.is_empty() {
                warn!(
                    id = %record.id,
                    name = %record.name,
                    "dropping tool call with malformed arguments"
                );
                continue;
            }
            tool_calls.push(record);
        }

        let finish_reason = state.finish_reason.unwrap_or(if tool_calls.is_empty() {
            FinishReason::Stop
        } else {
            FinishReason::ToolCalls
        });

        FinalizedResponse {
            content: state.content,
            reasoning: if state.reasoning.is_empty() {
                None
            } else {
                Some(state.reasoning)
            },
            tool_calls,
            finish_reason,
        }
    }

    fn assistant_history_message(&self, response: &FinalizedResponse) -> ChatMessage {
        if response.tool_calls.is_empty() {
            ChatMessage::assistant(response.content.clone())
        } else {
            ChatMessage::assistant_with_tool_calls(
                if response.content.is_empty() {
                    None
                } else {
                    Some(response.content.clone())
                },
                response.tool_calls.clone(),
            )
        }
    }

    fn tool_result_history_messages(&self, results: &[ToolResultRecord]) -> Vec<ChatMessage> {
        results
            .iter()
            .map(|r| ChatMessage::tool_result(&r.tool_call_id, &r.content))
            .collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use skein_protocol::ToolCallDelta;

    fn delta(index: usize, id: Option<&str>, name: Option<&str>, args: Option<&str>) -> StreamChunk {
        StreamChunk {
            tool_calls: Some(vec![ToolCallDelta {
                index,
                id: id.map(String::from),
                name: name.map(String::from),
                arguments: args.map(String::from),
            }]),
            ..Default::default()
        }
    }

    #[test]
    fn test_accumulates_deltas_by_index() {
        let engine = NativeEngine::new();
        let mut state = engine.new_state();

        let r1 = engine.process_chunk(&delta(0, Some("call_abc"), Some("search"), None), &mut state);
        assert_eq!(r1.tool_call_updates.len(), 1);
        assert!(r1.tool_call_updates[0].arguments_delta.is_empty());
        assert_eq!(r1.tool_call_updates[0].tool_call_id, "call_abc");

        let r2 = engine.process_chunk(&delta(0, None, None, Some("{\"q\":")), &mut state);
        let r3 = engine.process_chunk(&delta(0, None, None, Some("\"rust\"}")), &mut state);
        assert_eq!(r2.tool_call_updates.len(), 1);
        assert_eq!(r3.tool_call_updates.len(), 1);

        let r4 = engine.process_chunk(&StreamChunk::finish("tool_calls"), &mut state);
        assert_eq!(r4.tool_call_updates.len(), 1);
        assert!(r4.tool_call_updates[0].is_complete);

        let response = engine.finalize(state);
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].name, "search");
        assert_eq!(response.tool_calls[0].arguments, "{\"q\":\"rust\"}");
        assert_eq!(response.finish_reason, FinishReason::ToolCalls);
    }

    #[test]
    fn test_sparse_index_handled() {
        let engine = NativeEngine::new();
        let mut state = engine.new_state();

        // Index 1 arrives before index 0 ever does.
        let r = engine.process_chunk(&delta(1, Some("call_b"), Some("b"), Some("{}")), &mut state);
        assert_eq!(r.tool_call_updates.len(), 2); // start + delta
        assert_eq!(state.tool_calls.len(), 2);

        engine.process_chunk(&StreamChunk::finish("tool_calls"), &mut state);
        let response = engine.finalize(state);

        // The placeholder at index 0 has no name and is dropped.
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].name, "b");
    }

    #[test]
    fn test_reassembly_invariant() {
        let engine = NativeEngine::new();
        let mut state = engine.new_state();
        let mut assembled = String::new();

        for fragment in ["{\"pa", "th\": \"/tmp", "/x.rs\"}"] {
            let r = engine.process_chunk(&delta(0, Some("c1"), Some("read"), Some(fragment)), &mut state);
            for u in &r.tool_call_updates {
                assembled.push_str(&u.arguments_delta);
            }
        }
        let r = engine.process_chunk(&StreamChunk::finish("tool_calls"), &mut state);
        assert!(r.tool_call_updates.iter().any(|u| u.is_complete));

        let response = engine.finalize(state);
        assert_eq!(assembled, response.tool_calls[0].arguments);
        let parsed: serde_json::Value = serde_json::from_str(&assembled).unwrap();
        assert_eq!(parsed["path"], "/tmp/x.rs");
    }

    #[test]
    fn test_content_and_reasoning_pass_through() {
        let engine = NativeEngine::new();
        let mut state = engine.new_state();

        let r1 = engine.process_chunk(&StreamChunk::content("Hello"), &mut state);
        let r2 = engine.process_chunk(&StreamChunk::reasoning("thinking..."), &mut state);
        assert_eq!(r1.content, "Hello");
        assert_eq!(r2.reasoning, "thinking...");

        engine.process_chunk(&StreamChunk::finish("stop"), &mut state);
        let response = engine.finalize(state);
        assert_eq!(response.content, "Hello");
        assert_eq!(response.reasoning.as_deref(), Some("thinking..."));
        assert_eq!(response.finish_reason, FinishReason::Stop);
    }

    #[test]
    fn test_malformed_arguments_dropped() {
        let engine = NativeEngine::new();
        let mut state = engine.new_state();

        engine.process_chunk(&delta(0, Some("c1"), Some("bad"), Some("{not json")), &mut state);
        engine.process_chunk(&StreamChunk::finish("tool_calls"), &mut state);

        let response = engine.finalize(state);
        assert!(response.tool_calls.is_empty());
    }

    #[test]
    fn test_empty_tools_not_attached() {
        let engine = NativeEngine::new();
        let request = engine.prepare_request("m", vec![ChatMessage::user("hi")], &[]);
        assert!(request.tools.is_none());
    }

    #[test]
    fn test_history_messages() {
        let engine = NativeEngine::new();
        let response = FinalizedResponse {
            content: "checking".to_string(),
            reasoning: None,
            tool_calls: vec![ToolCallRecord {
                id: "c1".to_string(),
                name: "read".to_string(),
                arguments: "{}".to_string(),
            }],
            finish_reason: FinishReason::ToolCalls,
        };

        let message = engine.assistant_history_message(&response);
        assert!(message.tool_calls.is_some());

        let results = [ToolResultRecord::success("c1", "read", "contents")];
        let messages = engine.tool_result_history_messages(&results);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].tool_call_id.as_deref(), Some("c1"));
    }
}
