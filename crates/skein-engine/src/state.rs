//! Per-response stream processing state.

use skein_protocol::{FinishReason, StreamingToolCallUpdate, ToolCallRecord};

/// State for one in-flight model response.
///
/// Owned and exclusively mutated by the engine that created it; one
/// instance per response, applied strictly in chunk-arrival order, and
/// destroyed by finalization.
#[derive(Debug)]
pub struct StreamState {
    /// Every raw content character seen so far, append-only. Used by
    /// finalization to re-extract tool calls when per-chunk detection
    /// never fired.
    pub raw: String,

    /// Accumulated user-visible chat content (markup removed).
    pub content: String,

    /// Accumulated reasoning text.
    pub reasoning: String,

    /// Ordered tool-call records, index-addressable.
    pub tool_calls: Vec<ToolCallRecord>,

    /// Finish reason, once the provider reports one.
    pub finish_reason: Option<FinishReason>,

    /// Set on the first `process_chunk` call; finalization skips
    /// full-buffer re-extraction when streaming already ran.
    pub(crate) streamed: bool,

    /// Engine-specific machine state.
    pub(crate) fsm: Fsm,
}

impl StreamState {
    pub(crate) fn new(fsm: Fsm) -> Self {
        Self {
            raw: String::new(),
            content: String::new(),
            reasoning: String::new(),
            tool_calls: Vec::new(),
            finish_reason: None,
            streamed: false,
            fsm,
        }
    }

    /// Load a complete, non-streamed response payload into the state so
    /// that finalization can extract from it. Used when the provider
    /// returned the whole message in one non-streaming response and
    /// `process_chunk` was never called.
    pub fn ingest_full(&mut self, content: &str, reasoning: Option<&str>) {
        self.raw.push_str(content);
        if let Some(r) = reasoning {
            self.reasoning.push_str(r);
        }
    }
}

/// Engine-specific state, one closed variant per engine.
#[derive(Debug)]
pub(crate) enum Fsm {
    Native(crate::native::NativeFsm),
    Prompt(crate::prompt::PromptFsm),
    Seed(crate::seed::SeedFsm),
}

/// The incremental output of processing one chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkResult {
    /// User-visible content delta emitted by this chunk.
    pub content: String,

    /// Reasoning delta emitted by this chunk.
    pub reasoning: String,

    /// Tool-call updates emitted by this chunk, in order.
    pub tool_call_updates: Vec<StreamingToolCallUpdate>,
}

impl ChunkResult {
    /// Whether this chunk produced any tool-call update.
    pub fn has_tool_call_update(&self) -> bool {
        !self.tool_call_updates.is_empty()
    }

    /// Whether this chunk produced nothing at all.
    pub fn is_empty(&self) -> bool {
        self.content.is_empty() && self.reasoning.is_empty() && self.tool_call_updates.is_empty()
    }
}

/// A completed, fully parsed model response.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizedResponse {
    /// Final user-visible content.
    pub content: String,

    /// Final reasoning text, if any was produced.
    pub reasoning: Option<String>,

    /// Completed tool calls, in emission order.
    pub tool_calls: Vec<ToolCallRecord>,

    /// Why the response ended.
    pub finish_reason: FinishReason,
}
