//! Streaming tool-call parsing engines.
//!
//! A [`ToolCallEngine`] turns a stream of model-output chunks into
//! structured events: user-visible content deltas, reasoning deltas, and
//! incrementally-built tool invocations. Three dialects are supported:
//!
//! - [`NativeEngine`] — the provider segments tool calls itself and
//!   streams indexed deltas out-of-band from the content.
//! - [`PromptEngine`] — tool calls are embedded in the text as
//!   `<tool_call>{json}</tool_call>` blocks.
//! - [`SeedEngine`] — a `<seed:tool_call>` block holding one or more
//!   `<function=name>` invocations with raw-text parameters, plus a
//!   dynamically-named think tag for reasoning.
//!
//! All engines uphold the same wire contract: concatenating the
//! `argumentsDelta` fragments emitted for a tool call reproduces its
//! arguments text exactly, and that text parses as JSON once the
//! completion update has been seen. Malformed tool-call payloads are
//! logged and dropped without failing the surrounding response.

pub mod catalog;
pub mod native;
pub mod prompt;
pub mod scanner;
pub mod seed;
mod state;

pub use native::NativeEngine;
pub use prompt::PromptEngine;
pub use scanner::{ScanItem, ScanOutcome, TagScanner};
pub use seed::SeedEngine;
pub use state::{ChunkResult, FinalizedResponse, StreamState};

use skein_protocol::{ChatMessage, ChatRequest, StreamChunk, ToolDefinition, ToolResultRecord};

/// Which parsing dialect an agent uses, fixed at construction time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineKind {
    /// Provider-native structured tool calling.
    Native,
    /// XML `<tool_call>` prompt-engineering dialect.
    PromptEngineering,
    /// `<seed:tool_call>` dialect with the given think-tag name.
    Seed { think_tag: String },
}

impl EngineKind {
    /// Construct the engine for this kind.
    pub fn build(&self) -> Box<dyn ToolCallEngine> {
        match self {
            EngineKind::Native => Box::new(NativeEngine::new()),
            EngineKind::PromptEngineering => Box::new(PromptEngine::new()),
            EngineKind::Seed { think_tag } => Box::new(SeedEngine::new(think_tag.clone())),
        }
    }
}

/// The capability contract shared by all three engines.
///
/// One engine instance serves one agent; one [`StreamState`] serves one
/// in-flight response and is mutated only by its engine, strictly in
/// chunk-arrival order.
pub trait ToolCallEngine: Send + Sync {
    /// Augment the system instructions with the tool catalogue and the
    /// dialect's call syntax. Engines whose provider carries tools
    /// out-of-band return the instructions unchanged.
    fn prepare_prompt(&self, instructions: &str, tools: &[ToolDefinition]) -> String;

    /// Shape the outbound provider request.
    fn prepare_request(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        tools: &[ToolDefinition],
    ) -> ChatRequest;

    /// A fresh state for one response.
    fn new_state(&self) -> StreamState;

    /// Apply one chunk. Never re-emits already-emitted output.
    fn process_chunk(&self, chunk: &StreamChunk, state: &mut StreamState) -> ChunkResult;

    /// Consume the state after the stream ends, producing the complete
    /// parsed response. When per-chunk detection never ran (the payload
    /// arrived as one non-streamed response), tool calls are extracted
    /// from the full buffer here instead; when streaming already
    /// produced records, re-extraction is skipped.
    fn finalize(&self, state: StreamState) -> FinalizedResponse;

    /// Serialize a completed turn back into conversation history.
    fn assistant_history_message(&self, response: &FinalizedResponse) -> ChatMessage;

    /// Render tool results back into history in the shape the model
    /// expects to see its own calls answered.
    fn tool_result_history_messages(&self, results: &[ToolResultRecord]) -> Vec<ChatMessage>;
}
