//! Engine for the XML `<tool_call>` prompt-engineering dialect.
//!
//! Tool calls are embedded in the model's text output as
//!
//! ```text
//! <tool_call>
//! {"name": "search", "parameters": {"q": "space"}}
//! </tool_call>
//! ```
//!
//! The engine is a character state machine over the content stream. While
//! a block is being collected it buffers until the `"name"` field becomes
//! matchable (lightweight scanning, not a full JSON parse — the object is
//! still incomplete), emits a zero-length start update, and once the
//! `"parameters"` object opens begins forwarding its characters verbatim
//! as argument deltas. The parameters object is pre-formed JSON in the
//! model's own output, so no re-escaping is applied; forwarding tracks
//! string- and escape-aware brace depth and stops exactly at the object's
//! matching `}`, which keeps the concatenation of the deltas equal to the
//! final arguments text.

use tracing::warn;

use skein_protocol::{
    ChatMessage, ChatRequest, FinishReason, StreamChunk, StreamingToolCallUpdate, ToolCallRecord,
    ToolDefinition, ToolResultRecord,
};

use crate::catalog::format_tool_catalog;
use crate::scanner::{TagMatch, match_tag};
use crate::state::{ChunkResult, FinalizedResponse, Fsm, StreamState};
use crate::ToolCallEngine;

const TOOL_OPEN: &str = "<tool_call>";
const TOOL_CLOSE: &str = "</tool_call>";

/// Engine for models instructed to emit `<tool_call>` blocks.
#[derive(Debug, Default)]
pub struct PromptEngine;

impl PromptEngine {
    /// Create a prompt-engineering engine.
    pub fn new() -> Self {
        Self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Machine State
// ─────────────────────────────────────────────────────────────────────────────

/// Forwarding phase within one `<tool_call>` block.
#[derive(Debug, Default, PartialEq, Eq)]
enum ArgPhase {
    /// The `"name"` field has not been located yet.
    #[default]
    SeekName,
    /// Name known; waiting for the `"parameters"` object to open.
    SeekParams,
    /// Forwarding the parameters object verbatim.
    Forward {
        depth: u32,
        in_string: bool,
        escaped: bool,
    },
    /// The parameters object closed; buffering the block's tail.
    Done,
}

#[derive(Debug, Default)]
pub(crate) struct PromptFsm {
    /// Retained tail that may still become a tag.
    pending: String,
    /// Inside a `<tool_call>` block.
    collecting: bool,
    /// Buffered block content (between the tags).
    block: String,
    /// Index into `state.tool_calls` of the block's record, once created.
    call_index: Option<usize>,
    phase: ArgPhase,
}

impl PromptFsm {
    fn reset_block(&mut self) {
        self.collecting = false;
        self.block.clear();
        self.call_index = None;
        self.phase = ArgPhase::SeekName;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Lightweight field scanning
// ─────────────────────────────────────────────────────────────────────────────

/// Find a complete `"key": "value"` string field in a partial JSON object.
/// Returns the decoded value only once its closing quote has arrived.
fn find_string_field(text: &str, key: &str) -> Option<String> {
    let needle = format!("\"{key}\"");
    let key_at = text.find(&needle)?;
    let rest = &text[key_at + needle.len()..];
    let rest = rest.trim_start();
    let rest = rest.strip_prefix(':')?;
    let rest = rest.trim_start();
    let rest = rest.strip_prefix('"')?;

    let mut value = String::new();
    let mut escaped = false;
    for c in rest.chars() {
        if escaped {
            match c {
                'n' => value.push('\n'),
                'r' => value.push('\r'),
                't' => value.push('\t'),
                other => value.push(other),
            }
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '"' {
            return Some(value);
        } else {
            value.push(c);
        }
    }
    None
}

/// Find the byte offset of the `{` opening the `"key": {` object value.
fn find_object_open(text: &str, key: &str) -> Option<usize> {
    let needle = format!("\"{key}\"");
    let key_at = text.find(&needle)?;
    let mut pos = key_at + needle.len();
    let bytes = text.as_bytes();

    while pos < bytes.len() && (bytes[pos] as char).is_whitespace() {
        pos += 1;
    }
    if pos >= bytes.len() || bytes[pos] != b':' {
        return None;
    }
    pos += 1;
    while pos < bytes.len() && (bytes[pos] as char).is_whitespace() {
        pos += 1;
    }
    if pos < bytes.len() && bytes[pos] == b'{' {
        Some(pos)
    } else {
        None
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

impl PromptEngine {
    /// Drive the machine over newly arrived content text.
    fn feed(&self, text: &str, state: &mut StreamState, result: &mut ChunkResult) {
        let Fsm::Prompt(fsm) = &mut state.fsm else {
            warn!("prompt engine applied to foreign stream state");
            return;
        };

        let mut buf = std::mem::take(&mut fsm.pending);
        buf.push_str(text);

        // Arguments characters forwarded during this feed, one delta per
        // chunk per call.
        let mut forwarded = String::new();

        let mut pos = 0;
        while pos < buf.len() {
            let rest = &buf[pos..];
            let tag = if fsm.collecting { TOOL_CLOSE } else { TOOL_OPEN };

            match match_tag(rest, tag) {
                TagMatch::Full => {
                    pos += tag.len();
                    if fsm.collecting {
                        Self::flush_forwarded(fsm, &state.tool_calls, &mut forwarded, result);
                        Self::close_block(fsm, &mut state.tool_calls, result);
                    } else {
                        fsm.collecting = true;
                    }
                    continue;
                }
                TagMatch::Partial => {
                    fsm.pending = rest.to_string();
                    break;
                }
                TagMatch::No => {}
            }

            let c = rest.chars().next().unwrap_or('\u{fffd}');
            pos += c.len_utf8();

            if fsm.collecting {
                fsm.block.push(c);
                Self::advance_block(fsm, &mut state.tool_calls, c, &mut forwarded, result);
            } else {
                state.content.push(c);
                result.content.push(c);
            }
        }

        Self::flush_forwarded(fsm, &state.tool_calls, &mut forwarded, result);
    }

    /// React to a character appended to the block buffer.
    fn advance_block(
        fsm: &mut PromptFsm,
        tool_calls: &mut Vec<ToolCallRecord>,
        c: char,
        forwarded: &mut String,
        result: &mut ChunkResult,
    ) {
        match fsm.phase {
            ArgPhase::SeekName => {
                if let Some(name) = find_string_field(&fsm.block, "name") {
                    let record = ToolCallRecord::new(name);
                    result
                        .tool_call_updates
                        .push(StreamingToolCallUpdate::start(&record.id, &record.name));
                    fsm.call_index = Some(tool_calls.len());
                    tool_calls.push(record);
                    fsm.phase = ArgPhase::SeekParams;
                    // The parameters object may already have opened in the
                    // same fragment; catch up from the block buffer.
                    Self::catch_up_params(fsm, tool_calls, forwarded);
                }
            }
            ArgPhase::SeekParams => {
                Self::catch_up_params(fsm, tool_calls, forwarded);
            }
            ArgPhase::Forward { .. } => {
                Self::forward_char(fsm, tool_calls, c, forwarded);
            }
            ArgPhase::Done => {}
        }
    }

    /// Once the parameters object's `{` is visible in the block buffer,
    /// switch to forwarding and replay any buffered object characters.
    fn catch_up_params(
        fsm: &mut PromptFsm,
        tool_calls: &mut [ToolCallRecord],
        forwarded: &mut String,
    ) {
        let Some(open_at) = find_object_open(&fsm.block, "parameters") else {
            return;
        };
        fsm.phase = ArgPhase::Forward {
            depth: 0,
            in_string: false,
            escaped: false,
        };
        // Replay everything from the `{` through the current end of the
        // block buffer.
        let tail: String = fsm.block[open_at..].to_string();
        for c in tail.chars() {
            Self::forward_char(fsm, tool_calls, c, forwarded);
        }
    }

    /// Forward one character of the parameters object, tracking string
    /// and escape state so forwarding stops at the matching `}`.
    fn forward_char(
        fsm: &mut PromptFsm,
        tool_calls: &mut [ToolCallRecord],
        c: char,
        forwarded: &mut String,
    ) {
        let ArgPhase::Forward {
            ref mut depth,
            ref mut in_string,
            ref mut escaped,
        } = fsm.phase
        else {
            return;
        };

        let mut closed = false;
        if *in_string {
            if *escaped {
                *escaped = false;
            } else if c == '\\' {
                *escaped = true;
            } else if c == '"' {
                *in_string = false;
            }
        } else {
            match c {
                '{' => *depth += 1,
                '}' => {
                    *depth -= 1;
                    if *depth == 0 {
                        closed = true;
                    }
                }
                '"' => *in_string = true,
                _ => {}
            }
        }

        if let Some(index) = fsm.call_index {
            tool_calls[index].arguments.push(c);
        }
        forwarded.push(c);

        if closed {
            fsm.phase = ArgPhase::Done;
        }
    }

    /// Emit the characters forwarded so far as one delta update.
    fn flush_forwarded(
        fsm: &PromptFsm,
        tool_calls: &[ToolCallRecord],
        forwarded: &mut String,
        result: &mut ChunkResult,
    ) {
        if forwarded.is_empty() {
            return;
        }
        if let Some(index) = fsm.call_index {
            let record = &tool_calls[index];
            result.tool_call_updates.push(StreamingToolCallUpdate::delta(
                &record.id,
                &record.name,
                std::mem::take(forwarded),
            ));
        } else {
            forwarded.clear();
        }
    }

    /// Handle the closing tag: validate the buffered block and emit the
    /// completion update, or drop the call if the payload is malformed.
    fn close_block(
        fsm: &mut PromptFsm,
        tool_calls: &mut Vec<ToolCallRecord>,
        result: &mut ChunkResult,
    ) {
        let parsed: Result<serde_json::Value, _> = serde_json::from_str(fsm.block.trim());

        match parsed {
            Ok(value)
                if value.get("name").and_then(|n| n.as_str()).is_some()
                    && value.get("parameters").map(|p| p.is_object()).unwrap_or(false) =>
            {
                if let Some(index) = fsm.call_index {
                    let record = &tool_calls[index];
                    result
                        .tool_call_updates
                        .push(StreamingToolCallUpdate::complete(&record.id, &record.name));
                } else {
                    // The name never became matchable during streaming
                    // (degenerate formatting); synthesize the call now.
                    let name = value["name"].as_str().unwrap_or_default();
                    let arguments = value["parameters"].to_string();
                    let mut record = ToolCallRecord::new(name);
                    record.arguments = arguments.clone();
                    result
                        .tool_call_updates
                        .push(StreamingToolCallUpdate::start(&record.id, &record.name));
                    result.tool_call_updates.push(StreamingToolCallUpdate::delta(
                        &record.id,
                        &record.name,
                        arguments,
                    ));
                    result
                        .tool_call_updates
                        .push(StreamingToolCallUpdate::complete(&record.id, &record.name));
                    tool_calls.push(record);
                }
            }
            _ => {
                warn!(
                    block_len = fsm.block.len(),
                    "dropping malformed tool_call block"
                );
                if let Some(index) = fsm.call_index {
                    tool_calls.remove(index);
                }
            }
        }

        fsm.reset_block();
    }

    /// Extract tool calls from a complete, non-streamed payload.
    fn extract_full(&self, raw: &str) -> (String, Vec<ToolCallRecord>) {
        let mut content = String::new();
        let mut tool_calls = Vec::new();
        let mut rest = raw;

        while let Some(open_at) = rest.find(TOOL_OPEN) {
            content.push_str(&rest[..open_at]);
            let after_open = &rest[open_at + TOOL_OPEN.len()..];
            let Some(close_at) = after_open.find(TOOL_CLOSE) else {
                // Unterminated block at end of payload.
                warn!("unterminated tool_call block in non-streamed payload");
                break;
            };
            let block = &after_open[..close_at];
            match serde_json::from_str::<serde_json::Value>(block.trim()) {
                Ok(value)
                    if value.get("name").and_then(|n| n.as_str()).is_some()
                        && value.get("parameters").map(|p| p.is_object()).unwrap_or(false) =>
                {
                    let mut record =
                        ToolCallRecord::new(value["name"].as_str().unwrap_or_default());
                    record.arguments = value["parameters"].to_string();
                    tool_calls.push(record);
                }
                _ => {
                    warn!("dropping malformed tool_call block in non-streamed payload");
                }
            }
            rest = &after_open[close_at + TOOL_CLOSE.len()..];
        }
        content.push_str(rest);

        (content, tool_calls)
    }
}

impl ToolCallEngine for PromptEngine {
    fn prepare_prompt(&self, instructions: &str, tools: &[ToolDefinition]) -> String {
        if tools.is_empty() {
            return instructions.to_string();
        }
        format!(
            "{instructions}\n\n{}\n\
             When you need to call a tool, output exactly one block per call:\n\
             {TOOL_OPEN}\n\
             {{\"name\": \"tool-name\", \"parameters\": {{...}}}}\n\
             {TOOL_CLOSE}\n\
             The block must contain a single JSON object with a \"name\" string \
             and a \"parameters\" object. Do not put any other text inside the block.",
            format_tool_catalog(tools)
        )
    }

    fn prepare_request(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        _tools: &[ToolDefinition],
    ) -> ChatRequest {
        // Tools are injected into the prompt, never attached structurally.
        ChatRequest::new(model, messages)
    }

    fn new_state(&self) -> StreamState {
        StreamState::new(Fsm::Prompt(PromptFsm::default()))
    }

    fn process_chunk(&self, chunk: &StreamChunk, state: &mut StreamState) -> ChunkResult {
        state.streamed = true;
        let mut result = ChunkResult::default();

        if let Some(ref reasoning) = chunk.reasoning_content {
            state.reasoning.push_str(reasoning);
            result.reasoning.push_str(reasoning);
        }

        if let Some(ref content) = chunk.content {
            state.raw.push_str(content);
            self.feed(content, state, &mut result);
        }

        if let Some(ref reason) = chunk.finish_reason {
            state.finish_reason = Some(FinishReason::parse(reason));
        }

        result
    }

    fn finalize(&self, mut state: StreamState) -> FinalizedResponse {
        if !state.streamed && !state.raw.is_empty() {
            // Whole payload arrived as one non-streamed response.
            let (content, tool_calls) = self.extract_full(&state.raw);
            state.content = content;
            state.tool_calls = tool_calls;
        } else if let Fsm::Prompt(fsm) = &mut state.fsm {
            // A retained tail that never resolved into a tag is literal.
            if !fsm.pending.is_empty() && !fsm.collecting {
                state.content.push_str(&fsm.pending);
            }
            if fsm.collecting {
                warn!("stream ended inside an unterminated tool_call block");
                if let Some(index) = fsm.call_index {
                    state.tool_calls.remove(index);
                }
            }
        }

        let finish_reason = state.finish_reason.unwrap_or(if state.tool_calls.is_empty() {
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
            tool_calls: state.tool_calls,
            finish_reason,
        }
    }

    fn assistant_history_message(&self, response: &FinalizedResponse) -> ChatMessage {
        // Tool calls are already embedded in the textual content.
        ChatMessage::assistant(response.content.clone())
    }

    fn tool_result_history_messages(&self, results: &[ToolResultRecord]) -> Vec<ChatMessage> {
        results
            .iter()
            .map(|r| {
                ChatMessage::user(format!(
                    "<tool_result name=\"{}\">\n{}\n</tool_result>",
                    r.tool_name, r.content
                ))
            })
            .collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
