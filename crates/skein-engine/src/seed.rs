//! Engine for the `<seed:tool_call>` dialect.
//!
//! A response interleaves three layers:
//!
//! ```text
//! <seed:think>internal deliberation</seed:think>
//! visible answer text
//! <seed:tool_call>
//! <function=search>
//! <parameter=q>rust streaming</parameter>
//! </function>
//! </seed:tool_call>
//! ```
//!
//! The think-tag name is a runtime value (models are trained with
//! different markers), while the tool-call tags are fixed. One block may
//! hold several `<function=...>` invocations. Parameter bodies are raw
//! text, not JSON, so each character is escaped into a JSON string value
//! as the running arguments text is built: the deltas for a call stream
//! as `{"name":"` + escaped characters + `"` fragments, `,` between
//! parameters, and a closing `}` with the completion update. A function
//! with no parameters yields `{}`.

use tracing::warn;

use skein_protocol::{
    ChatMessage, ChatRequest, FinishReason, StreamChunk, StreamingToolCallUpdate, ToolCallRecord,
    ToolDefinition, ToolResultRecord,
};

use crate::catalog::format_tool_catalog;
use crate::scanner::{ArgTagMatch, TagMatch, match_arg_tag, match_tag};
use crate::state::{ChunkResult, FinalizedResponse, Fsm, StreamState};
use crate::ToolCallEngine;

const BLOCK_OPEN: &str = "<seed:tool_call>";
const BLOCK_CLOSE: &str = "</seed:tool_call>";
const FUNCTION_PREFIX: &str = "<function=";
const FUNCTION_CLOSE: &str = "</function>";
const PARAMETER_PREFIX: &str = "<parameter=";
const PARAMETER_CLOSE: &str = "</parameter>";

/// Think-tag name used when a model does not configure its own.
pub const DEFAULT_THINK_TAG: &str = "seed:think";

/// Engine for models trained on the seed function-call syntax.
#[derive(Debug)]
pub struct SeedEngine {
    think_open: String,
    think_close: String,
    think_tag: String,
}

impl SeedEngine {
    /// Create a seed engine with the given think-tag name.
    pub fn new(think_tag: impl Into<String>) -> Self {
        let think_tag = think_tag.into();
        Self {
            think_open: format!("<{think_tag}>"),
            think_close: format!("</{think_tag}>"),
            think_tag,
        }
    }

    /// The configured think-tag name.
    pub fn think_tag(&self) -> &str {
        &self.think_tag
    }
}

impl Default for SeedEngine {
    fn default() -> Self {
        Self::new(DEFAULT_THINK_TAG)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Machine State
// ─────────────────────────────────────────────────────────────────────────────

/// Where the machine is between tags.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Outside all tags: text is chat content.
    #[default]
    Content,
    /// Inside the think tags: text is reasoning.
    Think,
    /// Inside the tool-call block, between functions.
    Block,
    /// Inside a function, between parameters.
    Function,
    /// Inside a parameter value.
    Parameter,
}

/// The function invocation currently being assembled.
#[derive(Debug)]
struct OpenCall {
    /// Index of its record in `state.tool_calls`.
    index: usize,
    /// Parameters seen so far; decides `{` vs `,` prefixes and `{}`.
    params: usize,
}

#[derive(Debug, Default)]
pub(crate) struct SeedFsm {
    /// Retained tail that may still become a tag.
    pending: String,
    mode: Mode,
    open: Option<OpenCall>,
}

/// Escape one character of raw parameter text into a JSON string body.
fn escape_into(out: &mut String, c: char) {
    match c {
        '\\' => out.push_str("\\\\"),
        '"' => out.push_str("\\\""),
        '\n' => out.push_str("\\n"),
        '\r' => out.push_str("\\r"),
        '\t' => out.push_str("\\t"),
        other => out.push(other),
    }
}

fn escape_str(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        escape_into(&mut out, c);
    }
    out
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

impl SeedEngine {
    /// Drive the machine over newly arrived content text.
    fn feed(&self, text: &str, state: &mut StreamState, result: &mut ChunkResult) {
        let Fsm::Seed(fsm) = &mut state.fsm else {
            warn!("seed engine applied to foreign stream state");
            return;
        };

        let mut buf = std::mem::take(&mut fsm.pending);
        buf.push_str(text);

        // Arguments text produced during this feed, one delta per chunk
        // (flushed early when a function completes).
        let mut forwarded = String::new();

        let mut pos = 0;
        while pos < buf.len() {
            let rest = &buf[pos..];
            let mut partial = false;

            match fsm.mode {
                Mode::Content => {
                    match match_tag(rest, &self.think_open) {
                        TagMatch::Full => {
                            fsm.mode = Mode::Think;
                            pos += self.think_open.len();
                            continue;
                        }
                        TagMatch::Partial => partial = true,
                        TagMatch::No => {}
                    }
                    match match_tag(rest, BLOCK_OPEN) {
                        TagMatch::Full => {
                            fsm.mode = Mode::Block;
                            pos += BLOCK_OPEN.len();
                            continue;
                        }
                        TagMatch::Partial => partial = true,
                        TagMatch::No => {}
                    }
                }
                Mode::Think => match match_tag(rest, &self.think_close) {
                    TagMatch::Full => {
                        fsm.mode = Mode::Content;
                        pos += self.think_close.len();
                        continue;
                    }
                    TagMatch::Partial => partial = true,
                    TagMatch::No => {}
                },
                Mode::Block => {
                    match match_tag(rest, BLOCK_CLOSE) {
                        TagMatch::Full => {
                            fsm.mode = Mode::Content;
                            pos += BLOCK_CLOSE.len();
                            continue;
                        }
                        TagMatch::Partial => partial = true,
                        TagMatch::No => {}
                    }
                    match match_arg_tag(rest, FUNCTION_PREFIX) {
                        ArgTagMatch::Full { name, len } => {
                            let record = ToolCallRecord::new(name);
                            result
                                .tool_call_updates
                                .push(StreamingToolCallUpdate::start(&record.id, &record.name));
                            fsm.open = Some(OpenCall {
                                index: state.tool_calls.len(),
                                params: 0,
                            });
                            state.tool_calls.push(record);
                            fsm.mode = Mode::Function;
                            pos += len;
                            continue;
                        }
                        ArgTagMatch::Partial => partial = true,
                        ArgTagMatch::No => {}
                    }
                }
                Mode::Function => {
                    match match_tag(rest, FUNCTION_CLOSE) {
                        TagMatch::Full => {
                            if let Some(open) = fsm.open.take() {
                                let closing = if open.params == 0 { "{}" } else { "}" };
                                state.tool_calls[open.index].arguments.push_str(closing);
                                forwarded.push_str(closing);
                                let record = &state.tool_calls[open.index];
                                if !forwarded.is_empty() {
                                    result.tool_call_updates.push(
                                        StreamingToolCallUpdate::delta(
                                            &record.id,
                                            &record.name,
                                            std::mem::take(&mut forwarded),
                                        ),
                                    );
                                }
                                result.tool_call_updates.push(
                                    StreamingToolCallUpdate::complete(&record.id, &record.name),
                                );
                            }
                            fsm.mode = Mode::Block;
                            pos += FUNCTION_CLOSE.len();
                            continue;
                        }
                        TagMatch::Partial => partial = true,
                        TagMatch::No => {}
                    }
                    match match_arg_tag(rest, PARAMETER_PREFIX) {
                        ArgTagMatch::Full { name, len } => {
                            if let Some(open) = fsm.open.as_mut() {
                                let prefix = if open.params == 0 {
                                    format!("{{\"{}\":\"", escape_str(&name))
                                } else {
                                    format!(",\"{}\":\"", escape_str(&name))
                                };
                                open.params += 1;
                                state.tool_calls[open.index].arguments.push_str(&prefix);
                                forwarded.push_str(&prefix);
                            }
                            fsm.mode = Mode::Parameter;
                            pos += len;
                            continue;
                        }
                        ArgTagMatch::Partial => partial = true,
                        ArgTagMatch::No => {}
                    }
                }
                Mode::Parameter => match match_tag(rest, PARAMETER_CLOSE) {
                    TagMatch::Full => {
                        if let Some(open) = fsm.open.as_ref() {
                            state.tool_calls[open.index].arguments.push('"');
                            forwarded.push('"');
                        }
                        fsm.mode = Mode::Function;
                        pos += PARAMETER_CLOSE.len();
                        continue;
                    }
                    TagMatch::Partial => partial = true,
                    TagMatch::No => {}
                },
            }

            if partial {
                fsm.pending = rest.to_string();
                break;
            }

            let c = rest.chars().next().unwrap_or('\u{fffd}');
            pos += c.len_utf8();

            match fsm.mode {
                Mode::Content => {
                    state.content.push(c);
                    result.content.push(c);
                }
                Mode::Think => {
                    state.reasoning.push(c);
                    result.reasoning.push(c);
                }
                Mode::Parameter => {
                    if let Some(open) = fsm.open.as_ref() {
                        escape_into(&mut state.tool_calls[open.index].arguments, c);
                        escape_into(&mut forwarded, c);
                    }
                }
                // Whitespace and noise between tags inside the block.
                Mode::Block | Mode::Function => {}
            }
        }

        if !forwarded.is_empty() {
            if let Some(open) = fsm.open.as_ref() {
                let record = &state.tool_calls[open.index];
                result.tool_call_updates.push(StreamingToolCallUpdate::delta(
                    &record.id,
                    &record.name,
                    forwarded,
                ));
            }
        }
    }

    /// End-of-stream cleanup: resolve the retained tail as literal text
    /// and drop a function that never closed.
    fn drain(state: &mut StreamState) {
        let Fsm::Seed(fsm) = &mut state.fsm else {
            return;
        };

        match fsm.mode {
            Mode::Content => state.content.push_str(&fsm.pending),
            Mode::Think => state.reasoning.push_str(&fsm.pending),
            Mode::Block | Mode::Function | Mode::Parameter => {
                warn!("stream ended inside an unterminated tool-call block");
            }
        }
        fsm.pending.clear();

        if let Some(open) = fsm.open.take() {
            let record = &state.tool_calls[open.index];
            warn!(id = %record.id, name = %record.name, "dropping unterminated function call");
            state.tool_calls.remove(open.index);
        }
    }
}

impl ToolCallEngine for SeedEngine {
    fn prepare_prompt(&self, instructions: &str, tools: &[ToolDefinition]) -> String {
        if tools.is_empty() {
            return instructions.to_string();
        }
        format!(
            "{instructions}\n\n{}\n\
             When you need to call tools, emit one {BLOCK_OPEN} block:\n\
             {BLOCK_OPEN}\n\
             <function=tool-name>\n\
             <parameter=param-name>value</parameter>\n\
             </function>\n\
             {BLOCK_CLOSE}\n\
             A block may contain several <function=...> invocations. Parameter \
             values are raw text. Put your reasoning inside <{}> tags.",
            format_tool_catalog(tools),
            self.think_tag,
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
        StreamState::new(Fsm::Seed(SeedFsm::default()))
    }

    fn process_chunk(&self, chunk: &StreamChunk, state: &mut StreamState) -> ChunkResult {
        state.streamed = true;
        let mut result = ChunkResult::default();

        // Providers that segregate reasoning out-of-band bypass the tags.
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
            let mut fresh = self.new_state();
            let mut sink = ChunkResult::default();
            let raw = std::mem::take(&mut state.raw);
            self.feed(&raw, &mut fresh, &mut sink);
            Self::drain(&mut fresh);
            state.content = fresh.content;
            state.reasoning.push_str(&fresh.reasoning);
            state.tool_calls = fresh.tool_calls;
        } else {
            Self::drain(&mut state);
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
                    "<seed:tool_result name=\"{}\">\n{}\n</seed:tool_result>",
                    r.tool_name, r.content
                ))
            })
            .collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn run_chunks(engine: &SeedEngine, chunks: &[&str]) -> (Vec<ChunkResult>, FinalizedResponse) {
        let mut state = engine.new_state();
        let results: Vec<ChunkResult> = chunks
            .iter()
            .map(|c| engine.process_chunk(&StreamChunk::content(*c), &mut state))
            .collect();
        let response = engine.finalize(state);
        (results, response)
    }

    fn assembled_arguments(results: &[ChunkResult], id: &str) -> String {
        results
            .iter()
            .flat_map(|r| r.tool_call_updates.iter())
            .filter(|u| u.tool_call_id == id)
            .map(|u| u.arguments_delta.as_str())
            .collect()
    }

    #[test]
    fn test_full_layering_extracted() {
        let engine = SeedEngine::default();
        let input = "<seed:think>need a lookup</seed:think>Let me search.\n<seed:tool_call>\n<function=search>\n<parameter=q>rust streaming</parameter>\n</function>\n</seed:tool_call>";
        let (results, response) = run_chunks(&engine, &[input]);

        assert_eq!(response.reasoning.as_deref(), Some("need a lookup"));
        assert_eq!(response.content, "Let me search.\n");
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].name, "search");
        assert_eq!(
            response.tool_calls[0].parsed_arguments().unwrap(),
            serde_json::json!({"q": "rust streaming"})
        );
        assert_eq!(response.finish_reason, FinishReason::ToolCalls);

        let id = &response.tool_calls[0].id;
        assert_eq!(assembled_arguments(&results, id), response.tool_calls[0].arguments);
    }

    #[test]
    fn test_chunk_boundary_invariance() {
        let engine = SeedEngine::default();
        let input = "<seed:think>想一下</seed:think>好的<seed:tool_call><function=echo><parameter=text>你好</parameter></function></seed:tool_call>";

        let (_, whole) = run_chunks(&engine, &[input]);
        assert_eq!(whole.tool_calls.len(), 1);

        for split in input
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(input.len()))
        {
            let (a, b) = input.split_at(split);
            let (_, piecewise) = run_chunks(&engine, &[a, b]);
            assert_eq!(piecewise.content, whole.content, "split at {split}");
            assert_eq!(piecewise.reasoning, whole.reasoning, "split at {split}");
            assert_eq!(piecewise.tool_calls.len(), 1, "split at {split}");
            assert_eq!(
                piecewise.tool_calls[0].arguments, whole.tool_calls[0].arguments,
                "split at {split}"
            );
        }
    }

    #[test]
    fn test_parameter_text_escaped() {
        let engine = SeedEngine::default();
        let input = "<seed:tool_call><function=write><parameter=body>line1\nline\t\"two\" \\ end</parameter></function></seed:tool_call>";
        let (_, response) = run_chunks(&engine, &[input]);

        assert_eq!(response.tool_calls.len(), 1);
        let parsed = response.tool_calls[0].parsed_arguments().unwrap();
        assert_eq!(parsed["body"], "line1\nline\t\"two\" \\ end");
    }

    #[test]
    fn test_zero_parameter_function() {
        let engine = SeedEngine::default();
        let input = "<seed:tool_call><function=list_files></function></seed:tool_call>";
        let (results, response) = run_chunks(&engine, &[input]);

        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].arguments, "{}");
        let id = &response.tool_calls[0].id;
        assert_eq!(assembled_arguments(&results, id), "{}");
    }

    #[test]
    fn test_multiple_functions_in_one_block() {
        let engine = SeedEngine::default();
        let input = "<seed:tool_call>\n<function=a>\n<parameter=x>1</parameter>\n</function>\n<function=b>\n<parameter=y>2</parameter>\n<parameter=z>3</parameter>\n</function>\n</seed:tool_call>";
        let (_, response) = run_chunks(&engine, &[input]);

        assert_eq!(response.tool_calls.len(), 2);
        assert_eq!(response.tool_calls[0].name, "a");
        assert_eq!(
            response.tool_calls[0].parsed_arguments().unwrap(),
            serde_json::json!({"x": "1"})
        );
        assert_eq!(response.tool_calls[1].name, "b");
        assert_eq!(
            response.tool_calls[1].parsed_arguments().unwrap(),
            serde_json::json!({"y": "2", "z": "3"})
        );
    }

    #[test]
    fn test_custom_think_tag() {
        let engine = SeedEngine::new("reflection");
        let (_, response) = run_chunks(
            &engine,
            &["<reflection>hidden</reflection>shown"],
        );
        assert_eq!(response.reasoning.as_deref(), Some("hidden"));
        assert_eq!(response.content, "shown");
    }

    #[test]
    fn test_streaming_updates_in_order() {
        let engine = SeedEngine::default();
        let (results, response) = run_chunks(
            &engine,
            &[
                "<seed:tool_call><function=se",
                "arch><parameter=q>spa",
                "ce</parameter></function></seed:tool_call>",
            ],
        );

        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].name, "search");

        let updates: Vec<_> = results
            .iter()
            .flat_map(|r| r.tool_call_updates.iter())
            .collect();
        assert!(updates[0].arguments_delta.is_empty() && !updates[0].is_complete);
        assert!(updates.last().unwrap().is_complete);
        let deltas = updates
            .iter()
            .filter(|u| !u.is_complete && !u.arguments_delta.is_empty())
            .count();
        assert!(deltas >= 2, "expected >= 2 deltas, got {updates:?}");
    }

    #[test]
    fn test_partial_tag_suffix_is_literal_at_finalize() {
        let engine = SeedEngine::default();
        let (_, response) = run_chunks(&engine, &["text then <seed:t"]);
        assert_eq!(response.content, "text then <seed:t");
        assert!(response.tool_calls.is_empty());
    }

    #[test]
    fn test_plain_text_untouched() {
        let engine = SeedEngine::default();
        let (_, response) = run_chunks(&engine, &["2 < 3 and a<b, plainly"]);
        assert_eq!(response.content, "2 < 3 and a<b, plainly");
        assert!(response.reasoning.is_none());
        assert_eq!(response.finish_reason, FinishReason::Stop);
    }

    #[test]
    fn test_unterminated_function_dropped() {
        let engine = SeedEngine::default();
        let (_, response) = run_chunks(
            &engine,
            &["hi <seed:tool_call><function=search><parameter=q>oops"],
        );
        assert_eq!(response.content, "hi ");
        assert!(response.tool_calls.is_empty());
    }

    #[test]
    fn test_non_streamed_extraction() {
        let engine = SeedEngine::default();
        let mut state = engine.new_state();
        state.ingest_full(
            "<seed:think>plan</seed:think>ok<seed:tool_call><function=go><parameter=dir>north</parameter></function></seed:tool_call>",
            None,
        );
        let response = engine.finalize(state);

        assert_eq!(response.reasoning.as_deref(), Some("plan"));
        assert_eq!(response.content, "ok");
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(
            response.tool_calls[0].parsed_arguments().unwrap(),
            serde_json::json!({"dir": "north"})
        );
    }

    #[test]
    fn test_out_of_band_reasoning_passthrough() {
        let engine = SeedEngine::default();
        let mut state = engine.new_state();
        let r = engine.process_chunk(&StreamChunk::reasoning("deliberating"), &mut state);
        assert_eq!(r.reasoning, "deliberating");
        let response = engine.finalize(state);
        assert_eq!(response.reasoning.as_deref(), Some("deliberating"));
    }

    #[test]
    fn test_prompt_and_request_shape() {
        let engine = SeedEngine::default();
        let tools = vec![ToolDefinition::new("search", "Find things", serde_json::json!({}))];

        let prompt = engine.prepare_prompt("Be brief.", &tools);
        assert!(prompt.starts_with("Be brief."));
        assert!(prompt.contains("### search"));
        assert!(prompt.contains(BLOCK_OPEN));
        assert!(prompt.contains("<seed:think>"));

        let request = engine.prepare_request("m", vec![], &tools);
        assert!(request.tools.is_none());
    }

    #[test]
    fn test_tool_result_history_shape() {
        let engine = SeedEngine::default();
        let messages = engine.tool_result_history_messages(&[ToolResultRecord::error(
            "c1", "search", "timed out",
        )]);
        assert_eq!(messages.len(), 1);
        let content = messages[0].content.as_ref().unwrap();
        assert!(content.contains("<seed:tool_result name=\"search\">"));
        assert!(content.contains("timed out"));
    }
}
