//! The runtime a session owns.
//!
//! A session holds exactly one [`AgentRuntime`] at a time: the live
//! agent instance that turns user input into an event stream. The trait
//! keeps the session machinery independent of how the agent is built;
//! [`MockRuntime`] scripts one for tests.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use skein_protocol::{AgentEvent, FinishReason, now_millis};

use crate::error::{Result, SessionError};

/// A pinned stream of session events.
pub type EventStream = Pin<Box<dyn Stream<Item = AgentEvent> + Send>>;

/// The live agent instance behind a session.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Subscribe to every event the runtime emits, including streaming
    /// deltas.
    fn events(&self) -> broadcast::Receiver<AgentEvent>;

    /// Run one query to completion, returning the final assistant event.
    async fn run(&self, input: &str) -> Result<AgentEvent>;

    /// Run one query, yielding events as they are produced.
    async fn run_streaming(&self, input: &str) -> Result<EventStream>;

    /// Advisory cancel. Returns `true` only if a query was actually
    /// in flight.
    async fn abort(&self) -> bool;

    /// Re-seed the runtime's conversation context from a stored event
    /// log, without re-emitting the events.
    async fn replay(&self, events: &[AgentEvent]) -> Result<()>;

    /// Tear the instance down. Idempotent.
    async fn dispose(&self);
}

/// Something that can build a runtime for a session and model.
#[async_trait]
pub trait RuntimeFactory: Send + Sync {
    async fn build(&self, session_id: &str, model: &str) -> Result<Arc<dyn AgentRuntime>>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Mock runtime
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct MockRuntimeState {
    responses: VecDeque<String>,
    replayed: Vec<AgentEvent>,
    running: bool,
    disposed: bool,
    fail_next: bool,
    delay: Option<Duration>,
}

/// Scripted runtime: echoes input (or queued responses), records what
/// was replayed into it, and supports delays for concurrency tests.
pub struct MockRuntime {
    bus: broadcast::Sender<AgentEvent>,
    state: Mutex<MockRuntimeState>,
    model: String,
}

impl MockRuntime {
    pub fn new(model: impl Into<String>) -> Self {
        let (bus, _) = broadcast::channel(256);
        Self {
            bus,
            state: Mutex::new(MockRuntimeState::default()),
            model: model.into(),
        }
    }

    /// The model this runtime was built for.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Queue a canned response for the next query.
    pub fn push_response(&self, content: impl Into<String>) {
        self.state.lock().responses.push_back(content.into());
    }

    /// Make the next query fail.
    pub fn fail_next(&self) {
        self.state.lock().fail_next = true;
    }

    /// Delay query execution, for tests that race a second caller.
    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().delay = Some(delay);
    }

    /// Events replayed into this runtime.
    pub fn replayed(&self) -> Vec<AgentEvent> {
        self.state.lock().replayed.clone()
    }

    /// Whether `dispose` has been called.
    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    fn emit(&self, event: AgentEvent) {
        // No subscribers is fine.
        let _ = self.bus.send(event);
    }

    /// Produce the turn's events: the echoed user message, two content
    /// deltas, and the final assistant message.
    fn script_turn(&self, input: &str) -> Result<Vec<AgentEvent>> {
        let mut state = self.state.lock();
        if state.fail_next {
            state.fail_next = false;
            return Err(SessionError::runtime("mock_failure", "scripted failure"));
        }
        let content = state
            .responses
            .pop_front()
            .unwrap_or_else(|| format!("echo: {input}"));
        drop(state);

        let mut half = content.len() / 2;
        while !content.is_char_boundary(half) {
            half -= 1;
        }
        let (a, b) = content.split_at(half);
        Ok(vec![
            AgentEvent::user(input),
            AgentEvent::AssistantStreamingMessage {
                timestamp: now_millis(),
                content: a.to_string(),
            },
            AgentEvent::AssistantStreamingMessage {
                timestamp: now_millis(),
                content: b.to_string(),
            },
            AgentEvent::AssistantMessage {
                timestamp: now_millis(),
                content,
                reasoning_content: None,
                tool_calls: Vec::new(),
                finish_reason: Some(FinishReason::Stop),
            },
        ])
    }

    async fn pause(&self) {
        let delay = self.state.lock().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl AgentRuntime for MockRuntime {
    fn events(&self) -> broadcast::Receiver<AgentEvent> {
        self.bus.subscribe()
    }

    async fn run(&self, input: &str) -> Result<AgentEvent> {
        self.state.lock().running = true;
        self.pause().await;

        let result = self.script_turn(input);
        self.state.lock().running = false;
        let events = result?;

        for event in &events {
            self.emit(event.clone());
        }
        // Last event is the final assistant message.
        Ok(events
            .into_iter()
            .last()
            .unwrap_or_else(|| AgentEvent::error("empty turn", None)))
    }

    async fn run_streaming(&self, input: &str) -> Result<EventStream> {
        self.state.lock().running = true;
        self.pause().await;

        let result = self.script_turn(input);
        self.state.lock().running = false;
        let events = result?;

        for event in &events {
            self.emit(event.clone());
        }
        Ok(Box::pin(futures::stream::iter(events)))
    }

    async fn abort(&self) -> bool {
        let mut state = self.state.lock();
        std::mem::take(&mut state.running)
    }

    async fn replay(&self, events: &[AgentEvent]) -> Result<()> {
        self.state.lock().replayed.extend_from_slice(events);
        Ok(())
    }

    async fn dispose(&self) {
        self.state.lock().disposed = true;
    }
}

/// Factory producing [`MockRuntime`]s; keeps handles to everything it
/// built so tests can inspect them.
#[derive(Default)]
pub struct MockFactory {
    built: Mutex<Vec<Arc<MockRuntime>>>,
    fail_next: Mutex<bool>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `build` fail.
    pub fn fail_next(&self) {
        *self.fail_next.lock() = true;
    }

    /// The most recently built runtime.
    pub fn last(&self) -> Option<Arc<MockRuntime>> {
        self.built.lock().last().cloned()
    }

    /// How many runtimes have been built.
    pub fn built_count(&self) -> usize {
        self.built.lock().len()
    }
}

#[async_trait]
impl RuntimeFactory for MockFactory {
    async fn build(&self, _session_id: &str, model: &str) -> Result<Arc<dyn AgentRuntime>> {
        if std::mem::take(&mut *self.fail_next.lock()) {
            return Err(SessionError::runtime("build_failure", "scripted failure"));
        }
        let runtime = Arc::new(MockRuntime::new(model));
        self.built.lock().push(runtime.clone());
        Ok(runtime)
    }
}
