//! Session lifecycle.
//!
//! A session is the unit of multi-tenant isolation: one conversation,
//! one workspace, one runtime instance at a time. Its life is a strict
//! progression `Created → Initializing → Ready ⇄ Executing → Disposed`;
//! every public operation checks the state it needs and rejects rather
//! than queues.
//!
//! Runtime events flow through one bridge task per session: telemetry
//! and the live subscriber bus see every event, persistence sees the
//! subset `should_persist` admits. Persistence failures are logged and
//! never abort the turn that produced the event.

use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use skein_protocol::AgentEvent;
use skein_store::{EventDao, SessionDao};

use crate::error::{Result, SessionError};
use crate::gate::ExclusiveGate;
use crate::runtime::{AgentRuntime, EventStream, RuntimeFactory};
use crate::telemetry::TelemetrySink;

/// Where a session is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Initializing,
    Ready,
    Executing,
    Disposed,
}

/// Model resolution and execution policy for a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Models the server currently offers.
    pub available_models: Vec<String>,
    /// Model used when no valid override is present.
    pub default_model: String,
    /// Per-session model override, e.g. restored from session metadata.
    pub model_override: Option<String>,
    /// Whether queries must hold the global exclusive slot.
    pub exclusive_execution: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            available_models: Vec::new(),
            default_model: String::new(),
            model_override: None,
            exclusive_execution: false,
        }
    }
}

/// Everything a session borrows from the server.
#[derive(Clone)]
pub struct SessionDeps {
    pub factory: Arc<dyn RuntimeFactory>,
    pub sessions: Arc<dyn SessionDao>,
    pub events: Arc<dyn EventDao>,
    pub telemetry: Arc<dyn TelemetrySink>,
    pub gate: Arc<ExclusiveGate>,
}

/// One live session.
pub struct Session {
    id: String,
    user_id: Option<String>,
    config: SessionConfig,
    deps: SessionDeps,

    state: Arc<Mutex<SessionState>>,
    /// Resolved model of the current runtime.
    model: Mutex<Option<String>>,
    runtime: RwLock<Option<Arc<dyn AgentRuntime>>>,
    bridge: Mutex<Option<JoinHandle<()>>>,
    /// Live event bus for server-side subscribers.
    bus: broadcast::Sender<AgentEvent>,
}

/// Holds the Executing state and the exclusive slot for one query;
/// dropping it restores both, so every exit path releases.
struct ExecutionSlot {
    session_id: String,
    state: Arc<Mutex<SessionState>>,
    gate: Arc<ExclusiveGate>,
    exclusive: bool,
}

impl Drop for ExecutionSlot {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if *state == SessionState::Executing {
            *state = SessionState::Ready;
        }
        drop(state);
        if self.exclusive {
            self.gate.release(&self.session_id);
        }
    }
}

/// Pick the model a runtime is built with: a still-offered override
/// wins; a stale one logs and falls back, never errors.
fn resolve_model(requested: Option<&str>, available: &[String], default: &str) -> String {
    match requested {
        Some(model) if available.iter().any(|m| m == model) => model.to_string(),
        Some(model) => {
            warn!(model = %model, "requested model not available, using default");
            default.to_string()
        }
        None => default.to_string(),
    }
}

impl Session {
    pub fn new(id: impl Into<String>, user_id: Option<String>, config: SessionConfig, deps: SessionDeps) -> Self {
        let (bus, _) = broadcast::channel(256);
        Self {
            id: id.into(),
            user_id,
            config,
            deps,
            state: Arc::new(Mutex::new(SessionState::Created)),
            model: Mutex::new(None),
            runtime: RwLock::new(None),
            bridge: Mutex::new(None),
            bus,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// The model the current runtime was built with.
    pub fn model(&self) -> Option<String> {
        self.model.lock().clone()
    }

    /// Synchronous status read.
    pub fn processing_status(&self) -> SessionState {
        *self.state.lock()
    }

    /// Subscribe to the session's live event feed.
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.bus.subscribe()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Build the runtime, replay persisted history into it, and wire the
    /// event bridge. Valid only once, from `Created`.
    pub async fn initialize(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != SessionState::Created {
                return Err(SessionError::runtime(
                    "invalid_state",
                    format!("cannot initialize session in state {:?}", *state),
                ));
            }
            *state = SessionState::Initializing;
        }

        match self.build_runtime(self.config.model_override.as_deref()).await {
            Ok(()) => {
                *self.state.lock() = SessionState::Ready;
                info!(session_id = %self.id, "session initialized");
                Ok(())
            }
            Err(e) => {
                *self.state.lock() = SessionState::Created;
                Err(e)
            }
        }
    }

    /// Build (or rebuild) the runtime for `requested` and rewire the
    /// event bridge. The previous runtime, if any, is disposed.
    async fn build_runtime(&self, requested: Option<&str>) -> Result<()> {
        let model = resolve_model(
            requested,
            &self.config.available_models,
            &self.config.default_model,
        );

        let runtime = self.deps.factory.build(&self.id, &model).await?;

        // Re-seed with the stored history so the new instance resumes
        // with full context.
        let history = self.deps.events.list(&self.id).await?;
        runtime.replay(&history).await?;

        // Bridge: telemetry and the live bus see everything, the store
        // only what should_persist admits.
        let mut rx = runtime.events();
        let session_id = self.id.clone();
        let events = self.deps.events.clone();
        let telemetry = self.deps.telemetry.clone();
        let bus = self.bus.clone();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        telemetry.record(&session_id, &event);
                        let _ = bus.send(event.clone());
                        if event.should_persist() {
                            if let Err(e) = events.append(&session_id, &event).await {
                                warn!(session_id = %session_id, error = %e, "event persistence failed");
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(session_id = %session_id, skipped, "event bridge lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        // Swap in the new runtime, retiring the old bridge and instance.
        if let Some(old) = self.bridge.lock().replace(handle) {
            old.abort();
        }
        if let Some(old) = self.runtime.write().await.replace(runtime) {
            old.dispose().await;
        }
        *self.model.lock() = Some(model);
        Ok(())
    }

    /// Replace the runtime to apply a new model selection. Session
    /// identity and persisted history are preserved; the replacement is
    /// re-seeded from the event log.
    pub async fn update_model_config(&self, model: Option<&str>) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                SessionState::Ready => {}
                SessionState::Executing => {
                    return Err(SessionError::Busy(format!(
                        "session {} is executing",
                        self.id
                    )));
                }
                other => {
                    return Err(SessionError::runtime(
                        "invalid_state",
                        format!("cannot update model in state {other:?}"),
                    ));
                }
            }
            *state = SessionState::Initializing;
        }

        let result = self.build_runtime(model).await;
        *self.state.lock() = if result.is_ok() {
            SessionState::Ready
        } else {
            SessionState::Created
        };
        result?;

        // Record the selection; a metadata write failure must not undo
        // the live swap.
        if let Err(e) = self.persist_model_metadata().await {
            warn!(session_id = %self.id, error = %e, "model metadata update failed");
        }

        info!(session_id = %self.id, model = ?self.model(), "model config updated");
        Ok(())
    }

    async fn persist_model_metadata(&self) -> Result<()> {
        let Some(record) = self.deps.sessions.get(&self.id).await? else {
            return Ok(());
        };
        let mut metadata = record.metadata;
        if let Some(model) = self.model() {
            metadata["model"] = serde_json::Value::String(model);
        }
        self.deps.sessions.update_metadata(&self.id, &metadata).await?;
        Ok(())
    }

    /// Tear the session down: release the slot, stop the bridge, dispose
    /// the runtime, flush telemetry. Idempotent; failures are logged.
    pub async fn cleanup(&self) {
        self.deps.gate.release(&self.id);

        if let Some(bridge) = self.bridge.lock().take() {
            bridge.abort();
        }
        if let Some(runtime) = self.runtime.write().await.take() {
            runtime.dispose().await;
        }
        self.deps.telemetry.flush();

        *self.state.lock() = SessionState::Disposed;
        debug!(session_id = %self.id, "session cleaned up");
    }

    // ─────────────────────────────────────────────────────────────────────
    // Execution
    // ─────────────────────────────────────────────────────────────────────

    /// Admission check: move `Ready → Executing` and claim the exclusive
    /// slot when policy demands it. The returned slot restores both on
    /// drop.
    fn begin_execution(&self) -> Result<ExecutionSlot> {
        let mut state = self.state.lock();
        match *state {
            SessionState::Ready => {}
            SessionState::Executing => {
                return Err(SessionError::Busy(format!(
                    "session {} is already executing",
                    self.id
                )));
            }
            other => {
                return Err(SessionError::runtime(
                    "invalid_state",
                    format!("cannot execute in state {other:?}"),
                ));
            }
        }

        if self.config.exclusive_execution && !self.deps.gate.try_acquire(&self.id) {
            return Err(SessionError::Busy(format!(
                "execution slot held by session {:?}",
                self.deps.gate.holder()
            )));
        }

        *state = SessionState::Executing;
        Ok(ExecutionSlot {
            session_id: self.id.clone(),
            state: self.state.clone(),
            gate: self.deps.gate.clone(),
            exclusive: self.config.exclusive_execution,
        })
    }

    async fn current_runtime(&self) -> Result<Arc<dyn AgentRuntime>> {
        self.runtime
            .read()
            .await
            .clone()
            .ok_or_else(|| SessionError::runtime("no_runtime", "session has no runtime"))
    }

    /// Run one query to completion.
    pub async fn run_query(&self, input: &str) -> Result<AgentEvent> {
        let slot = self.begin_execution()?;
        let runtime = self.current_runtime().await?;

        let result = runtime.run(input).await;
        drop(slot);

        if let Err(e) = self.deps.sessions.touch(&self.id).await {
            warn!(session_id = %self.id, error = %e, "session touch failed");
        }
        result
    }

    /// Run one query, yielding events as they arrive. Errors inside the
    /// stream become a single terminal error event; the slot is released
    /// when the stream ends, errors, or is dropped early.
    pub async fn run_query_streaming(&self, input: &str) -> Result<EventStream> {
        let slot = self.begin_execution()?;
        let runtime = self.current_runtime().await?;
        let input = input.to_string();

        let stream = async_stream::stream! {
            let _slot = slot;
            match runtime.run_streaming(&input).await {
                Ok(mut events) => {
                    while let Some(event) = events.next().await {
                        yield event;
                    }
                }
                Err(e) => {
                    yield AgentEvent::error(
                        e.to_string(),
                        Some(serde_json::json!({ "source": "runtime" })),
                    );
                }
            }
        };
        Ok(Box::pin(stream))
    }

    /// Advisory cancel of the in-flight query. Returns whether anything
    /// was actually aborted; the exclusive slot is released only then.
    pub async fn abort_query(&self) -> bool {
        let Ok(runtime) = self.current_runtime().await else {
            return false;
        };

        let aborted = runtime.abort().await;
        if aborted {
            let mut state = self.state.lock();
            if *state == SessionState::Executing {
                *state = SessionState::Ready;
            }
            drop(state);
            self.deps.gate.release(&self.id);
            info!(session_id = %self.id, "query aborted");
        }
        aborted
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
