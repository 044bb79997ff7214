//! Session lifecycle, pooling, and execution gating.
//!
//! This crate owns the server's view of a conversation: a [`Session`]
//! wraps one live [`AgentRuntime`], bridges its events to persistence
//! and telemetry, and enforces one-query-at-a-time execution. The
//! [`SessionPool`] keeps sessions warm under an LRU with memory-pressure
//! eviction, and the [`ExclusiveGate`] serializes execution across
//! sessions for single-backend deployments.

pub mod error;
pub mod gate;
pub mod pool;
pub mod runtime;
pub mod session;
pub mod telemetry;

pub use error::{Result, SessionError};
pub use gate::ExclusiveGate;
pub use pool::{PoolConfig, SessionPool};
pub use runtime::{AgentRuntime, EventStream, MockFactory, MockRuntime, RuntimeFactory};
pub use session::{Session, SessionConfig, SessionDeps, SessionState};
pub use telemetry::{NoopTelemetry, TelemetrySink};
