//! Telemetry hand-off.
//!
//! Every event a session's runtime emits is offered to the sink,
//! persisted or not. The default sink drops everything; servers plug in
//! their own exporter.

use skein_protocol::AgentEvent;

/// Receives every session event, plus a flush signal on cleanup.
pub trait TelemetrySink: Send + Sync {
    /// Offer one event. Must not block the event bridge.
    fn record(&self, _session_id: &str, _event: &AgentEvent) {}

    /// Flush buffered telemetry; called when a session is cleaned up.
    fn flush(&self) {}
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {}
