//! Error types for the session crate.

use thiserror::Error;

/// Errors that can occur in session lifecycle and execution.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No such session.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The session (or the global execution slot) is busy. Callers map
    /// this to a 409-style rejection; there is no queueing.
    #[error("Busy: {0}")]
    Busy(String),

    /// Sandbox provisioning or scheduling failed.
    #[error("Sandbox error: {0}")]
    Sandbox(#[from] skein_sandbox::SandboxError),

    /// Persistence failed.
    #[error("Storage error: {0}")]
    Storage(#[from] skein_store::StoreError),

    /// The underlying runtime reported a failure.
    #[error("Runtime error [{code}]: {message}")]
    Runtime {
        code: String,
        message: String,
        detail: Option<serde_json::Value>,
    },
}

impl SessionError {
    /// A runtime error with no structured detail.
    pub fn runtime(code: impl Into<String>, message: impl Into<String>) -> Self {
        SessionError::Runtime {
            code: code.into(),
            message: message.into(),
            detail: None,
        }
    }
}

/// Result type alias for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;
