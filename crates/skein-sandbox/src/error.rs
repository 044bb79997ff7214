//! Error types for the sandbox crate.

use thiserror::Error;

/// Errors that can occur while provisioning or scheduling sandboxes.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The provider refused or failed to create an instance.
    #[error("Provisioning failed: {0}")]
    Provisioning(String),

    /// Transport-level failure talking to the provider.
    #[error("Provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The provider returned a payload we could not understand.
    #[error("Malformed provider response: {0}")]
    MalformedResponse(String),

    /// Allocation bookkeeping failed.
    #[error("Storage error: {0}")]
    Storage(#[from] skein_store::StoreError),
}

/// Result type alias for sandbox operations.
pub type SandboxResult<T> = std::result::Result<T, SandboxError>;
