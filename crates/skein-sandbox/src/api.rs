//! The sandbox provider API.
//!
//! The provider is an external service that creates, inspects, and
//! destroys sandbox instances. The trait keeps the scheduler testable;
//! [`HttpSandboxApi`] is the production implementation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{SandboxError, SandboxResult};

/// Default timeout for provider requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Timeout for liveness probes; a probe should answer fast or not at all.
const PROBE_TIMEOUT_SECS: u64 = 5;

/// A freshly created sandbox instance.
#[derive(Debug, Clone, Deserialize)]
pub struct ProvisionedSandbox {
    /// Provider-assigned instance id.
    pub sandbox_id: String,
    /// Base URL at which the instance serves.
    pub sandbox_url: String,
}

/// Outcome of probing an instance URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// The instance answered.
    Alive,
    /// The provider answered that the instance no longer exists.
    NotFound,
    /// No conclusive answer (timeout, refused connection, 5xx).
    Unreachable,
}

impl Liveness {
    /// Whether the probed URL is safe to hand out.
    pub fn is_alive(&self) -> bool {
        matches!(self, Liveness::Alive)
    }
}

/// Operations against the sandbox provider.
#[async_trait]
pub trait SandboxApi: Send + Sync {
    /// Create an instance that the provider will reap after `ttl`.
    async fn create(&self, ttl: Duration) -> SandboxResult<ProvisionedSandbox>;

    /// Check whether the instance behind `url` is still serving.
    /// Transport failures are an answer ([`Liveness::Unreachable`]),
    /// never an error.
    async fn probe(&self, url: &str) -> Liveness;

    /// Destroy an instance. An instance that is already gone counts as
    /// success; the goal is the absence, not the deletion.
    async fn delete(&self, sandbox_id: &str) -> SandboxResult<()>;
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP implementation
// ─────────────────────────────────────────────────────────────────────────────

/// Provider client speaking the HTTP provisioning API.
#[derive(Debug, Clone)]
pub struct HttpSandboxApi {
    client: Client,
    base_url: String,
}

impl HttpSandboxApi {
    /// Create a client against the provider's base URL.
    pub fn new(base_url: impl Into<String>) -> SandboxResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl SandboxApi for HttpSandboxApi {
    async fn create(&self, ttl: Duration) -> SandboxResult<ProvisionedSandbox> {
        let response = self
            .client
            .post(format!("{}/sandboxes", self.base_url))
            .json(&serde_json::json!({ "ttl_seconds": ttl.as_secs() }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SandboxError::Provisioning(format!(
                "provider returned {status}: {body}"
            )));
        }

        let sandbox: ProvisionedSandbox = response
            .json()
            .await
            .map_err(|e| SandboxError::MalformedResponse(e.to_string()))?;

        debug!(sandbox_id = %sandbox.sandbox_id, url = %sandbox.sandbox_url, "sandbox created");
        Ok(sandbox)
    }

    async fn probe(&self, url: &str) -> Liveness {
        let health = format!("{}/health", url.trim_end_matches('/'));
        let request = self
            .client
            .get(&health)
            .timeout(Duration::from_secs(PROBE_TIMEOUT_SECS));

        match request.send().await {
            Ok(response) if response.status().is_success() => Liveness::Alive,
            Ok(response) if response.status() == StatusCode::NOT_FOUND => Liveness::NotFound,
            Ok(response) => {
                debug!(url = %url, status = %response.status(), "probe inconclusive");
                Liveness::Unreachable
            }
            Err(e) => {
                debug!(url = %url, error = %e, "probe failed");
                Liveness::Unreachable
            }
        }
    }

    async fn delete(&self, sandbox_id: &str) -> SandboxResult<()> {
        let response = self
            .client
            .delete(format!("{}/sandboxes/{}", self.base_url, sandbox_id))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            debug!(sandbox_id = %sandbox_id, "sandbox deleted");
            return Ok(());
        }

        warn!(sandbox_id = %sandbox_id, status = %status, "sandbox deletion refused");
        Err(SandboxError::Provisioning(format!(
            "deletion of {sandbox_id} returned {status}"
        )))
    }
}
