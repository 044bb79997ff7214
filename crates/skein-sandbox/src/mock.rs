//! Scripted provider for tests.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::api::{Liveness, ProvisionedSandbox, SandboxApi};
use crate::error::{SandboxError, SandboxResult};

#[derive(Debug, Default)]
struct MockState {
    created: u64,
    deleted: Vec<String>,
    liveness: HashMap<String, Liveness>,
    fail_create: bool,
}

/// In-memory provider: every `create` mints a new instance, liveness is
/// scriptable per URL, deletions are recorded.
#[derive(Debug, Default)]
pub struct MockSandboxApi {
    state: Mutex<MockState>,
}

impl MockSandboxApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `create` calls fail.
    pub fn fail_create(&self) {
        self.state.lock().fail_create = true;
    }

    /// Script the probe answer for a URL.
    pub fn set_liveness(&self, url: impl Into<String>, liveness: Liveness) {
        self.state.lock().liveness.insert(url.into(), liveness);
    }

    /// How many instances have been created.
    pub fn created_count(&self) -> u64 {
        self.state.lock().created
    }

    /// Ids passed to `delete`, in call order.
    pub fn deleted_ids(&self) -> Vec<String> {
        self.state.lock().deleted.clone()
    }
}

#[async_trait]
impl SandboxApi for MockSandboxApi {
    async fn create(&self, _ttl: Duration) -> SandboxResult<ProvisionedSandbox> {
        let mut state = self.state.lock();
        if state.fail_create {
            return Err(SandboxError::Provisioning("scripted failure".to_string()));
        }
        state.created += 1;
        let n = state.created;
        let url = format!("http://sandbox-{n}.test");
        state.liveness.insert(url.clone(), Liveness::Alive);
        Ok(ProvisionedSandbox {
            sandbox_id: format!("sb-{n}"),
            sandbox_url: url,
        })
    }

    async fn probe(&self, url: &str) -> Liveness {
        self.state
            .lock()
            .liveness
            .get(url)
            .copied()
            .unwrap_or(Liveness::NotFound)
    }

    async fn delete(&self, sandbox_id: &str) -> SandboxResult<()> {
        self.state.lock().deleted.push(sandbox_id.to_string());
        Ok(())
    }
}
