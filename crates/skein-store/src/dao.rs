//! Backend-agnostic persistence contracts.
//!
//! Each trait covers one aggregate. Backends must preserve the ordering
//! and uniqueness guarantees documented per method; callers never depend
//! on anything backend-specific.

use async_trait::async_trait;

use skein_protocol::AgentEvent;

use crate::error::Result;
use crate::records::{AllocationStrategy, SandboxAllocationRecord, SessionRecord, UserConfigRecord};

/// Session rows.
#[async_trait]
pub trait SessionDao: Send + Sync {
    /// Insert a new session. A duplicate id is a [`Conflict`], never a
    /// silent overwrite.
    ///
    /// [`Conflict`]: crate::StoreError::Conflict
    async fn create(&self, record: &SessionRecord) -> Result<()>;

    /// Fetch a session by id.
    async fn get(&self, id: &str) -> Result<Option<SessionRecord>>;

    /// Replace the metadata object and bump `updated_at`.
    async fn update_metadata(&self, id: &str, metadata: &serde_json::Value) -> Result<()>;

    /// Bump `updated_at` only.
    async fn touch(&self, id: &str) -> Result<()>;

    /// All sessions owned by a user, most recently updated first.
    async fn list_for_user(&self, user_id: &str) -> Result<Vec<SessionRecord>>;

    /// Remove the session and all of its events.
    async fn delete(&self, id: &str) -> Result<()>;
}

/// Append-only event log, one stream per session.
#[async_trait]
pub trait EventDao: Send + Sync {
    /// Append an event. Emission order is preserved: events carry a
    /// millisecond timestamp, and backends keep a monotonic
    /// insertion-order tiebreaker for events in the same millisecond.
    async fn append(&self, session_id: &str, event: &AgentEvent) -> Result<()>;

    /// All events of a session, in emission order.
    async fn list(&self, session_id: &str) -> Result<Vec<AgentEvent>>;

    /// Drop the whole stream for a session.
    async fn delete_for_session(&self, session_id: &str) -> Result<()>;
}

/// Sandbox allocation rows.
#[async_trait]
pub trait SandboxAllocationDao: Send + Sync {
    /// Insert an allocation. A duplicate sandbox id is a [`Conflict`].
    ///
    /// [`Conflict`]: crate::StoreError::Conflict
    async fn insert(&self, record: &SandboxAllocationRecord) -> Result<()>;

    /// The active allocation bound to a session, if any.
    async fn find_active_for_session(
        &self,
        session_id: &str,
    ) -> Result<Option<SandboxAllocationRecord>>;

    /// The active allocation bound to a user, if any.
    async fn find_active_for_user(&self, user_id: &str)
        -> Result<Option<SandboxAllocationRecord>>;

    /// Active shared-pool allocations usable by this user: allocations
    /// with the shared strategy that are not bound to a different user.
    async fn find_active_shared(&self, user_id: &str) -> Result<Vec<SandboxAllocationRecord>>;

    /// Bump `last_used_at`.
    async fn touch_last_used(&self, sandbox_id: &str) -> Result<()>;

    /// Mark the allocation inactive, keeping the row for reconciliation.
    async fn deactivate(&self, sandbox_id: &str) -> Result<()>;

    /// All inactive allocations, oldest first.
    async fn list_inactive(&self) -> Result<Vec<SandboxAllocationRecord>>;

    /// Remove the row entirely.
    async fn remove(&self, sandbox_id: &str) -> Result<()>;
}

/// Per-user configuration rows.
#[async_trait]
pub trait UserConfigDao: Send + Sync {
    /// Fetch a user's configuration, if stored.
    async fn get_config(&self, user_id: &str) -> Result<Option<UserConfigRecord>>;

    /// Insert or replace a user's configuration.
    async fn put_config(&self, record: &UserConfigRecord) -> Result<()>;

    /// The user's allocation strategy, falling back to the default when
    /// no configuration is stored.
    async fn allocation_strategy(&self, user_id: &str) -> Result<AllocationStrategy> {
        Ok(self
            .get_config(user_id)
            .await?
            .map(|c| c.strategy)
            .unwrap_or_default())
    }
}
