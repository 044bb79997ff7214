//! Persisted record types shared by all store backends.

use serde::{Deserialize, Serialize};

use skein_protocol::now_millis;

/// How sandboxes are allocated for a user's sessions.
///
/// Serialized names are part of the stored/wire format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationStrategy {
    /// Sandboxes are drawn from a pool shared across users.
    #[serde(rename = "Shared-Pool")]
    SharedPool,
    /// One sandbox per user, shared by all of that user's sessions.
    #[serde(rename = "User-Exclusive")]
    UserExclusive,
    /// One sandbox per session.
    #[default]
    #[serde(rename = "Session-Exclusive")]
    SessionExclusive,
}

impl AllocationStrategy {
    /// The stored string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationStrategy::SharedPool => "Shared-Pool",
            AllocationStrategy::UserExclusive => "User-Exclusive",
            AllocationStrategy::SessionExclusive => "Session-Exclusive",
        }
    }

    /// Parse the stored string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Shared-Pool" => Some(AllocationStrategy::SharedPool),
            "User-Exclusive" => Some(AllocationStrategy::UserExclusive),
            "Session-Exclusive" => Some(AllocationStrategy::SessionExclusive),
            _ => None,
        }
    }
}

impl std::fmt::Display for AllocationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted session row.
///
/// `metadata` is an open JSON object; by convention it carries at least
/// the agent identity and model selection, plus the sandbox URL once one
/// has been allocated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub user_id: Option<String>,
    pub workspace: String,
    pub metadata: serde_json::Value,
    pub created_at: i64,
    pub updated_at: i64,
}

impl SessionRecord {
    /// Create a record with fresh timestamps and empty metadata.
    pub fn new(id: impl Into<String>, workspace: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: id.into(),
            user_id: None,
            workspace: workspace.into(),
            metadata: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        }
    }

    /// Attach an owning user.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Replace the metadata object.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A persisted sandbox allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxAllocationRecord {
    pub sandbox_id: String,
    pub sandbox_url: String,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub strategy: AllocationStrategy,
    pub created_at: i64,
    pub last_used_at: i64,
    pub is_active: bool,
}

impl SandboxAllocationRecord {
    /// Create an active allocation with fresh timestamps.
    pub fn new(
        sandbox_id: impl Into<String>,
        sandbox_url: impl Into<String>,
        strategy: AllocationStrategy,
    ) -> Self {
        let now = now_millis();
        Self {
            sandbox_id: sandbox_id.into(),
            sandbox_url: sandbox_url.into(),
            user_id: None,
            session_id: None,
            strategy,
            created_at: now,
            last_used_at: now,
            is_active: true,
        }
    }

    /// Bind the allocation to a user.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Bind the allocation to a session.
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// Per-user configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfigRecord {
    pub user_id: String,
    /// How this user's sessions obtain sandboxes.
    pub strategy: AllocationStrategy,
    /// Maximum concurrently active sandboxes for the user.
    pub sandbox_quota: u32,
    /// Free-form provider entries (endpoint, model list, credentials ref).
    pub model_providers: Vec<serde_json::Value>,
}

impl UserConfigRecord {
    /// Defaults for a user with no stored configuration.
    pub fn defaults(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            strategy: AllocationStrategy::default(),
            sandbox_quota: 3,
            model_providers: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_round_trip() {
        for strategy in [
            AllocationStrategy::SharedPool,
            AllocationStrategy::UserExclusive,
            AllocationStrategy::SessionExclusive,
        ] {
            assert_eq!(AllocationStrategy::parse(strategy.as_str()), Some(strategy));
        }
        assert_eq!(AllocationStrategy::parse("bogus"), None);
    }

    #[test]
    fn test_strategy_serde_names() {
        let json = serde_json::to_string(&AllocationStrategy::SharedPool).unwrap();
        assert_eq!(json, "\"Shared-Pool\"");
        let back: AllocationStrategy = serde_json::from_str("\"Session-Exclusive\"").unwrap();
        assert_eq!(back, AllocationStrategy::SessionExclusive);
    }

    #[test]
    fn test_default_strategy_is_session_exclusive() {
        assert_eq!(
            AllocationStrategy::default(),
            AllocationStrategy::SessionExclusive
        );
    }
}
