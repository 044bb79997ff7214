//! In-memory store backend.
//!
//! Implements the same DAO contracts as the SQLite backend over plain
//! maps. Used by tests and by callers that want a throwaway server with
//! no database file.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use skein_protocol::AgentEvent;

use crate::dao::{EventDao, SandboxAllocationDao, SessionDao, UserConfigDao};
use crate::error::{Result, StoreError};
use crate::records::{AllocationStrategy, SandboxAllocationRecord, SessionRecord, UserConfigRecord};

/// A stored event with its insertion-order tiebreaker.
#[derive(Debug, Clone)]
struct StoredEvent {
    seq: u64,
    event: AgentEvent,
}

#[derive(Debug, Default)]
struct Inner {
    sessions: HashMap<String, SessionRecord>,
    events: HashMap<String, Vec<StoredEvent>>,
    next_seq: u64,
    allocations: HashMap<String, SandboxAllocationRecord>,
    configs: HashMap<String, UserConfigRecord>,
}

/// Store backed by process memory. Contents vanish on drop.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionDao for MemoryStore {
    async fn create(&self, record: &SessionRecord) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.sessions.contains_key(&record.id) {
            return Err(StoreError::Conflict(format!("session {}", record.id)));
        }
        inner.sessions.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<SessionRecord>> {
        Ok(self.inner.read().sessions.get(id).cloned())
    }

    async fn update_metadata(&self, id: &str, metadata: &serde_json::Value) -> Result<()> {
        let mut inner = self.inner.write();
        let record = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("session {id}")))?;
        record.metadata = metadata.clone();
        record.updated_at = skein_protocol::now_millis();
        Ok(())
    }

    async fn touch(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let record = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("session {id}")))?;
        record.updated_at = skein_protocol::now_millis();
        Ok(())
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<SessionRecord>> {
        let inner = self.inner.read();
        let mut sessions: Vec<SessionRecord> = inner
            .sessions
            .values()
            .filter(|s| s.user_id.as_deref() == Some(user_id))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write();
        inner.sessions.remove(id);
        inner.events.remove(id);
        Ok(())
    }
}

#[async_trait]
impl EventDao for MemoryStore {
    async fn append(&self, session_id: &str, event: &AgentEvent) -> Result<()> {
        let mut inner = self.inner.write();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner
            .events
            .entry(session_id.to_string())
            .or_default()
            .push(StoredEvent {
                seq,
                event: event.clone(),
            });
        Ok(())
    }

    async fn list(&self, session_id: &str) -> Result<Vec<AgentEvent>> {
        let inner = self.inner.read();
        let mut stored: Vec<StoredEvent> = inner
            .events
            .get(session_id)
            .map(|v| v.to_vec())
            .unwrap_or_default();
        stored.sort_by_key(|s| (s.event.timestamp(), s.seq));
        Ok(stored.into_iter().map(|s| s.event).collect())
    }

    async fn delete_for_session(&self, session_id: &str) -> Result<()> {
        self.inner.write().events.remove(session_id);
        Ok(())
    }
}

#[async_trait]
impl SandboxAllocationDao for MemoryStore {
    async fn insert(&self, record: &SandboxAllocationRecord) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.allocations.contains_key(&record.sandbox_id) {
            return Err(StoreError::Conflict(format!("sandbox {}", record.sandbox_id)));
        }
        inner
            .allocations
            .insert(record.sandbox_id.clone(), record.clone());
        Ok(())
    }

    async fn find_active_for_session(
        &self,
        session_id: &str,
    ) -> Result<Option<SandboxAllocationRecord>> {
        let inner = self.inner.read();
        Ok(inner
            .allocations
            .values()
            .filter(|a| a.is_active && a.session_id.as_deref() == Some(session_id))
            .max_by_key(|a| a.last_used_at)
            .cloned())
    }

    async fn find_active_for_user(
        &self,
        user_id: &str,
    ) -> Result<Option<SandboxAllocationRecord>> {
        let inner = self.inner.read();
        Ok(inner
            .allocations
            .values()
            .filter(|a| {
                a.is_active
                    && a.strategy == AllocationStrategy::UserExclusive
                    && a.user_id.as_deref() == Some(user_id)
            })
            .max_by_key(|a| a.last_used_at)
            .cloned())
    }

    async fn find_active_shared(&self, user_id: &str) -> Result<Vec<SandboxAllocationRecord>> {
        let inner = self.inner.read();
        let mut allocations: Vec<SandboxAllocationRecord> = inner
            .allocations
            .values()
            .filter(|a| {
                a.is_active
                    && a.strategy == AllocationStrategy::SharedPool
                    && a.user_id.as_deref().map(|u| u == user_id).unwrap_or(true)
            })
            .cloned()
            .collect();
        allocations.sort_by(|a, b| b.last_used_at.cmp(&a.last_used_at));
        Ok(allocations)
    }

    async fn touch_last_used(&self, sandbox_id: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let record = inner
            .allocations
            .get_mut(sandbox_id)
            .ok_or_else(|| StoreError::NotFound(format!("sandbox {sandbox_id}")))?;
        record.last_used_at = skein_protocol::now_millis();
        Ok(())
    }

    async fn deactivate(&self, sandbox_id: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let record = inner
            .allocations
            .get_mut(sandbox_id)
            .ok_or_else(|| StoreError::NotFound(format!("sandbox {sandbox_id}")))?;
        record.is_active = false;
        Ok(())
    }

    async fn list_inactive(&self) -> Result<Vec<SandboxAllocationRecord>> {
        let inner = self.inner.read();
        let mut allocations: Vec<SandboxAllocationRecord> = inner
            .allocations
            .values()
            .filter(|a| !a.is_active)
            .cloned()
            .collect();
        allocations.sort_by_key(|a| a.last_used_at);
        Ok(allocations)
    }

    async fn remove(&self, sandbox_id: &str) -> Result<()> {
        self.inner.write().allocations.remove(sandbox_id);
        Ok(())
    }
}

#[async_trait]
impl UserConfigDao for MemoryStore {
    async fn get_config(&self, user_id: &str) -> Result<Option<UserConfigRecord>> {
        Ok(self.inner.read().configs.get(user_id).cloned())
    }

    async fn put_config(&self, record: &UserConfigRecord) -> Result<()> {
        self.inner
            .write()
            .configs
            .insert(record.user_id.clone(), record.clone());
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mirrors_sqlite_conflict_semantics() {
        let store = MemoryStore::new();
        let record = SessionRecord::new("s1", "/w");
        store.create(&record).await.unwrap();
        assert!(matches!(
            store.create(&record).await.unwrap_err(),
            StoreError::Conflict(_)
        ));
    }

    #[tokio::test]
    async fn test_event_order_stable_within_millisecond() {
        let store = MemoryStore::new();
        for i in 0..3 {
            store
                .append(
                    "s1",
                    &AgentEvent::UserMessage {
                        timestamp: 42,
                        content: format!("{i}"),
                    },
                )
                .await
                .unwrap();
        }

        let events = store.list("s1").await.unwrap();
        let contents: Vec<_> = events
            .iter()
            .map(|e| match e {
                AgentEvent::UserMessage { content, .. } => content.as_str(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(contents, vec!["0", "1", "2"]);
    }

    #[tokio::test]
    async fn test_shared_lookup_excludes_foreign_user() {
        let store = MemoryStore::new();
        store
            .insert(&SandboxAllocationRecord::new(
                "sb-1",
                "http://sb1",
                AllocationStrategy::SharedPool,
            ))
            .await
            .unwrap();
        store
            .insert(
                &SandboxAllocationRecord::new("sb-2", "http://sb2", AllocationStrategy::SharedPool)
                    .with_user("someone-else"),
            )
            .await
            .unwrap();

        let shared = store.find_active_shared("u1").await.unwrap();
        let ids: Vec<_> = shared.iter().map(|a| a.sandbox_id.as_str()).collect();
        assert_eq!(ids, vec!["sb-1"]);
    }
}
