//! In-memory pool of live sessions.
//!
//! The pool is an LRU over [`Session`] handles with two eviction
//! triggers: a hard cap on the number of live sessions, and an
//! estimated-memory watermark. Eviction is graceful: victims get a full
//! [`Session::cleanup`], so runtimes are disposed and slots released,
//! while their persisted history stays in the store for later
//! re-hydration.

use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::session::Session;

/// Pool sizing and pressure thresholds.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Hard cap on live sessions.
    pub max_sessions: usize,
    /// Memory budget for all live sessions together, in bytes.
    pub memory_budget_bytes: u64,
    /// Flat per-session memory estimate used against the budget.
    pub estimated_session_bytes: u64,
    /// How often the background sweeper re-checks pressure.
    pub sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_sessions: 100,
            memory_budget_bytes: 4 * 1024 * 1024 * 1024,
            estimated_session_bytes: 16 * 1024 * 1024,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// LRU pool of live sessions.
pub struct SessionPool {
    sessions: RwLock<LruCache<String, Arc<Session>>>,
    config: PoolConfig,
}

impl SessionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            // Capacity is enforced by the eviction pass, not the cache,
            // so victims can be cleaned up before they go.
            sessions: RwLock::new(LruCache::unbounded()),
            config,
        }
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Look up a live session, refreshing its recency.
    pub async fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.write().await.get(session_id).cloned()
    }

    /// Whether a session is live, without touching recency.
    pub async fn contains(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains(session_id)
    }

    /// Add a session, then relieve any pressure the addition caused.
    pub async fn insert(&self, session: Arc<Session>) {
        self.sessions
            .write()
            .await
            .push(session.id().to_string(), session);
        self.evict_if_pressured().await;
    }

    /// Remove a session and clean it up. Returns whether it was live.
    pub async fn remove(&self, session_id: &str) -> bool {
        let removed = self.sessions.write().await.pop(session_id);
        match removed {
            Some(session) => {
                session.cleanup().await;
                true
            }
            None => false,
        }
    }

    /// IDs of all live sessions, most recently used first.
    pub async fn session_ids(&self) -> Vec<String> {
        self.sessions
            .read()
            .await
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Evict least-recently-used sessions while over the session cap or
    /// past the memory watermark. Returns how many were evicted.
    pub async fn evict_if_pressured(&self) -> usize {
        let victims = {
            let mut sessions = self.sessions.write().await;
            let count = sessions.len();
            let overflow = count.saturating_sub(self.config.max_sessions);
            let estimated = count as u64 * self.config.estimated_session_bytes;
            let watermark = self.config.memory_budget_bytes / 10 * 8;

            if overflow == 0 && estimated <= watermark {
                return 0;
            }

            // Evict at least the overflow, and at least 10% of the
            // population so repeated sweeps make real progress.
            let target = overflow.max(count.div_ceil(10)).min(count);
            let mut victims = Vec::with_capacity(target);
            for _ in 0..target {
                match sessions.pop_lru() {
                    Some((_, session)) => victims.push(session),
                    None => break,
                }
            }
            victims
        };

        let evicted = victims.len();
        for session in victims {
            info!(session_id = %session.id(), "evicting session under pressure");
            session.cleanup().await;
        }
        if evicted > 0 {
            debug!(evicted, "pool eviction pass complete");
        }
        evicted
    }

    /// Run a periodic pressure check until the returned handle is
    /// aborted.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = Arc::downgrade(self);
        let interval = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else { break };
                pool.evict_if_pressured().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use skein_store::MemoryStore;

    use crate::gate::ExclusiveGate;
    use crate::runtime::MockFactory;
    use crate::session::{SessionConfig, SessionDeps, SessionState};
    use crate::telemetry::NoopTelemetry;

    fn make_session(id: &str) -> Arc<Session> {
        let store = Arc::new(MemoryStore::new());
        let deps = SessionDeps {
            factory: Arc::new(MockFactory::new()),
            sessions: store.clone(),
            events: store,
            telemetry: Arc::new(NoopTelemetry),
            gate: Arc::new(ExclusiveGate::new()),
        };
        Arc::new(Session::new(id, None, SessionConfig::default(), deps))
    }

    fn config(max: usize) -> PoolConfig {
        PoolConfig {
            max_sessions: max,
            ..PoolConfig::default()
        }
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let pool = SessionPool::new(config(10));
        pool.insert(make_session("a")).await;
        assert_eq!(pool.len().await, 1);
        assert!(pool.get("a").await.is_some());
        assert!(pool.get("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_overflow_evicts_lru_with_cleanup() {
        let pool = SessionPool::new(config(2));
        let first = make_session("a");
        pool.insert(first.clone()).await;
        pool.insert(make_session("b")).await;
        pool.insert(make_session("c")).await;

        assert_eq!(pool.len().await, 2);
        assert!(!pool.contains("a").await);
        assert_eq!(first.processing_status(), SessionState::Disposed);
    }

    #[tokio::test]
    async fn test_get_refreshes_recency() {
        let pool = SessionPool::new(config(2));
        let a = make_session("a");
        pool.insert(a.clone()).await;
        pool.insert(make_session("b")).await;

        // Touch "a" so "b" becomes the eviction candidate.
        pool.get("a").await;
        pool.insert(make_session("c")).await;

        assert!(pool.contains("a").await);
        assert!(!pool.contains("b").await);
    }

    #[tokio::test]
    async fn test_memory_pressure_eviction() {
        let pool = SessionPool::new(PoolConfig {
            max_sessions: 100,
            memory_budget_bytes: 100,
            estimated_session_bytes: 30,
            sweep_interval: Duration::from_secs(60),
        });
        pool.insert(make_session("a")).await;
        pool.insert(make_session("b")).await;
        // 3 x 30 = 90 > 80% of 100: the insert's pressure pass evicts.
        pool.insert(make_session("c")).await;
        assert!(pool.len().await < 3);
    }

    #[tokio::test]
    async fn test_remove_cleans_up() {
        let pool = SessionPool::new(config(10));
        let session = make_session("a");
        pool.insert(session.clone()).await;

        assert!(pool.remove("a").await);
        assert_eq!(session.processing_status(), SessionState::Disposed);
        assert!(!pool.remove("a").await);
    }

    #[tokio::test]
    async fn test_eviction_target_includes_population_share() {
        let pool = SessionPool::new(config(10));
        for i in 0..20 {
            pool.sessions
                .write()
                .await
                .push(format!("s{i}"), make_session(&format!("s{i}")));
        }

        // 10 over cap, 10% of 20 is 2; overflow dominates.
        let evicted = pool.evict_if_pressured().await;
        assert_eq!(evicted, 10);
        assert_eq!(pool.len().await, 10);
    }
}
