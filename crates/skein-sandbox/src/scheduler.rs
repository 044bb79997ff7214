//! Allocation scheduling over the provider API and the allocation store.
//!
//! The scheduler owns the policy side of sandboxes: which existing
//! instance a session may reuse, when a stale row must be retired, and
//! when a new instance is provisioned. It deliberately keeps no
//! process-local cache of allocations; every decision starts from the
//! store and a fresh liveness probe, so a URL handed out is never known
//! to be dead.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use skein_store::{
    AllocationStrategy, SandboxAllocationDao, SandboxAllocationRecord, UserConfigDao,
};

use crate::api::{Liveness, SandboxApi};
use crate::error::SandboxResult;

/// Tunables for the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// TTL requested for newly provisioned instances; the provider reaps
    /// instances that outlive it, so a lost bookkeeping row cannot leak
    /// an instance forever.
    pub sandbox_ttl: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sandbox_ttl: Duration::from_secs(60 * 60),
        }
    }
}

/// Decides which sandbox instance serves a request.
pub struct SandboxScheduler {
    api: Arc<dyn SandboxApi>,
    allocations: Arc<dyn SandboxAllocationDao>,
    configs: Arc<dyn UserConfigDao>,
    config: SchedulerConfig,
}

impl SandboxScheduler {
    pub fn new(
        api: Arc<dyn SandboxApi>,
        allocations: Arc<dyn SandboxAllocationDao>,
        configs: Arc<dyn UserConfigDao>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            api,
            allocations,
            configs,
            config,
        }
    }

    /// Resolve a live sandbox URL for the request, reusing an existing
    /// allocation per the strategy or provisioning a new instance.
    ///
    /// Strategy resolution: an explicit strategy wins; otherwise the
    /// user's stored configuration; otherwise the default.
    pub async fn get_sandbox_url(
        &self,
        user_id: Option<&str>,
        session_id: Option<&str>,
        strategy: Option<AllocationStrategy>,
    ) -> SandboxResult<String> {
        let strategy = match strategy {
            Some(s) => s,
            None => match user_id {
                Some(user) => self.configs.allocation_strategy(user).await?,
                None => AllocationStrategy::default(),
            },
        };

        // Reuse candidates, most recently used first.
        let candidates: Vec<SandboxAllocationRecord> = match strategy {
            AllocationStrategy::SessionExclusive => match session_id {
                Some(session) => self
                    .allocations
                    .find_active_for_session(session)
                    .await?
                    .into_iter()
                    .collect(),
                None => Vec::new(),
            },
            AllocationStrategy::UserExclusive => match user_id {
                Some(user) => self
                    .allocations
                    .find_active_for_user(user)
                    .await?
                    .into_iter()
                    .collect(),
                None => Vec::new(),
            },
            AllocationStrategy::SharedPool => {
                self.allocations
                    .find_active_shared(user_id.unwrap_or_default())
                    .await?
            }
        };

        for candidate in candidates {
            match self.api.probe(&candidate.sandbox_url).await {
                Liveness::Alive => {
                    self.allocations
                        .touch_last_used(&candidate.sandbox_id)
                        .await?;
                    debug!(
                        sandbox_id = %candidate.sandbox_id,
                        strategy = %strategy,
                        "reusing sandbox"
                    );
                    return Ok(candidate.sandbox_url);
                }
                liveness => {
                    warn!(
                        sandbox_id = %candidate.sandbox_id,
                        url = %candidate.sandbox_url,
                        ?liveness,
                        "retiring stale allocation"
                    );
                    self.allocations.deactivate(&candidate.sandbox_id).await?;
                }
            }
        }

        self.provision(user_id, session_id, strategy).await
    }

    /// Create a new instance and persist its allocation row.
    async fn provision(
        &self,
        user_id: Option<&str>,
        session_id: Option<&str>,
        strategy: AllocationStrategy,
    ) -> SandboxResult<String> {
        let provisioned = self.api.create(self.config.sandbox_ttl).await?;

        let mut record = SandboxAllocationRecord::new(
            &provisioned.sandbox_id,
            &provisioned.sandbox_url,
            strategy,
        );
        match strategy {
            AllocationStrategy::SessionExclusive => {
                if let Some(user) = user_id {
                    record = record.with_user(user);
                }
                if let Some(session) = session_id {
                    record = record.with_session(session);
                }
            }
            AllocationStrategy::UserExclusive => {
                if let Some(user) = user_id {
                    record = record.with_user(user);
                }
            }
            // Shared instances stay unbound so any user can draw them.
            AllocationStrategy::SharedPool => {}
        }

        self.allocations.insert(&record).await?;
        info!(
            sandbox_id = %record.sandbox_id,
            url = %record.sandbox_url,
            strategy = %strategy,
            "sandbox provisioned"
        );
        Ok(record.sandbox_url)
    }

    /// Retire an allocation: deactivate the row first so no new request
    /// can reuse it, then ask the provider to destroy the instance. An
    /// instance that is already gone counts as released.
    pub async fn release(&self, sandbox_id: &str) -> SandboxResult<()> {
        self.allocations.deactivate(sandbox_id).await?;

        if let Err(e) = self.api.delete(sandbox_id).await {
            // The row stays inactive; reconcile retries the deletion.
            warn!(sandbox_id = %sandbox_id, error = %e, "remote deletion failed");
        }
        Ok(())
    }

    /// Sweep inactive allocations: attempt remote deletion for each and
    /// drop the bookkeeping row once deletion has been attempted.
    /// Returns the number of rows removed.
    pub async fn reconcile(&self) -> SandboxResult<usize> {
        let inactive = self.allocations.list_inactive().await?;
        let mut removed = 0;

        for allocation in inactive {
            if let Err(e) = self.api.delete(&allocation.sandbox_id).await {
                warn!(
                    sandbox_id = %allocation.sandbox_id,
                    error = %e,
                    "reconcile deletion failed"
                );
            }
            self.allocations.remove(&allocation.sandbox_id).await?;
            removed += 1;
        }

        if removed > 0 {
            info!(removed, "reconciled inactive allocations");
        }
        Ok(removed)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockSandboxApi;
    use skein_store::{MemoryStore, UserConfigRecord};

    fn scheduler() -> (Arc<MockSandboxApi>, Arc<MemoryStore>, SandboxScheduler) {
        let api = Arc::new(MockSandboxApi::new());
        let store = Arc::new(MemoryStore::new());
        let scheduler = SandboxScheduler::new(
            api.clone(),
            store.clone(),
            store.clone(),
            SchedulerConfig::default(),
        );
        (api, store, scheduler)
    }

    #[tokio::test]
    async fn test_session_exclusive_provisions_then_reuses() {
        let (api, _, scheduler) = scheduler();

        let first = scheduler
            .get_sandbox_url(Some("u1"), Some("s1"), None)
            .await
            .unwrap();
        let second = scheduler
            .get_sandbox_url(Some("u1"), Some("s1"), None)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(api.created_count(), 1);
    }

    #[tokio::test]
    async fn test_distinct_sessions_get_distinct_sandboxes() {
        let (api, _, scheduler) = scheduler();

        let a = scheduler
            .get_sandbox_url(Some("u1"), Some("s1"), None)
            .await
            .unwrap();
        let b = scheduler
            .get_sandbox_url(Some("u1"), Some("s2"), None)
            .await
            .unwrap();

        assert_ne!(a, b);
        assert_eq!(api.created_count(), 2);
    }

    #[tokio::test]
    async fn test_dead_sandbox_never_returned() {
        let (api, store, scheduler) = scheduler();

        let first = scheduler
            .get_sandbox_url(Some("u1"), Some("s1"), None)
            .await
            .unwrap();
        api.set_liveness(&first, Liveness::Unreachable);

        let second = scheduler
            .get_sandbox_url(Some("u1"), Some("s1"), None)
            .await
            .unwrap();
        assert_ne!(first, second);
        assert_eq!(api.created_count(), 2);

        // The stale row was deactivated, not deleted.
        let inactive = store.list_inactive().await.unwrap();
        assert_eq!(inactive.len(), 1);
    }

    #[tokio::test]
    async fn test_user_exclusive_shared_across_sessions() {
        let (api, _, scheduler) = scheduler();
        let strategy = Some(AllocationStrategy::UserExclusive);

        let a = scheduler
            .get_sandbox_url(Some("u1"), Some("s1"), strategy)
            .await
            .unwrap();
        let b = scheduler
            .get_sandbox_url(Some("u1"), Some("s2"), strategy)
            .await
            .unwrap();
        let other = scheduler
            .get_sandbox_url(Some("u2"), Some("s3"), strategy)
            .await
            .unwrap();

        assert_eq!(a, b);
        assert_ne!(a, other);
        assert_eq!(api.created_count(), 2);
    }

    #[tokio::test]
    async fn test_shared_pool_reused_across_users() {
        let (api, _, scheduler) = scheduler();
        let strategy = Some(AllocationStrategy::SharedPool);

        let a = scheduler
            .get_sandbox_url(Some("u1"), Some("s1"), strategy)
            .await
            .unwrap();
        let b = scheduler
            .get_sandbox_url(Some("u2"), Some("s2"), strategy)
            .await
            .unwrap();

        assert_eq!(a, b);
        assert_eq!(api.created_count(), 1);
    }

    #[tokio::test]
    async fn test_strategy_from_user_config() {
        let (api, store, scheduler) = scheduler();
        let mut config = UserConfigRecord::defaults("u1");
        config.strategy = AllocationStrategy::UserExclusive;
        store.put_config(&config).await.unwrap();

        let a = scheduler
            .get_sandbox_url(Some("u1"), Some("s1"), None)
            .await
            .unwrap();
        let b = scheduler
            .get_sandbox_url(Some("u1"), Some("s2"), None)
            .await
            .unwrap();

        assert_eq!(a, b);
        assert_eq!(api.created_count(), 1);
    }

    #[tokio::test]
    async fn test_release_then_reprovision() {
        let (api, _, scheduler) = scheduler();

        let first = scheduler
            .get_sandbox_url(Some("u1"), Some("s1"), None)
            .await
            .unwrap();
        scheduler.release("sb-1").await.unwrap();
        assert_eq!(api.deleted_ids(), vec!["sb-1"]);

        let second = scheduler
            .get_sandbox_url(Some("u1"), Some("s1"), None)
            .await
            .unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_reconcile_sweeps_inactive_rows() {
        let (api, store, scheduler) = scheduler();

        scheduler
            .get_sandbox_url(Some("u1"), Some("s1"), None)
            .await
            .unwrap();
        scheduler
            .get_sandbox_url(Some("u1"), Some("s2"), None)
            .await
            .unwrap();
        store.deactivate("sb-1").await.unwrap();
        store.deactivate("sb-2").await.unwrap();

        let removed = scheduler.reconcile().await.unwrap();
        assert_eq!(removed, 2);
        assert!(store.list_inactive().await.unwrap().is_empty());

        let mut deleted = api.deleted_ids();
        deleted.sort();
        assert_eq!(deleted, vec!["sb-1", "sb-2"]);
    }

    #[tokio::test]
    async fn test_provisioning_failure_surfaces() {
        let (api, _, scheduler) = scheduler();
        api.fail_create();

        let err = scheduler
            .get_sandbox_url(Some("u1"), Some("s1"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::SandboxError::Provisioning(_)));
    }
}
