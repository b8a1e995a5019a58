//! Shared quota pools: one pooled budget split fairly across many members.
//!
//! A [`QuotaPool`] wraps a single [`TokenBucket`] keyed by `pool_id` and adds
//! bookkeeping most single-key algorithms don't need: per-member usage
//! tracking, an optional fair-share ceiling so one member can't exhaust the
//! pool, a hard per-member cap, and optional rollover of unused capacity into
//! the next window.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::algorithm::{check_weight, Algorithm, TokenBucket};
use crate::clock::Clock;
use crate::decision::{Decision, DecisionMetadata};
use crate::error::{ConfigError, Result};
use crate::quota::Quota;
use crate::storage::Storage;

/// Configuration for a [`QuotaPool`].
#[derive(Debug, Clone)]
pub struct QuotaPoolConfig {
    total_quota: u64,
    window: Duration,
    fair_share: bool,
    fair_share_tolerance: f64,
    max_per_member: Option<u64>,
    rollover: bool,
    rollover_percent: f64,
}

impl QuotaPoolConfig {
    /// Create a new pool configuration with the given total quota and window.
    pub fn new(total_quota: u64, window: Duration) -> Self {
        Self {
            total_quota,
            window,
            fair_share: true,
            fair_share_tolerance: 0.2,
            max_per_member: None,
            rollover: false,
            rollover_percent: 0.5,
        }
    }

    /// Enable or disable fair-share enforcement (enabled by default).
    pub fn with_fair_share(mut self, enabled: bool) -> Self {
        self.fair_share = enabled;
        self
    }

    /// Set how far above the even fair-share a member may go before being
    /// blocked, as a fraction of the fair-share itself (default `0.2`).
    pub fn with_fair_share_tolerance(mut self, tolerance: f64) -> Self {
        self.fair_share_tolerance = tolerance.max(0.0);
        self
    }

    /// Cap any single member to at most `n` units of the pool.
    pub fn with_max_per_member(mut self, n: u64) -> Self {
        self.max_per_member = Some(n);
        self
    }

    /// Carry over `percent` (clamped to `[0, 1]`) of a window's unused
    /// capacity into the next window's starting budget.
    pub fn with_rollover(mut self, percent: f64) -> Self {
        self.rollover = true;
        self.rollover_percent = percent.clamp(0.0, 1.0);
        self
    }
}

/// A single pooled budget shared fairly across members.
pub struct QuotaPool {
    pool_id: String,
    config: QuotaPoolConfig,
    bucket: TokenBucket,
    member_usage: Mutex<HashMap<String, u64>>,
    rollover_quota: Mutex<u64>,
}

impl QuotaPool {
    /// Create a new pool identified by `pool_id`.
    pub fn new(pool_id: impl Into<String>, config: QuotaPoolConfig) -> Self {
        Self {
            pool_id: pool_id.into(),
            config,
            bucket: TokenBucket::new(),
            member_usage: Mutex::new(HashMap::new()),
            rollover_quota: Mutex::new(0),
        }
    }

    /// Create a pool driven by a custom clock (for deterministic tests).
    pub fn with_clock(pool_id: impl Into<String>, config: QuotaPoolConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool_id: pool_id.into(),
            config,
            bucket: TokenBucket::with_clock(clock),
            member_usage: Mutex::new(HashMap::new()),
            rollover_quota: Mutex::new(0),
        }
    }

    /// The current effective quota: the configured total plus any rolled-over
    /// unused capacity from the previous window.
    fn quota(&self) -> Quota {
        let rollover = *self.rollover_quota.lock();
        Quota::new(self.config.total_quota, self.config.window).with_burst(self.config.total_quota + rollover)
    }

    /// Consume `weight` units of the pool on behalf of `member_id`.
    ///
    /// When `force` is true, fair-share and per-member caps are bypassed and
    /// only the pool's total budget is enforced.
    pub async fn consume<S: Storage>(&self, storage: &S, member_id: &str, weight: u64, force: bool) -> Result<bool> {
        check_weight(weight)?;

        if !force {
            if self.config.fair_share && !self.check_fair_share(storage, member_id, weight).await? {
                return Ok(false);
            }
            if let Some(max) = self.config.max_per_member {
                let usage = *self.member_usage.lock().get(member_id).unwrap_or(&0);
                if usage + weight > max {
                    return Ok(false);
                }
            }
        }

        let quota = self.quota();
        let decision = self.bucket.check_and_record(storage, &self.pool_id, &quota, weight).await?;
        if decision.is_allowed() {
            *self.member_usage.lock().entry(member_id.to_string()).or_insert(0) += weight;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Whether `member_id` can take `weight` more units without exceeding its
    /// fair share of the pool's already-used capacity, plus the configured
    /// tolerance.
    async fn check_fair_share<S: Storage>(&self, storage: &S, member_id: &str, weight: u64) -> Result<bool> {
        let quota = self.quota();
        let peek = self.bucket.check(storage, &self.pool_id, &quota, 1).await?;
        let info = peek.info();
        let total_used = info.limit.saturating_sub(info.remaining);
        if total_used == 0 {
            return Ok(true);
        }

        let member_usage = *self.member_usage.lock().get(member_id).unwrap_or(&0);
        let num_members = self.member_usage.lock().len().max(1) as u64;
        let fair_share = total_used as f64 / num_members as f64;
        let tolerance = fair_share * self.config.fair_share_tolerance;

        Ok((member_usage + weight) as f64 <= fair_share + tolerance)
    }

    /// Peek at the pool's current state without consuming anything.
    pub async fn check<S: Storage>(&self, storage: &S, member_id: Option<&str>) -> Result<Decision> {
        let quota = self.quota();
        let decision = self.bucket.check(storage, &self.pool_id, &quota, 1).await?;

        let mut metadata = DecisionMetadata::new()
            .with_extra("pool_id", self.pool_id.clone())
            .with_extra("total_quota", self.config.total_quota);

        if let Some(member_id) = member_id {
            let usage = *self.member_usage.lock().get(member_id).unwrap_or(&0);
            metadata = metadata
                .with_extra("member_id", member_id)
                .with_extra("member_usage", usage);
        }

        let info = decision.info().clone().with_metadata(metadata);
        Ok(if decision.is_allowed() {
            Decision::allowed(info)
        } else {
            Decision::denied(info)
        })
    }

    /// Reset the pool for a new window, rolling over unused capacity if
    /// configured.
    ///
    /// The rollover amount computed here actually feeds into [`Self::quota`]
    /// for every subsequent admission until the next reset, so it widens the
    /// bucket's burst ceiling rather than being tracked but never applied.
    pub async fn reset<S: Storage>(&self, storage: &S) -> Result<()> {
        if self.config.rollover {
            let quota = self.quota();
            let peek = self.bucket.check(storage, &self.pool_id, &quota, 1).await?;
            let unused = peek.info().remaining;
            *self.rollover_quota.lock() = (unused as f64 * self.config.rollover_percent) as u64;
        }

        self.bucket.reset(storage, &self.pool_id).await?;
        self.member_usage.lock().clear();
        Ok(())
    }

    /// Units of the pool consumed so far by `member_id`.
    pub fn member_usage(&self, member_id: &str) -> u64 {
        *self.member_usage.lock().get(member_id).unwrap_or(&0)
    }

    /// All members that have consumed from the pool since the last reset.
    pub fn list_members(&self) -> Vec<String> {
        self.member_usage.lock().keys().cloned().collect()
    }

    /// Forget a member's usage without affecting the pool's overall budget.
    pub fn remove_member(&self, member_id: &str) {
        self.member_usage.lock().remove(member_id);
    }
}

/// Registry of named [`QuotaPool`]s, for applications that manage several
/// pools (e.g. one per plan tier or per upstream dependency).
pub struct SharedQuotaManager {
    pools: Mutex<HashMap<String, Arc<QuotaPool>>>,
}

impl Default for SharedQuotaManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedQuotaManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Create and register a new pool.
    pub fn create_pool(&self, pool_id: impl Into<String>, config: QuotaPoolConfig) -> Result<Arc<QuotaPool>> {
        let pool_id = pool_id.into();
        let mut pools = self.pools.lock();
        if pools.contains_key(&pool_id) {
            return Err(ConfigError::DuplicateName(pool_id).into());
        }
        let pool = Arc::new(QuotaPool::new(pool_id.clone(), config));
        pools.insert(pool_id, pool.clone());
        Ok(pool)
    }

    /// Look up a previously-created pool.
    pub fn get_pool(&self, pool_id: &str) -> Result<Arc<QuotaPool>> {
        self.pools
            .lock()
            .get(pool_id)
            .cloned()
            .ok_or_else(|| ConfigError::NotFound(pool_id.to_string()).into())
    }

    /// Consume `weight` units from a named pool on behalf of `member_id`.
    pub async fn consume<S: Storage>(&self, storage: &S, pool_id: &str, member_id: &str, weight: u64) -> Result<bool> {
        let pool = self.get_pool(pool_id)?;
        pool.consume(storage, member_id, weight, false).await
    }

    /// List all registered pool ids.
    pub fn list_pools(&self) -> Vec<String> {
        self.pools.lock().keys().cloned().collect()
    }

    /// Remove a pool from the registry.
    pub fn delete_pool(&self, pool_id: &str) {
        self.pools.lock().remove(pool_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[tokio::test]
    async fn test_quota_pool_basic_consume() {
        let pool = QuotaPool::new("pool:a", QuotaPoolConfig::new(10, Duration::from_secs(60)).with_fair_share(false));
        let storage = MemoryStorage::new();

        for _ in 0..10 {
            assert!(pool.consume(&storage, "member:1", 1, false).await.unwrap());
        }
        assert!(!pool.consume(&storage, "member:1", 1, false).await.unwrap());
    }

    #[tokio::test]
    async fn test_quota_pool_fair_share_blocks_hog() {
        let pool = QuotaPool::new("pool:a", QuotaPoolConfig::new(100, Duration::from_secs(60)));
        let storage = MemoryStorage::new();

        // member:1 takes far more than an even share while member:2 is idle.
        for _ in 0..40 {
            pool.consume(&storage, "member:1", 1, false).await.unwrap();
        }
        // total_used=40, 1 member => fair_share=40, tolerance=8; 40+1<=48 still ok.
        assert!(pool.consume(&storage, "member:1", 1, false).await.unwrap());

        // Bring member:2 into the picture.
        pool.consume(&storage, "member:2", 1, false).await.unwrap();
        // now total_used=42, 2 members => fair_share=21, tolerance=4.2
        // member:1 usage is already 41, well past 21+4.2
        assert!(!pool.consume(&storage, "member:1", 1, false).await.unwrap());
    }

    #[tokio::test]
    async fn test_quota_pool_force_bypasses_fair_share() {
        let pool = QuotaPool::new("pool:a", QuotaPoolConfig::new(10, Duration::from_secs(60)));
        let storage = MemoryStorage::new();

        for _ in 0..10 {
            pool.consume(&storage, "member:1", 1, true).await.unwrap();
        }
        // pool itself is now exhausted regardless of force.
        assert!(!pool.consume(&storage, "member:1", 1, true).await.unwrap());
    }

    #[tokio::test]
    async fn test_quota_pool_max_per_member() {
        let pool = QuotaPool::new(
            "pool:a",
            QuotaPoolConfig::new(100, Duration::from_secs(60))
                .with_fair_share(false)
                .with_max_per_member(3),
        );
        let storage = MemoryStorage::new();

        for _ in 0..3 {
            assert!(pool.consume(&storage, "member:1", 1, false).await.unwrap());
        }
        assert!(!pool.consume(&storage, "member:1", 1, false).await.unwrap());
        // a different member is unaffected by member:1's cap
        assert!(pool.consume(&storage, "member:2", 1, false).await.unwrap());
    }

    #[tokio::test]
    async fn test_quota_pool_rollover_carries_capacity_forward() {
        let pool = QuotaPool::new(
            "pool:a",
            QuotaPoolConfig::new(10, Duration::from_secs(60))
                .with_fair_share(false)
                .with_rollover(0.5),
        );
        let storage = MemoryStorage::new();

        // use half the pool, leave 5 unused
        for _ in 0..5 {
            pool.consume(&storage, "member:1", 1, false).await.unwrap();
        }
        pool.reset(&storage).await.unwrap();

        // rollover credits floor(5 * 0.5) = 2 tokens on top of the fresh 10
        for i in 0..12 {
            let ok = pool.consume(&storage, "member:1", 1, false).await.unwrap();
            assert!(ok, "consume {i} should be allowed with rollover credit");
        }
        assert!(!pool.consume(&storage, "member:1", 1, false).await.unwrap());
    }

    #[tokio::test]
    async fn test_shared_quota_manager_duplicate_pool_rejected() {
        let manager = SharedQuotaManager::new();
        manager
            .create_pool("pool:a", QuotaPoolConfig::new(10, Duration::from_secs(60)))
            .unwrap();

        let err = manager
            .create_pool("pool:a", QuotaPoolConfig::new(10, Duration::from_secs(60)))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Misconfigured);
    }

    #[tokio::test]
    async fn test_shared_quota_manager_consume() {
        let manager = SharedQuotaManager::new();
        manager
            .create_pool("pool:a", QuotaPoolConfig::new(5, Duration::from_secs(60)).with_fair_share(false))
            .unwrap();
        let storage = MemoryStorage::new();

        for _ in 0..5 {
            assert!(manager.consume(&storage, "pool:a", "member:1", 1).await.unwrap());
        }
        assert!(!manager.consume(&storage, "pool:a", "member:1", 1).await.unwrap());
    }
}
