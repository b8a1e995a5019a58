//! Tiered rate limiting: per-plan quotas keyed by a tier name.
//!
//! A [`TieredLimiter`] holds one [`Quota`] per tier (e.g. `"free"`,
//! `"pro"`, `"enterprise"`) and namespaces storage keys by
//! `"{tier}:{key}"` so the same caller key never collides across tiers.
//! A tier registered with [`TierConfig::unlimited`] always allows.

use std::collections::HashMap;
use std::time::Instant;

use crate::algorithm::{Algorithm, TokenBucket};
use crate::decision::{Decision, DecisionMetadata, RateLimitInfo};
use crate::error::{ConfigError, Result};
use crate::quota::Quota;
use crate::storage::Storage;

/// Configuration for a single tier.
#[derive(Debug, Clone)]
pub struct TierConfig {
    quota: Option<Quota>,
}

impl TierConfig {
    /// A tier bound by `quota`.
    pub fn new(quota: Quota) -> Self {
        Self { quota: Some(quota) }
    }

    /// A tier with no limit at all (e.g. an internal/enterprise tier).
    pub fn unlimited() -> Self {
        Self { quota: None }
    }

    /// Whether this tier has no quota.
    pub fn is_unlimited(&self) -> bool {
        self.quota.is_none()
    }

    /// The tier's quota, if bounded.
    pub fn quota(&self) -> Option<&Quota> {
        self.quota.as_ref()
    }
}

/// Rate limiter that dispatches to a per-tier [`Quota`] using a single
/// shared algorithm.
///
/// All tiers are enforced with the same algorithm (defaults to
/// [`TokenBucket`]); what differs per tier is the quota and whether the
/// tier is bounded at all.
pub struct TieredLimiter<A: Algorithm = TokenBucket> {
    algorithm: A,
    tiers: HashMap<String, TierConfig>,
    default_tier: String,
}

impl TieredLimiter<TokenBucket> {
    /// Create a new tiered limiter using Token Bucket for every tier.
    pub fn new(default_tier: impl Into<String>) -> Self {
        Self {
            algorithm: TokenBucket::new(),
            tiers: HashMap::new(),
            default_tier: default_tier.into(),
        }
    }
}

impl<A: Algorithm> TieredLimiter<A> {
    /// Create a tiered limiter driven by a specific algorithm.
    pub fn with_algorithm(algorithm: A, default_tier: impl Into<String>) -> Self {
        Self {
            algorithm,
            tiers: HashMap::new(),
            default_tier: default_tier.into(),
        }
    }

    /// Register (or replace) a tier.
    pub fn register_tier(mut self, name: impl Into<String>, config: TierConfig) -> Self {
        self.tiers.insert(name.into(), config);
        self
    }

    /// All registered tier names.
    pub fn list_tiers(&self) -> Vec<String> {
        self.tiers.keys().cloned().collect()
    }

    /// The configuration for a tier, or `Misconfigured` if it isn't registered.
    pub fn tier_config(&self, tier: &str) -> Result<&TierConfig> {
        self.tiers
            .get(tier)
            .ok_or_else(|| ConfigError::NotFound(format!("tier: {tier}")).into())
    }

    /// Whether `tier` is registered as unlimited.
    pub fn is_unlimited(&self, tier: &str) -> Result<bool> {
        Ok(self.tier_config(tier)?.is_unlimited())
    }

    fn tier_key(tier: &str, key: &str) -> String {
        format!("{tier}:{key}")
    }

    fn unlimited_decision(&self, tier: &str) -> Decision {
        let now = Instant::now();
        let info = RateLimitInfo::new(u64::MAX, u64::MAX, now, now)
            .with_algorithm("unlimited")
            .with_metadata(DecisionMetadata::new().with_extra("tier", tier).with_extra("unlimited", true));
        Decision::allowed(info)
    }

    /// Check and record a request of `weight` against `key` in `tier`
    /// (falling back to the default tier if `tier` is `None`).
    pub async fn check_and_record<S: Storage>(
        &self,
        storage: &S,
        key: &str,
        tier: Option<&str>,
        weight: u64,
    ) -> Result<Decision> {
        let tier = tier.unwrap_or(&self.default_tier);
        let config = self.tier_config(tier)?;
        match config.quota() {
            None => Ok(self.unlimited_decision(tier)),
            Some(quota) => {
                self.algorithm
                    .check_and_record(storage, &Self::tier_key(tier, key), quota, weight)
                    .await
            }
        }
    }

    /// Peek at the current state for `key` in `tier` without consuming anything.
    pub async fn check<S: Storage>(&self, storage: &S, key: &str, tier: Option<&str>, weight: u64) -> Result<Decision> {
        let tier = tier.unwrap_or(&self.default_tier);
        let config = self.tier_config(tier)?;
        match config.quota() {
            None => Ok(self.unlimited_decision(tier)),
            Some(quota) => self.algorithm.check(storage, &Self::tier_key(tier, key), quota, weight).await,
        }
    }

    /// Reset `key` in `tier`, or in every bounded tier if `tier` is `None`.
    pub async fn reset<S: Storage>(&self, storage: &S, key: &str, tier: Option<&str>) -> Result<()> {
        match tier {
            Some(tier) => {
                let config = self.tier_config(tier)?;
                if config.quota().is_some() {
                    self.algorithm.reset(storage, &Self::tier_key(tier, key)).await?;
                }
            }
            None => {
                for (tier, config) in &self.tiers {
                    if config.quota().is_some() {
                        self.algorithm.reset(storage, &Self::tier_key(tier, key)).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Move `key` from `from_tier` to `to_tier`.
    ///
    /// When `preserve_state` is true, the fraction of `from_tier`'s quota
    /// already consumed is carried over proportionally into `to_tier`'s
    /// quota before `from_tier`'s state is cleared; otherwise `from_tier`'s
    /// state is simply dropped.
    pub async fn upgrade_tier<S: Storage>(
        &self,
        storage: &S,
        key: &str,
        from_tier: &str,
        to_tier: &str,
        preserve_state: bool,
    ) -> Result<()> {
        let from_config = self.tier_config(from_tier)?.clone();
        let to_config = self.tier_config(to_tier)?.clone();

        if preserve_state {
            if let (Some(from_quota), Some(to_quota)) = (from_config.quota(), to_config.quota()) {
                let from_key = Self::tier_key(from_tier, key);
                let decision = self.algorithm.check(storage, &from_key, from_quota, 1).await?;
                let info = decision.info();
                if info.limit > 0 {
                    let usage_pct = (info.limit - info.remaining) as f64 / info.limit as f64;
                    let consumed = (to_quota.max_requests() as f64 * usage_pct) as u64;
                    if consumed > 0 {
                        let to_key = Self::tier_key(to_tier, key);
                        self.algorithm.check_and_record(storage, &to_key, to_quota, consumed).await?;
                    }
                }
            }
        }

        self.reset(storage, key, Some(from_tier)).await
    }
}
