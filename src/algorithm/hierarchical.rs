//! Hierarchical Token Bucket: chained global / tenant / user admission.
//!
//! Each level is an independent [`TokenBucket`] state keyed under its own
//! storage key. A request is admitted only if every level has capacity;
//! admission debits all three. Levels are checked top-down (global first) and
//! the first level lacking capacity is reported as the denial cause.

use std::sync::Arc;

use crate::algorithm::{check_weight, Algorithm, TokenBucket};
use crate::clock::{Clock, SystemClock};
use crate::decision::{Decision, DecisionMetadata};
use crate::error::Result;
use crate::quota::Quota;
use crate::storage::Storage;

/// Which level of the hierarchy denied a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HierarchicalLevel {
    /// The global ceiling, shared by every tenant and user.
    Global,
    /// The per-tenant ceiling.
    Tenant,
    /// The per-user ceiling.
    User,
}

impl HierarchicalLevel {
    fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Tenant => "tenant",
            Self::User => "user",
        }
    }
}

/// Storage keys for one hierarchical check, one per level.
#[derive(Debug, Clone, Copy)]
pub struct HierarchicalKeys<'a> {
    /// Key for the global bucket (typically a constant, e.g. `"global"`).
    pub global: &'a str,
    /// Key for the tenant bucket (e.g. `"tenant:acme"`).
    pub tenant: &'a str,
    /// Key for the user bucket (e.g. `"tenant:acme:user:42"`).
    pub user: &'a str,
}

/// Chained global → tenant → user token buckets.
#[derive(Clone)]
pub struct HierarchicalTokenBucket {
    bucket: TokenBucket,
}

impl Default for HierarchicalTokenBucket {
    fn default() -> Self {
        Self::new()
    }
}

impl HierarchicalTokenBucket {
    /// Create a new hierarchical limiter using the system clock.
    pub fn new() -> Self {
        Self {
            bucket: TokenBucket::new(),
        }
    }

    /// Create a hierarchical limiter driven by a custom clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            bucket: TokenBucket::with_clock(clock),
        }
    }

    /// Check and, if every level has capacity, debit all three levels.
    ///
    /// Levels are peeked top-down with non-mutating `check` calls first; if
    /// any level lacks capacity the request is denied without touching any
    /// bucket. Only once all three levels clear does each get debited via
    /// `check_and_record`.
    pub async fn check_and_record<S: Storage>(
        &self,
        storage: &S,
        keys: HierarchicalKeys<'_>,
        global_quota: &Quota,
        tenant_quota: &Quota,
        user_quota: &Quota,
        weight: u64,
    ) -> Result<Decision> {
        check_weight(weight)?;

        let levels = [
            (HierarchicalLevel::Global, keys.global, global_quota),
            (HierarchicalLevel::Tenant, keys.tenant, tenant_quota),
            (HierarchicalLevel::User, keys.user, user_quota),
        ];

        for (level, key, quota) in levels {
            let peek = self.bucket.check(storage, key, quota, weight).await?;
            if peek.is_denied() {
                let info = peek
                    .info()
                    .clone()
                    .with_metadata(DecisionMetadata::new().with_extra("denial_level", level.as_str()));
                return Ok(Decision::denied(info));
            }
        }

        let mut last = None;
        for (level, key, quota) in levels {
            let decision = self.bucket.check_and_record(storage, key, quota, weight).await?;
            if decision.is_denied() {
                // Lost a race against a concurrent request between peek and commit;
                // report this level as the cause.
                let info = decision
                    .info()
                    .clone()
                    .with_metadata(DecisionMetadata::new().with_extra("denial_level", level.as_str()));
                return Ok(Decision::denied(info));
            }
            last = Some(decision);
        }

        Ok(last.expect("levels is non-empty"))
    }

    /// Reset all three levels for the given keys.
    pub async fn reset<S: Storage>(&self, storage: &S, keys: HierarchicalKeys<'_>) -> Result<()> {
        self.bucket.reset(storage, keys.global).await?;
        self.bucket.reset(storage, keys.tenant).await?;
        self.bucket.reset(storage, keys.user).await?;
        Ok(())
    }
}
