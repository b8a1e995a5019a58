//! Dynamic algorithm/backend selection facade.
//!
//! [`RateLimiter`] owns a concrete [`Storage`] backend and dispatches to one
//! of the five single-key algorithms chosen by name at construction time —
//! the inverse of calling an [`Algorithm`] directly with a storage reference
//! per call. It layers [`HookRegistry`] callbacks and an optional
//! `raise_on_limit` error policy around the raw decision, mirroring how
//! application code typically wants one object per configured limit rather
//! than a bag of generic parameters.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::algorithm::{Algorithm, FixedWindow, SlidingWindow, TokenBucket};
use crate::clock::{Clock, SystemClock};
use crate::decision::Decision;
use crate::error::{ConfigError, RateLimitError, Result};
use crate::hooks::{HookContext, HookEvent, HookRegistry};
use crate::quota::Quota;
use crate::storage::Storage;

#[cfg(feature = "leaky-bucket")]
use crate::algorithm::LeakyBucket;
#[cfg(feature = "gcra")]
use crate::algorithm::GCRA;

/// A concrete algorithm choice, selectable by name.
///
/// Holds the actual algorithm instance rather than a trait object — the
/// `Algorithm` trait takes storage as a per-call generic parameter, which
/// rules out `Box<dyn Algorithm>`. Dispatch happens via `match` instead.
pub enum AlgorithmChoice {
    /// Token Bucket (`"token_bucket"`).
    TokenBucket(TokenBucket),
    /// Leaky Bucket (`"leaky_bucket"`), requires the `leaky-bucket` feature.
    #[cfg(feature = "leaky-bucket")]
    LeakyBucket(LeakyBucket),
    /// Fixed Window (`"fixed_window"`).
    FixedWindow(FixedWindow),
    /// Sliding Window (`"sliding_window"`).
    SlidingWindow(SlidingWindow),
    /// GCRA (`"gcra"`), requires the `gcra` feature.
    #[cfg(feature = "gcra")]
    Gcra(GCRA),
}

impl AlgorithmChoice {
    /// Resolve an algorithm by its configuration name, using the system clock.
    pub fn by_name(name: &str) -> Result<Self> {
        Self::by_name_with_clock(name, Arc::new(SystemClock))
    }

    /// Resolve an algorithm by name, driven by a specific clock (for tests).
    pub fn by_name_with_clock(name: &str, clock: Arc<dyn Clock>) -> Result<Self> {
        match name {
            "token_bucket" => Ok(Self::TokenBucket(TokenBucket::with_clock(clock))),
            #[cfg(feature = "leaky-bucket")]
            "leaky_bucket" => Ok(Self::LeakyBucket(LeakyBucket::with_clock(clock))),
            "fixed_window" => Ok(Self::FixedWindow(FixedWindow::with_clock(clock))),
            "sliding_window" => Ok(Self::SlidingWindow(SlidingWindow::with_clock(clock))),
            #[cfg(feature = "gcra")]
            "gcra" => Ok(Self::Gcra(GCRA::with_clock(clock))),
            other => Err(ConfigError::InvalidAlgorithm(format!("unknown algorithm: {other}")).into()),
        }
    }

    /// The name this instance was resolved from.
    pub fn name(&self) -> &'static str {
        match self {
            Self::TokenBucket(a) => a.name(),
            #[cfg(feature = "leaky-bucket")]
            Self::LeakyBucket(a) => a.name(),
            Self::FixedWindow(a) => a.name(),
            Self::SlidingWindow(a) => a.name(),
            #[cfg(feature = "gcra")]
            Self::Gcra(a) => a.name(),
        }
    }

    async fn check_and_record<S: Storage>(&self, storage: &S, key: &str, quota: &Quota, weight: u64) -> Result<Decision> {
        match self {
            Self::TokenBucket(a) => a.check_and_record(storage, key, quota, weight).await,
            #[cfg(feature = "leaky-bucket")]
            Self::LeakyBucket(a) => a.check_and_record(storage, key, quota, weight).await,
            Self::FixedWindow(a) => a.check_and_record(storage, key, quota, weight).await,
            Self::SlidingWindow(a) => a.check_and_record(storage, key, quota, weight).await,
            #[cfg(feature = "gcra")]
            Self::Gcra(a) => a.check_and_record(storage, key, quota, weight).await,
        }
    }

    async fn check<S: Storage>(&self, storage: &S, key: &str, quota: &Quota, weight: u64) -> Result<Decision> {
        match self {
            Self::TokenBucket(a) => a.check(storage, key, quota, weight).await,
            #[cfg(feature = "leaky-bucket")]
            Self::LeakyBucket(a) => a.check(storage, key, quota, weight).await,
            Self::FixedWindow(a) => a.check(storage, key, quota, weight).await,
            Self::SlidingWindow(a) => a.check(storage, key, quota, weight).await,
            #[cfg(feature = "gcra")]
            Self::Gcra(a) => a.check(storage, key, quota, weight).await,
        }
    }

    async fn reset<S: Storage>(&self, storage: &S, key: &str) -> Result<()> {
        match self {
            Self::TokenBucket(a) => a.reset(storage, key).await,
            #[cfg(feature = "leaky-bucket")]
            Self::LeakyBucket(a) => a.reset(storage, key).await,
            Self::FixedWindow(a) => a.reset(storage, key).await,
            Self::SlidingWindow(a) => a.reset(storage, key).await,
            #[cfg(feature = "gcra")]
            Self::Gcra(a) => a.reset(storage, key).await,
        }
    }
}

/// A fully configured rate limiter: algorithm + backend + quota + hooks.
pub struct RateLimiter<S: Storage> {
    algorithm: AlgorithmChoice,
    storage: S,
    quota: Mutex<Quota>,
    raise_on_limit: bool,
    hooks: HookRegistry,
}

impl<S: Storage> RateLimiter<S> {
    /// Build a rate limiter, resolving the algorithm by configuration name.
    pub fn new(algorithm_name: &str, storage: S, quota: Quota) -> Result<Self> {
        Ok(Self::with_algorithm(AlgorithmChoice::by_name(algorithm_name)?, storage, quota))
    }

    /// Build a rate limiter from an already-resolved algorithm choice.
    pub fn with_algorithm(algorithm: AlgorithmChoice, storage: S, quota: Quota) -> Self {
        Self {
            algorithm,
            storage,
            quota: Mutex::new(quota),
            raise_on_limit: false,
            hooks: HookRegistry::new(),
        }
    }

    /// When set, `allow` returns `Err(RateLimitError::RateLimitExceeded { .. })`
    /// instead of `Ok(false)` for a denied request.
    pub fn with_raise_on_limit(mut self, raise_on_limit: bool) -> Self {
        self.raise_on_limit = raise_on_limit;
        self
    }

    /// The hook registry, for registering `before_check`/`after_check`/
    /// `on_allow`/`on_deny`/`on_error` callbacks.
    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    /// Replace the active quota (e.g. after a plan change).
    pub fn reconfigure(&self, quota: Quota) {
        *self.quota.lock() = quota;
    }

    fn current_quota(&self) -> Quota {
        self.quota.lock().clone()
    }

    /// Reject an empty key before it ever reaches the algorithm/storage layer.
    fn check_key(key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(RateLimitError::InvalidArgument("key must not be empty".into()));
        }
        Ok(())
    }

    /// Check and record a request, running hooks around the decision.
    ///
    /// Returns `Ok(true)`/`Ok(false)` unless `raise_on_limit` is set, in
    /// which case a denial surfaces as
    /// `Err(RateLimitError::RateLimitExceeded { .. })`.
    pub async fn allow(&self, key: &str, weight: u64) -> Result<bool> {
        Self::check_key(key)?;
        self.hooks.run(
            HookEvent::BeforeCheck,
            &HookContext { key, weight, decision: None, error: None },
        );

        let quota = self.current_quota();
        match self.algorithm.check_and_record(&self.storage, key, &quota, weight).await {
            Ok(decision) => {
                self.hooks.run(
                    HookEvent::AfterCheck,
                    &HookContext { key, weight, decision: Some(&decision), error: None },
                );
                if decision.is_allowed() {
                    self.hooks.run(
                        HookEvent::OnAllow,
                        &HookContext { key, weight, decision: Some(&decision), error: None },
                    );
                    Ok(true)
                } else {
                    self.hooks.run(
                        HookEvent::OnDeny,
                        &HookContext { key, weight, decision: Some(&decision), error: None },
                    );
                    if self.raise_on_limit {
                        let info = decision.info();
                        Err(RateLimitError::RateLimitExceeded {
                            retry_after: info.retry_after,
                            remaining: info.remaining,
                            limit: info.limit,
                        })
                    } else {
                        Ok(false)
                    }
                }
            }
            Err(err) => {
                self.hooks.run(
                    HookEvent::OnError,
                    &HookContext { key, weight, decision: None, error: Some(&err) },
                );
                Err(err)
            }
        }
    }

    /// Peek at the current state for `key` without recording anything.
    pub async fn check_state(&self, key: &str) -> Result<Decision> {
        Self::check_key(key)?;
        let quota = self.current_quota();
        self.algorithm.check(&self.storage, key, &quota, 1).await
    }

    /// Reset the rate limit state for `key`.
    pub async fn reset(&self, key: &str) -> Result<()> {
        self.algorithm.reset(&self.storage, key).await
    }

    /// The algorithm's configuration name.
    pub fn algorithm_name(&self) -> &'static str {
        self.algorithm.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_rate_limiter_allow_and_deny() {
        let limiter = RateLimiter::new("token_bucket", MemoryStorage::new(), Quota::per_minute(2)).unwrap();

        assert!(limiter.allow("user:1", 1).await.unwrap());
        assert!(limiter.allow("user:1", 1).await.unwrap());
        assert!(!limiter.allow("user:1", 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_rate_limiter_raise_on_limit() {
        let limiter = RateLimiter::new("token_bucket", MemoryStorage::new(), Quota::per_minute(1))
            .unwrap()
            .with_raise_on_limit(true);

        assert!(limiter.allow("user:1", 1).await.unwrap());
        let err = limiter.allow("user:1", 1).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::LimitExceeded);
    }

    #[tokio::test]
    async fn test_rate_limiter_unknown_algorithm() {
        let err = RateLimiter::new("nonexistent", MemoryStorage::new(), Quota::per_minute(1)).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Misconfigured);
    }

    #[tokio::test]
    async fn test_rate_limiter_hooks_fire() {
        let limiter = RateLimiter::new("token_bucket", MemoryStorage::new(), Quota::per_minute(1)).unwrap();
        let allows = Arc::new(AtomicUsize::new(0));
        let denies = Arc::new(AtomicUsize::new(0));

        let allows_clone = allows.clone();
        limiter.hooks().register(HookEvent::OnAllow, move |_| {
            allows_clone.fetch_add(1, Ordering::SeqCst);
        });
        let denies_clone = denies.clone();
        limiter.hooks().register(HookEvent::OnDeny, move |_| {
            denies_clone.fetch_add(1, Ordering::SeqCst);
        });

        limiter.allow("user:1", 1).await.unwrap();
        limiter.allow("user:1", 1).await.unwrap();

        assert_eq!(allows.load(Ordering::SeqCst), 1);
        assert_eq!(denies.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rate_limiter_reconfigure() {
        let limiter = RateLimiter::new("token_bucket", MemoryStorage::new(), Quota::per_minute(1)).unwrap();
        assert!(limiter.allow("user:1", 1).await.unwrap());
        assert!(!limiter.allow("user:1", 1).await.unwrap());

        limiter.reconfigure(Quota::per_minute(10));
        assert!(limiter.allow("user:1", 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_rate_limiter_reset() {
        let limiter = RateLimiter::new("token_bucket", MemoryStorage::new(), Quota::per_minute(1)).unwrap();
        limiter.allow("user:1", 1).await.unwrap();
        assert!(!limiter.allow("user:1", 1).await.unwrap());

        limiter.reset("user:1").await.unwrap();
        assert!(limiter.allow("user:1", 1).await.unwrap());
    }
}
