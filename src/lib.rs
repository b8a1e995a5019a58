//! Advanced, modular rate limiting library for Rust.
//!
//! `ratelimit_core` provides a comprehensive rate limiting decision engine with:
//!
//! - **Five admission algorithms**: GCRA, Token Bucket, Leaky Bucket, Fixed
//!   Window, Sliding Window (per-key timestamp log).
//! - **Two composite limiters**: a three-level hierarchical token bucket and
//!   a weighted fair-queuing limiter.
//! - **Two policy wrappers**: a tiered (per-subscription-class) limiter and
//!   an adaptive (closed-loop) limiter.
//! - **A shared quota pool** for group-scoped budgets with fair-share and
//!   rollover.
//! - **Pluggable storage**: in-memory with GC, Redis with connection
//!   pooling, and a multi-region wrapper with cache/failover.
//! - **A facade** (`RateLimiter`) with enum-dispatched algorithm selection,
//!   a declarative configuration schema, and observer hooks.
//!
//! # Quick Start
//!
//! ```ignore
//! use ratelimit_core::{GCRA, Quota, MemoryStorage, Algorithm};
//!
//! #[tokio::main]
//! async fn main() {
//!     let storage = MemoryStorage::new();
//!     let algorithm = GCRA::new();
//!     let quota = Quota::per_second(10).with_burst(15);
//!
//!     let decision = algorithm.check_and_record(&storage, "user:123", &quota, 1).await.unwrap();
//!
//!     if decision.is_allowed() {
//!         println!("Request allowed! {} remaining", decision.info().remaining);
//!     } else {
//!         println!("Rate limited! Retry after {:?}", decision.info().retry_after);
//!     }
//! }
//! ```
//!
//! # Algorithms
//!
//! | Algorithm | Best For | Memory | Feature Flag |
//! |-----------|----------|--------|--------------|
//! | GCRA | Precise rate control | Low | `gcra` |
//! | Token Bucket | Bursty traffic | Low | default |
//! | Leaky Bucket | Smooth output | Low | `leaky-bucket` |
//! | Sliding Window | Precision critical | High | default |
//! | Fixed Window | Simple use cases | Low | default |
//!
//! # Feature Flags
//!
//! - `memory` (default): In-memory storage with garbage collection
//! - `redis`: Redis storage backend
//! - `gcra`: GCRA algorithm
//! - `leaky-bucket`: Leaky Bucket algorithm
//! - `adaptive`: Adaptive limiter's live CPU/memory signals via `sysinfo`

pub mod adaptive;
pub mod algorithm;
pub mod clock;
pub mod config;
pub mod decision;
pub mod error;
pub mod headers;
pub mod hooks;
pub mod quota;
pub mod quota_pool;
pub mod rate_limiter;
pub mod storage;
pub mod tiered;

// Re-export main types
pub use algorithm::{Algorithm, FairQueuing, HierarchicalLevel, HierarchicalTokenBucket};
pub use clock::{Clock, ManualClock, SystemClock};
pub use decision::{Decision, DecisionMetadata, RateLimitInfo};
pub use error::{ConfigError, ConnectionError, ErrorKind, RateLimitError, Result, StorageError};
pub use headers::RateLimitHeaders;
pub use hooks::{HookContext, HookEvent, HookRegistry};
pub use quota::{Quota, QuotaBuilder};
pub use quota_pool::{QuotaPool, QuotaPoolConfig, SharedQuotaManager};
pub use rate_limiter::{AlgorithmChoice, RateLimiter};
pub use storage::{Storage, StorageEntry};
pub use tiered::{TierConfig, TieredLimiter};

pub use config::{AlgorithmSpec, BackendSpec, RateLimiterConfig, WindowSpec};

pub use adaptive::{AdaptiveLimiter, AdaptiveMetrics, AdaptiveThresholds, FixedSignals, SystemSignals};

#[cfg(feature = "adaptive")]
pub use adaptive::SysinfoSignals;

// Re-export algorithms
pub use algorithm::{FixedWindow, SlidingWindow, TokenBucket};

#[cfg(feature = "gcra")]
pub use algorithm::GCRA;

#[cfg(feature = "leaky-bucket")]
pub use algorithm::LeakyBucket;

// Re-export storage types
#[cfg(feature = "memory")]
pub use storage::{GcConfig, GcInterval, MemoryStorage};

pub use storage::{FailoverPolicy, MultiRegionStorage};

#[cfg(feature = "redis")]
pub use storage::{RedisConfig, RedisStorage};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::algorithm::Algorithm;
    pub use crate::decision::{Decision, RateLimitInfo};
    pub use crate::error::{ErrorKind, RateLimitError, Result};
    pub use crate::quota::Quota;
    pub use crate::rate_limiter::RateLimiter;
    pub use crate::storage::Storage;

    pub use crate::algorithm::{FixedWindow, SlidingWindow, TokenBucket};

    #[cfg(feature = "gcra")]
    pub use crate::algorithm::GCRA;

    #[cfg(feature = "leaky-bucket")]
    pub use crate::algorithm::LeakyBucket;

    #[cfg(feature = "memory")]
    pub use crate::storage::{GcConfig, GcInterval, MemoryStorage};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(feature = "memory")]
    #[tokio::test]
    async fn test_integration_gcra() {
        use crate::prelude::*;

        let storage = MemoryStorage::new();
        let algorithm = GCRA::new();
        let quota = Quota::per_second(10).with_burst(5);

        // Should allow burst
        for i in 1..=5 {
            let decision = algorithm
                .check_and_record(&storage, "user:1", &quota, 1)
                .await
                .unwrap();
            assert!(decision.is_allowed(), "Request {} should be allowed", i);
        }

        // Should deny after burst
        let decision = algorithm
            .check_and_record(&storage, "user:1", &quota, 1)
            .await
            .unwrap();
        assert!(decision.is_denied());
        assert!(decision.info().retry_after.is_some());
    }

    #[cfg(feature = "memory")]
    #[tokio::test]
    async fn test_integration_token_bucket() {
        let storage = MemoryStorage::new();
        let algorithm = TokenBucket::new();
        let quota = Quota::per_minute(60).with_burst(10);

        let decision = algorithm
            .check_and_record(&storage, "user:1", &quota, 1)
            .await
            .unwrap();

        assert!(decision.is_allowed());
        assert_eq!(decision.info().remaining, 9);
        assert_eq!(decision.info().algorithm, Some("token_bucket"));
    }

    #[cfg(feature = "memory")]
    #[tokio::test]
    async fn test_integration_headers() {
        let storage = MemoryStorage::new();
        let algorithm = FixedWindow::new();
        let quota = Quota::per_minute(100);

        let decision = algorithm
            .check_and_record(&storage, "user:1", &quota, 1)
            .await
            .unwrap();

        let headers = decision.info().to_headers();
        assert!(headers.iter().any(|(k, _)| *k == "X-RateLimit-Limit"));
        assert!(headers.iter().any(|(k, _)| *k == "X-RateLimit-Remaining"));
        assert!(headers.iter().any(|(k, _)| *k == "X-RateLimit-Reset"));
    }

    #[cfg(feature = "memory")]
    #[tokio::test]
    async fn test_integration_weighted_request() {
        use crate::prelude::*;

        let storage = MemoryStorage::new();
        let algorithm = TokenBucket::new();
        let quota = Quota::per_minute(60).with_burst(10);

        let decision = algorithm
            .check_and_record(&storage, "user:1", &quota, 4)
            .await
            .unwrap();
        assert!(decision.is_allowed());
        assert_eq!(decision.info().remaining, 6);
    }
}
