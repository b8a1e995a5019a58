//! Rate limiting algorithm trait and implementations.
//!
//! This module defines the `Algorithm` trait and provides implementations
//! for various rate limiting algorithms.
//!
//! # Available Algorithms
//!
//! - **GCRA** (`gcra` feature): Generic Cell Rate Algorithm - precise, low memory
//! - **Token Bucket** (default): Controlled bursts with refilling tokens
//! - **Leaky Bucket** (`leaky-bucket` feature): Smooth constant output rate
//! - **Sliding Window** (default): Per-key request log, highest accuracy
//! - **Fixed Window** (default): Simple counter per time window
//! - **Hierarchical Token Bucket**: chained global/tenant/user buckets
//! - **Fair Queuing**: equal-share admission under a global ceiling

#[cfg(feature = "gcra")]
mod gcra;
#[cfg(feature = "leaky-bucket")]
mod leaky_bucket;
mod fair_queuing;
mod fixed_window;
mod hierarchical;
mod sliding_window;
mod token_bucket;

#[cfg(feature = "gcra")]
pub use gcra::GCRA;
#[cfg(feature = "leaky-bucket")]
pub use leaky_bucket::LeakyBucket;
pub use fair_queuing::FairQueuing;
pub use fixed_window::FixedWindow;
pub use hierarchical::{HierarchicalLevel, HierarchicalTokenBucket};
pub use sliding_window::SlidingWindow;
pub use token_bucket::TokenBucket;

use std::future::Future;

use crate::decision::Decision;
use crate::error::{RateLimitError, Result};
use crate::quota::Quota;
use crate::storage::Storage;

/// Rate limiting algorithm trait.
///
/// Each algorithm provides different trade-offs between accuracy, memory usage,
/// and burst handling. All implementations must be thread-safe.
///
/// # Algorithm Comparison
///
/// | Algorithm | Accuracy | Memory | Burst | Best For |
/// |-----------|----------|--------|-------|----------|
/// | GCRA | Highest | Low (1 timestamp) | Controlled | Precise rate control |
/// | Token Bucket | High | Low | Excellent | Bursty traffic |
/// | Leaky Bucket | High | Medium | None | Smooth output |
/// | Sliding Window | Highest | High | Good | Precision critical |
/// | Fixed Window | Low | Low | Poor | Simple use cases |
pub trait Algorithm: Send + Sync + 'static {
    /// Get the algorithm name (for logging/metrics).
    fn name(&self) -> &'static str;

    /// Check if a request of the given weight is allowed AND record it
    /// atomically.
    ///
    /// `weight` lets a single call represent more than one unit of work
    /// (e.g. a batch request consuming 5 tokens at once). A weight of 0 is
    /// rejected with `RateLimitError::InvalidArgument`.
    fn check_and_record<S: Storage>(
        &self,
        storage: &S,
        key: &str,
        quota: &Quota,
        weight: u64,
    ) -> impl Future<Output = Result<Decision>> + Send;

    /// Check without recording (peek at current state).
    ///
    /// Useful for displaying rate limit info without consuming quota.
    fn check<S: Storage>(
        &self,
        storage: &S,
        key: &str,
        quota: &Quota,
        weight: u64,
    ) -> impl Future<Output = Result<Decision>> + Send;

    /// Reset the rate limit for a key.
    fn reset<S: Storage>(&self, storage: &S, key: &str) -> impl Future<Output = Result<()>> + Send {
        async move { storage.delete(key).await }
    }
}

/// Validate a caller-supplied weight; every algorithm calls this first.
pub(crate) fn check_weight(weight: u64) -> Result<()> {
    if weight == 0 {
        return Err(RateLimitError::InvalidArgument(
            "weight must be greater than 0".into(),
        ));
    }
    Ok(())
}

pub(crate) use crate::clock::timestamp_to_instant;
