//! Sliding Window (log-based) rate limiting algorithm.
//!
//! Stores the timestamp of every admitted unit of weight within the window,
//! giving exact per-key accuracy at the cost of storing up to `limit`
//! timestamps per key.

use std::sync::Arc;
use std::time::Duration;

use crate::algorithm::{check_weight, timestamp_to_instant, Algorithm};
use crate::clock::{Clock, SystemClock};
use crate::decision::{Decision, RateLimitInfo};
use crate::error::Result;
use crate::quota::Quota;
use crate::storage::{Storage, StorageEntry};

/// Sliding Window rate limiting algorithm (per-key timestamp log).
///
/// Unlike a fixed window, the window continuously slides with the current
/// time: a request is admitted if fewer than `limit` timestamps fall within
/// `[now - window, now]`.
#[derive(Clone)]
pub struct SlidingWindow {
    clock: Arc<dyn Clock>,
}

impl Default for SlidingWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl SlidingWindow {
    /// Create a new Sliding Window algorithm instance.
    pub fn new() -> Self {
        Self {
            clock: Arc::new(SystemClock),
        }
    }

    /// Create a Sliding Window instance driven by a custom clock (for deterministic tests).
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Filter timestamps to only those within the window.
    fn filter_window(&self, timestamps: &[u64], window_start: u64) -> Vec<u64> {
        timestamps.iter().filter(|&&ts| ts >= window_start).copied().collect()
    }
}

impl Algorithm for SlidingWindow {
    fn name(&self) -> &'static str {
        "sliding_window"
    }

    async fn check_and_record<S: Storage>(
        &self,
        storage: &S,
        key: &str,
        quota: &Quota,
        weight: u64,
    ) -> Result<Decision> {
        check_weight(weight)?;
        let now = self.now();
        let window_ms = quota.window().as_millis() as u64;
        let window_start = now.saturating_sub(window_ms);
        let ttl = Duration::from_millis(window_ms * 2);
        let limit = quota.max_requests();

        let decision = storage
            .execute_atomic(key, ttl, |entry| {
                let mut timestamps = entry.and_then(|e| e.timestamps).unwrap_or_default();
                timestamps = self.filter_window(&timestamps, window_start);
                let current_count = timestamps.len() as u64;

                if current_count + weight <= limit {
                    // Record one timestamp per unit of weight so the log
                    // reflects actual consumption, not request count.
                    for _ in 0..weight {
                        timestamps.push(now);
                    }
                    let new_entry = StorageEntry::with_timestamps(timestamps);

                    let remaining = limit - current_count - weight;
                    let reset_at = timestamp_to_instant(now + window_ms);
                    let info = RateLimitInfo::new(limit, remaining, reset_at, timestamp_to_instant(window_start))
                        .with_algorithm("sliding_window");

                    (new_entry, Decision::allowed(info))
                } else {
                    let new_entry = StorageEntry::with_timestamps(timestamps.clone());

                    let oldest = timestamps.first().copied().unwrap_or(now);
                    let retry_ms = (oldest + window_ms).saturating_sub(now);
                    let reset_at = timestamp_to_instant(oldest + window_ms);

                    let info = RateLimitInfo::new(limit, 0, reset_at, timestamp_to_instant(window_start))
                        .with_algorithm("sliding_window")
                        .with_retry_after(Duration::from_millis(retry_ms));

                    (new_entry, Decision::denied(info))
                }
            })
            .await?;

        Ok(decision)
    }

    async fn check<S: Storage>(
        &self,
        storage: &S,
        key: &str,
        quota: &Quota,
        weight: u64,
    ) -> Result<Decision> {
        check_weight(weight)?;
        let now = self.now();
        let window_ms = quota.window().as_millis() as u64;
        let window_start = now.saturating_sub(window_ms);
        let limit = quota.max_requests();

        let entry = storage.get(key).await?;
        let timestamps = entry.and_then(|e| e.timestamps).unwrap_or_default();
        let filtered = self.filter_window(&timestamps, window_start);
        let current_count = filtered.len() as u64;

        let remaining = limit.saturating_sub(current_count);
        let reset_at = if let Some(&oldest) = filtered.first() {
            timestamp_to_instant(oldest + window_ms)
        } else {
            timestamp_to_instant(now + window_ms)
        };

        let info = RateLimitInfo::new(limit, remaining, reset_at, timestamp_to_instant(window_start))
            .with_algorithm("sliding_window");

        Ok(if current_count + weight <= limit {
            Decision::allowed(info)
        } else {
            let oldest = filtered.first().copied().unwrap_or(now);
            let retry_ms = (oldest + window_ms).saturating_sub(now);
            Decision::denied(info.with_retry_after(Duration::from_millis(retry_ms)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[tokio::test]
    async fn test_sliding_window_basic() {
        let algorithm = SlidingWindow::new();
        let storage = MemoryStorage::new();
        let quota = Quota::per_minute(5);

        for i in 1..=5 {
            let decision = algorithm.check_and_record(&storage, "user:1", &quota, 1).await.unwrap();
            assert!(decision.is_allowed(), "Request {} should be allowed", i);
        }

        let decision = algorithm.check_and_record(&storage, "user:1", &quota, 1).await.unwrap();
        assert!(decision.is_denied());
    }

    #[tokio::test]
    async fn test_sliding_window_precision() {
        let algorithm = SlidingWindow::new();
        let storage = MemoryStorage::new();
        // 2 requests per 200ms
        let quota = Quota::new(2, Duration::from_millis(200));

        algorithm.check_and_record(&storage, "user:1", &quota, 1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        algorithm.check_and_record(&storage, "user:1", &quota, 1).await.unwrap();

        let decision = algorithm.check_and_record(&storage, "user:1", &quota, 1).await.unwrap();
        assert!(decision.is_denied());

        tokio::time::sleep(Duration::from_millis(200)).await;

        let decision = algorithm.check_and_record(&storage, "user:1", &quota, 1).await.unwrap();
        assert!(decision.is_allowed());
    }

    #[tokio::test]
    async fn test_sliding_window_weighted() {
        let algorithm = SlidingWindow::new();
        let storage = MemoryStorage::new();
        let quota = Quota::per_minute(5);

        let decision = algorithm.check_and_record(&storage, "user:1", &quota, 3).await.unwrap();
        assert!(decision.is_allowed());
        assert_eq!(decision.info().remaining, 2);

        let decision = algorithm.check_and_record(&storage, "user:1", &quota, 3).await.unwrap();
        assert!(decision.is_denied());
    }
}
