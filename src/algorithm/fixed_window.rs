//! Fixed Window rate limiting algorithm.
//!
//! Counts requests in discrete, non-overlapping windows aligned to
//! `window_seconds` boundaries. Simple and cheap, but allows up to `2 * limit`
//! requests to land around a window boundary (the classic fixed-window burst).

use std::sync::Arc;
use std::time::Duration;

use crate::algorithm::{check_weight, timestamp_to_instant, Algorithm};
use crate::clock::{Clock, SystemClock};
use crate::decision::{Decision, DecisionMetadata, RateLimitInfo};
use crate::error::Result;
use crate::quota::Quota;
use crate::storage::{Storage, StorageEntry};

/// Fixed Window rate limiting algorithm.
///
/// Counts requests within a window that resets at fixed intervals, aligned
/// to multiples of the window size since the Unix epoch.
#[derive(Clone)]
pub struct FixedWindow {
    clock: Arc<dyn Clock>,
}

impl Default for FixedWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl FixedWindow {
    /// Create a new Fixed Window algorithm instance.
    pub fn new() -> Self {
        Self {
            clock: Arc::new(SystemClock),
        }
    }

    /// Create a Fixed Window instance driven by a custom clock (for deterministic tests).
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Align `now` to the start of its window.
    fn window_start(&self, now: u64, window_ms: u64) -> u64 {
        (now / window_ms) * window_ms
    }
}

impl Algorithm for FixedWindow {
    fn name(&self) -> &'static str {
        "fixed_window"
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
        let window_start = self.window_start(now, window_ms);
        let ttl = Duration::from_millis(window_ms * 2);
        let limit = quota.max_requests();

        let decision = storage
            .execute_atomic(key, ttl, |entry| {
                // Reset the counter when we've rolled into a new window.
                let current_count = match &entry {
                    Some(e) if e.window_start == window_start => e.count,
                    _ => 0,
                };

                if current_count + weight <= limit {
                    let new_count = current_count + weight;
                    let new_entry = StorageEntry::new(new_count, window_start).set_last_update(now);

                    let remaining = limit - new_count;
                    let reset_at = timestamp_to_instant(window_start + window_ms);
                    let info = RateLimitInfo::new(limit, remaining, reset_at, timestamp_to_instant(window_start))
                        .with_algorithm("fixed_window")
                        .with_metadata(DecisionMetadata::new().with_extra("current_count", new_count));

                    (new_entry, Decision::allowed(info))
                } else {
                    let new_entry = StorageEntry::new(current_count, window_start).set_last_update(now);

                    let retry_ms = (window_start + window_ms).saturating_sub(now);
                    let reset_at = timestamp_to_instant(window_start + window_ms);
                    let info = RateLimitInfo::new(limit, 0, reset_at, timestamp_to_instant(window_start))
                        .with_algorithm("fixed_window")
                        .with_retry_after(Duration::from_millis(retry_ms))
                        .with_metadata(DecisionMetadata::new().with_extra("current_count", current_count));

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
        let window_start = self.window_start(now, window_ms);
        let limit = quota.max_requests();

        let entry = storage.get(key).await?;
        let current_count = match &entry {
            Some(e) if e.window_start == window_start => e.count,
            _ => 0,
        };

        let remaining = limit.saturating_sub(current_count);
        let reset_at = timestamp_to_instant(window_start + window_ms);
        let info = RateLimitInfo::new(limit, remaining, reset_at, timestamp_to_instant(window_start))
            .with_algorithm("fixed_window");

        Ok(if current_count + weight <= limit {
            Decision::allowed(info)
        } else {
            let retry_ms = (window_start + window_ms).saturating_sub(now);
            Decision::denied(info.with_retry_after(Duration::from_millis(retry_ms)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryStorage;

    #[tokio::test]
    async fn test_fixed_window_basic() {
        let algorithm = FixedWindow::new();
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
    async fn test_fixed_window_resets_on_boundary() {
        let clock = Arc::new(ManualClock::new(0));
        let algorithm = FixedWindow::with_clock(clock.clone());
        let storage = MemoryStorage::new();
        let quota = Quota::new(2, Duration::from_secs(60));

        algorithm.check_and_record(&storage, "user:1", &quota, 1).await.unwrap();
        algorithm.check_and_record(&storage, "user:1", &quota, 1).await.unwrap();
        let decision = algorithm.check_and_record(&storage, "user:1", &quota, 1).await.unwrap();
        assert!(decision.is_denied());

        clock.advance(60_000);

        let decision = algorithm.check_and_record(&storage, "user:1", &quota, 1).await.unwrap();
        assert!(decision.is_allowed());
    }

    #[tokio::test]
    async fn test_fixed_window_weighted() {
        let algorithm = FixedWindow::new();
        let storage = MemoryStorage::new();
        let quota = Quota::per_minute(10);

        let decision = algorithm.check_and_record(&storage, "user:1", &quota, 7).await.unwrap();
        assert!(decision.is_allowed());

        let decision = algorithm.check_and_record(&storage, "user:1", &quota, 4).await.unwrap();
        assert!(decision.is_denied());

        let decision = algorithm.check_and_record(&storage, "user:1", &quota, 3).await.unwrap();
        assert!(decision.is_allowed());
    }
}
