//! Fair Queuing: weighted equal-share admission under a global ceiling.
//!
//! A shared pool of `total_capacity` requests per window is divided evenly
//! among currently-active keys. Each key's fair share shrinks as more keys
//! become active and grows as they go idle, so no single key can starve the
//! others even without static per-key quotas.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::algorithm::{check_weight, timestamp_to_instant, Algorithm};
use crate::clock::{Clock, SystemClock};
use crate::decision::{Decision, DecisionMetadata, RateLimitInfo};
use crate::error::Result;
use crate::quota::Quota;
use crate::storage::{Storage, StorageEntry};

/// Fair Queuing rate limiter.
///
/// `quota` sets the total capacity and window shared by all keys; each
/// admission recomputes `fair_share = total_capacity / active_keys` and
/// admits a key only while its own usage is under that share.
#[derive(Clone)]
pub struct FairQueuing {
    clock: Arc<dyn Clock>,
    /// Keys seen within the current window, used to size the fair share.
    active_keys: Arc<Mutex<HashMap<String, u64>>>,
}

impl Default for FairQueuing {
    fn default() -> Self {
        Self::new()
    }
}

impl FairQueuing {
    /// Create a new Fair Queuing algorithm instance.
    pub fn new() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            active_keys: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Create a Fair Queuing instance driven by a custom clock (for deterministic tests).
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            active_keys: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    fn filter_window(timestamps: &[u64], window_start: u64) -> Vec<u64> {
        timestamps.iter().filter(|&&ts| ts >= window_start).copied().collect()
    }

    /// Drop keys that haven't been seen within the current window and report
    /// the number of keys still considered active (including `key` itself).
    fn touch_active(&self, key: &str, now: u64, window_ms: u64) -> u64 {
        let mut active_keys = self.active_keys.lock();
        active_keys.insert(key.to_string(), now);
        let window_start = now.saturating_sub(window_ms);
        active_keys.retain(|_, last_seen| *last_seen >= window_start);
        active_keys.len().max(1) as u64
    }
}

impl Algorithm for FairQueuing {
    fn name(&self) -> &'static str {
        "fair_queuing"
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
        let total_capacity = quota.max_requests();

        let active_keys = self.touch_active(key, now, window_ms);
        let fair_share = (total_capacity / active_keys).max(1);

        let decision = storage
            .execute_atomic(key, ttl, |entry| {
                let mut timestamps = entry.and_then(|e| e.timestamps).unwrap_or_default();
                timestamps = Self::filter_window(&timestamps, window_start);
                let current_count = timestamps.len() as u64;

                let metadata = DecisionMetadata::new()
                    .with_extra("fair_share", fair_share)
                    .with_extra("active_keys", active_keys)
                    .with_extra("total_capacity", total_capacity);

                if current_count + weight <= fair_share {
                    for _ in 0..weight {
                        timestamps.push(now);
                    }
                    let new_entry = StorageEntry::with_timestamps(timestamps);

                    let remaining = fair_share - current_count - weight;
                    let reset_at = timestamp_to_instant(now + window_ms);
                    let info = RateLimitInfo::new(fair_share, remaining, reset_at, timestamp_to_instant(window_start))
                        .with_algorithm("fair_queuing")
                        .with_metadata(metadata);

                    (new_entry, Decision::allowed(info))
                } else {
                    let new_entry = StorageEntry::with_timestamps(timestamps.clone());

                    let oldest = timestamps.first().copied().unwrap_or(now);
                    let retry_ms = (oldest + window_ms).saturating_sub(now);
                    let reset_at = timestamp_to_instant(oldest + window_ms);

                    let info = RateLimitInfo::new(fair_share, 0, reset_at, timestamp_to_instant(window_start))
                        .with_algorithm("fair_queuing")
                        .with_retry_after(Duration::from_millis(retry_ms))
                        .with_metadata(metadata);

                    (new_entry, Decision::denied(info))
                }
            })
            .await?;

        Ok(decision)
    }

    /// Check without recording (peek at current state), using the fair share
    /// as of the last `check_and_record` call for this key.
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
        let total_capacity = quota.max_requests();

        let active_keys = self.active_keys.lock().len().max(1) as u64;
        let fair_share = (total_capacity / active_keys).max(1);

        let entry = storage.get(key).await?;
        let timestamps = entry.and_then(|e| e.timestamps).unwrap_or_default();
        let filtered = Self::filter_window(&timestamps, window_start);
        let current_count = filtered.len() as u64;

        let remaining = fair_share.saturating_sub(current_count);
        let reset_at = if let Some(&oldest) = filtered.first() {
            timestamp_to_instant(oldest + window_ms)
        } else {
            timestamp_to_instant(now + window_ms)
        };

        let metadata = DecisionMetadata::new()
            .with_extra("fair_share", fair_share)
            .with_extra("active_keys", active_keys);

        let info = RateLimitInfo::new(fair_share, remaining, reset_at, timestamp_to_instant(window_start))
            .with_algorithm("fair_queuing")
            .with_metadata(metadata);

        Ok(if current_count + weight <= fair_share {
            Decision::allowed(info)
        } else {
            let oldest = filtered.first().copied().unwrap_or(now);
            let retry_ms = (oldest + window_ms).saturating_sub(now);
            Decision::denied(info.with_retry_after(Duration::from_millis(retry_ms)))
        })
    }

    /// Reset the rate limit for a key, also dropping it from the active-key registry.
    async fn reset<S: Storage>(&self, storage: &S, key: &str) -> Result<()> {
        self.active_keys.lock().remove(key);
        storage.delete(key).await
    }
}
