//! Multi-region storage composition with local caching and failover.
//!
//! [`MultiRegionStorage`] wraps a set of named regional backends plus a
//! coordinator backend behind the single [`Storage`] interface, so any
//! algorithm can use it as a drop-in backend without knowing it spans
//! multiple regions. Reads and writes are always routed to one region (the
//! caller-selected one, or the configured primary); when that region errors,
//! [`FailoverPolicy`] decides whether to fall back to a locally cached copy
//! of the entry, deny the operation outright, or fail open.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigError, Result};
use crate::storage::{Storage, StorageEntry};

/// What to do when the selected region is unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverPolicy {
    /// Serve the last known-good entry from the local cache, if still fresh.
    LocalCache,
    /// Propagate the region's error; the caller sees the request denied.
    Deny,
    /// Treat the key as if it had no prior state, letting the request through.
    Allow,
}

struct CachedEntry {
    entry: StorageEntry,
    cached_at_ms: u64,
}

struct Inner<R: Storage> {
    regions: HashMap<String, R>,
    primary_region: String,
    cache: Mutex<HashMap<String, CachedEntry>>,
}

/// Storage backend that fronts several named regional backends with a local
/// cache and an explicit failover policy.
///
/// All regions must share the same concrete `Storage` implementation `R`
/// (e.g. all `RedisStorage`, pointed at different clusters). A coordinator
/// backend `C` is kept alongside for bookkeeping (e.g. cross-region
/// reconciliation) but is not consulted on the hot path.
pub struct MultiRegionStorage<R: Storage, C: Storage> {
    inner: Arc<Inner<R>>,
    coordinator: C,
    clock: Arc<dyn Clock>,
    cache_ttl: Duration,
    max_cache_size: usize,
    failover_policy: FailoverPolicy,
}

impl<R: Storage, C: Storage> MultiRegionStorage<R, C> {
    /// Build a multi-region storage from named regions, a coordinator, and a
    /// failover policy. `primary_region` must be a key of `regions`.
    pub fn new(
        regions: HashMap<String, R>,
        primary_region: impl Into<String>,
        coordinator: C,
        failover_policy: FailoverPolicy,
    ) -> Result<Self> {
        Self::with_clock(
            regions,
            primary_region,
            coordinator,
            failover_policy,
            Arc::new(SystemClock::new()),
        )
    }

    /// Same as [`Self::new`] but with an explicit clock, for tests.
    pub fn with_clock(
        regions: HashMap<String, R>,
        primary_region: impl Into<String>,
        coordinator: C,
        failover_policy: FailoverPolicy,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        if regions.is_empty() {
            return Err(ConfigError::MissingRequired("at least one region".into()).into());
        }
        let primary_region = primary_region.into();
        if !regions.contains_key(&primary_region) {
            return Err(ConfigError::NotFound(format!("region: {primary_region}")).into());
        }
        Ok(Self {
            inner: Arc::new(Inner {
                regions,
                primary_region,
                cache: Mutex::new(HashMap::new()),
            }),
            coordinator,
            clock,
            cache_ttl: Duration::from_secs(30),
            max_cache_size: 10_000,
            failover_policy,
        })
    }

    /// Override the local cache TTL (default 30s).
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Override the local cache's maximum entry count (default 10,000).
    pub fn with_max_cache_size(mut self, max_cache_size: usize) -> Self {
        self.max_cache_size = max_cache_size;
        self
    }

    /// Names of all configured regions.
    pub fn regions(&self) -> Vec<&str> {
        self.inner.regions.keys().map(String::as_str).collect()
    }

    fn region(&self) -> &R {
        self.inner
            .regions
            .get(&self.inner.primary_region)
            .expect("primary_region invariant checked at construction")
    }

    fn cached(&self, key: &str) -> Option<StorageEntry> {
        let cache = self.inner.cache.lock();
        let cached = cache.get(key)?;
        let now = self.clock.now_ms();
        if now.saturating_sub(cached.cached_at_ms) > self.cache_ttl.as_millis() as u64 {
            return None;
        }
        Some(cached.entry.clone())
    }

    fn update_cache(&self, key: &str, entry: StorageEntry) {
        let mut cache = self.inner.cache.lock();
        if cache.len() >= self.max_cache_size && !cache.contains_key(key) {
            let evict_count = (self.max_cache_size / 10).max(1);
            let mut by_age: Vec<(String, u64)> = cache
                .iter()
                .map(|(k, v)| (k.clone(), v.cached_at_ms))
                .collect();
            by_age.sort_by_key(|(_, ts)| *ts);
            for (stale_key, _) in by_age.into_iter().take(evict_count) {
                cache.remove(&stale_key);
            }
        }
        cache.insert(
            key.to_string(),
            CachedEntry {
                entry,
                cached_at_ms: self.clock.now_ms(),
            },
        );
    }

    /// Drop every cached entry.
    pub fn clear_cache(&self) {
        self.inner.cache.lock().clear();
    }

    /// Number of entries currently cached locally.
    pub fn cache_size(&self) -> usize {
        self.inner.cache.lock().len()
    }

    /// Reset all regional backends, the coordinator, and the local cache for
    /// `key`. Per-backend failures are logged and otherwise ignored so a
    /// single unreachable region doesn't block resetting the others.
    pub async fn reset(&self, key: &str) {
        self.clear_cache();
        for (name, region) in &self.inner.regions {
            if let Err(err) = region.delete(key).await {
                tracing::warn!(region = name, error = %err, "failed to reset region during multi-region reset");
            }
        }
        if let Err(err) = self.coordinator.delete(key).await {
            tracing::warn!(error = %err, "failed to reset coordinator during multi-region reset");
        }
    }
}

impl<R: Storage, C: Storage> Storage for MultiRegionStorage<R, C> {
    async fn get(&self, key: &str) -> Result<Option<StorageEntry>> {
        match self.region().get(key).await {
            Ok(Some(entry)) => {
                self.update_cache(key, entry.clone());
                Ok(Some(entry))
            }
            Ok(None) => Ok(None),
            Err(err) => match self.failover_policy {
                FailoverPolicy::LocalCache => Ok(self.cached(key)),
                FailoverPolicy::Allow => Ok(None),
                FailoverPolicy::Deny => Err(err),
            },
        }
    }

    async fn set(&self, key: &str, entry: StorageEntry, ttl: Duration) -> Result<()> {
        match self.region().set(key, entry.clone(), ttl).await {
            Ok(()) => {
                self.update_cache(key, entry);
                Ok(())
            }
            Err(err) => match self.failover_policy {
                FailoverPolicy::LocalCache | FailoverPolicy::Allow => {
                    self.update_cache(key, entry);
                    Ok(())
                }
                FailoverPolicy::Deny => Err(err),
            },
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.cache.lock().remove(key);
        match self.region().delete(key).await {
            Ok(()) => Ok(()),
            Err(err) => match self.failover_policy {
                FailoverPolicy::LocalCache | FailoverPolicy::Allow => Ok(()),
                FailoverPolicy::Deny => Err(err),
            },
        }
    }

    async fn increment(&self, key: &str, delta: u64, window_start: u64, ttl: Duration) -> Result<u64> {
        match self.region().increment(key, delta, window_start, ttl).await {
            Ok(count) => {
                let entry = StorageEntry::new(count, window_start);
                self.update_cache(key, entry);
                Ok(count)
            }
            Err(err) => match self.failover_policy {
                FailoverPolicy::Deny => Err(err),
                FailoverPolicy::LocalCache => {
                    let count = self.cached(key).map(|e| e.count).unwrap_or(0) + delta;
                    self.update_cache(key, StorageEntry::new(count, window_start));
                    Ok(count)
                }
                FailoverPolicy::Allow => {
                    self.update_cache(key, StorageEntry::new(delta, window_start));
                    Ok(delta)
                }
            },
        }
    }

    // `operation` is consumed by the primary region's attempt, so a failed
    // attempt can't be retried locally against the cache: there is no value
    // to hand back once the region has taken (and likely dropped) the
    // closure. All three policies therefore propagate the error here; the
    // distinction between them only matters for `get`/`set`/`delete`, where
    // this backend holds the entry itself.
    async fn execute_atomic<F, T>(&self, key: &str, ttl: Duration, operation: F) -> Result<T>
    where
        F: FnOnce(Option<StorageEntry>) -> (StorageEntry, T) + Send,
        T: Send,
    {
        match self.region().execute_atomic(key, ttl, operation).await {
            Ok(result) => Ok(result),
            Err(err) => {
                tracing::warn!(key, error = %err, policy = ?self.failover_policy, "region unreachable during atomic operation");
                Err(err)
            }
        }
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&StorageEntry>,
        new: StorageEntry,
        ttl: Duration,
    ) -> Result<bool> {
        match self.region().compare_and_swap(key, expected, new.clone(), ttl).await {
            Ok(swapped) => {
                if swapped {
                    self.update_cache(key, new);
                }
                Ok(swapped)
            }
            Err(err) => match self.failover_policy {
                FailoverPolicy::Deny => Err(err),
                FailoverPolicy::LocalCache | FailoverPolicy::Allow => {
                    self.update_cache(key, new);
                    Ok(true)
                }
            },
        }
    }
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn regions(names: &[&str]) -> HashMap<String, MemoryStorage> {
        names
            .iter()
            .map(|name| (name.to_string(), MemoryStorage::new()))
            .collect()
    }

    #[test]
    fn test_rejects_empty_regions() {
        let result = MultiRegionStorage::new(
            HashMap::<String, MemoryStorage>::new(),
            "us-east",
            MemoryStorage::new(),
            FailoverPolicy::Deny,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_unknown_primary() {
        let result = MultiRegionStorage::new(
            regions(&["us-east"]),
            "us-west",
            MemoryStorage::new(),
            FailoverPolicy::Deny,
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_set_then_get_roundtrips_through_primary_region() {
        let storage = MultiRegionStorage::new(
            regions(&["us-east", "us-west"]),
            "us-east",
            MemoryStorage::new(),
            FailoverPolicy::Deny,
        )
        .unwrap();

        let entry = StorageEntry::new(5, 1000);
        storage.set("k", entry.clone(), Duration::from_secs(60)).await.unwrap();
        let got = storage.get("k").await.unwrap().unwrap();
        assert_eq!(got.count, 5);
    }

    #[tokio::test]
    async fn test_get_populates_cache() {
        let storage = MultiRegionStorage::new(
            regions(&["us-east"]),
            "us-east",
            MemoryStorage::new(),
            FailoverPolicy::LocalCache,
        )
        .unwrap();

        storage
            .set("k", StorageEntry::new(3, 1000), Duration::from_secs(60))
            .await
            .unwrap();
        storage.get("k").await.unwrap();
        assert_eq!(storage.cache_size(), 1);
    }

    #[tokio::test]
    async fn test_clear_cache() {
        let storage = MultiRegionStorage::new(
            regions(&["us-east"]),
            "us-east",
            MemoryStorage::new(),
            FailoverPolicy::LocalCache,
        )
        .unwrap();
        storage
            .set("k", StorageEntry::new(1, 0), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(storage.cache_size(), 1);
        storage.clear_cache();
        assert_eq!(storage.cache_size(), 0);
    }

    #[tokio::test]
    async fn test_reset_clears_cache_and_regions() {
        let storage = MultiRegionStorage::new(
            regions(&["us-east", "us-west"]),
            "us-east",
            MemoryStorage::new(),
            FailoverPolicy::LocalCache,
        )
        .unwrap();
        storage
            .set("k", StorageEntry::new(1, 0), Duration::from_secs(60))
            .await
            .unwrap();
        storage.reset("k").await;
        assert_eq!(storage.cache_size(), 0);
        assert!(storage.get("k").await.unwrap().is_none());
    }
}
