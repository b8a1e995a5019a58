//! Redis storage backend for distributed rate limiting.
//!
//! Uses connection pooling for high performance.

use std::time::Duration;

use deadpool_redis::{
    redis::{cmd, AsyncCommands, Script},
    Config, Connection, Pool, Runtime,
};

use crate::error::{ConnectionError, Result, StorageError};
use crate::storage::{Storage, StorageEntry};

/// Atomically replace the value at `KEYS[1]` with `ARGV[3]` iff its current
/// raw value matches the expectation encoded by `ARGV[1]`/`ARGV[2]`
/// (`ARGV[1] == "1"` means "must equal `ARGV[2]`", `"0"` means "must be
/// absent"). Runs as a single Redis command, so the read-compare-write is
/// race-free regardless of how many clients contend for the key.
const COMPARE_AND_SET_SCRIPT: &str = r#"
local cur = redis.call('GET', KEYS[1])
local expected_exists = ARGV[1]
local expected_json = ARGV[2]
local new_json = ARGV[3]
local ttl = tonumber(ARGV[4])
if expected_exists == '1' then
    if cur == false or cur ~= expected_json then
        return 0
    end
else
    if cur ~= false then
        return 0
    end
end
if ttl > 0 then
    redis.call('SET', KEYS[1], new_json, 'EX', ttl)
else
    redis.call('SET', KEYS[1], new_json)
end
return 1
"#;

/// Redis storage configuration.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis connection URL (e.g., "redis://localhost:6379")
    pub url: String,
    /// Connection pool size
    pub pool_size: usize,
    /// Key prefix for rate limit keys
    pub key_prefix: String,
    /// Connection timeout
    pub connection_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 10,
            key_prefix: "rl:".to_string(),
            connection_timeout: Duration::from_secs(5),
        }
    }
}

impl RedisConfig {
    /// Create a new Redis configuration.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the key prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set the pool size.
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }
}

/// Redis storage backend for distributed rate limiting.
///
/// Uses connection pooling for high performance.
///
/// # Example
///
/// ```ignore
/// use ratelimit_core::storage::{RedisStorage, RedisConfig};
///
/// let config = RedisConfig::new("redis://localhost:6379")
///     .with_prefix("myapp:rl:")
///     .with_pool_size(20);
///
/// let storage = RedisStorage::new(config).await?;
/// ```
pub struct RedisStorage {
    pool: Pool,
    key_prefix: String,
}

impl std::fmt::Debug for RedisStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStorage")
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

impl RedisStorage {
    /// Create a new Redis storage from configuration.
    pub async fn new(config: RedisConfig) -> Result<Self> {
        let cfg = Config::from_url(&config.url);
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| ConnectionError::ConnectionFailed(e.to_string()))?;

        // Test connection
        let mut conn = pool
            .get()
            .await
            .map_err(|e| ConnectionError::ConnectionFailed(e.to_string()))?;
        let _: () = cmd("PING")
            .query_async(&mut *conn)
            .await
            .map_err(|e| ConnectionError::ConnectionFailed(e.to_string()))?;

        Ok(Self {
            pool,
            key_prefix: config.key_prefix,
        })
    }

    /// Create a new Redis storage from a URL.
    pub async fn from_url(url: impl Into<String>) -> Result<Self> {
        Self::new(RedisConfig::new(url)).await
    }

    /// Get the full key with prefix.
    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    /// Get a connection from the pool.
    async fn get_conn(&self) -> Result<Connection> {
        self.pool
            .get()
            .await
            .map_err(|_| StorageError::PoolExhausted.into())
    }

    /// Atomic compare-and-set of the raw JSON blob behind `full_key`.
    ///
    /// `expected_json = None` asserts the key is currently absent.
    async fn cas_raw(
        &self,
        conn: &mut Connection,
        full_key: &str,
        expected_json: Option<&str>,
        new_json: &str,
        ttl_secs: u64,
    ) -> Result<bool> {
        let (exists_flag, expected_arg) = match expected_json {
            Some(json) => ("1", json),
            None => ("0", ""),
        };

        let swapped: i64 = Script::new(COMPARE_AND_SET_SCRIPT)
            .key(full_key)
            .arg(exists_flag)
            .arg(expected_arg)
            .arg(new_json)
            .arg(ttl_secs)
            .invoke_async(conn)
            .await
            .map_err(|e| StorageError::operation_failed(e.to_string(), true))?;

        Ok(swapped == 1)
    }
}

impl Storage for RedisStorage {
    async fn get(&self, key: &str) -> Result<Option<StorageEntry>> {
        let mut conn = self.get_conn().await?;
        let full_key = self.full_key(key);

        let result: Option<String> = conn
            .get(&full_key)
            .await
            .map_err(|e| StorageError::operation_failed(e.to_string(), true))?;

        match result {
            Some(json) => {
                let entry: StorageEntry = serde_json::from_str(&json)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, entry: StorageEntry, ttl: Duration) -> Result<()> {
        let mut conn = self.get_conn().await?;
        let full_key = self.full_key(key);
        let ttl_secs = ttl.as_secs();

        let json = serde_json::to_string(&entry)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        conn.set_ex::<_, _, ()>(&full_key, json, ttl_secs)
            .await
            .map_err(|e| StorageError::operation_failed(e.to_string(), true))?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.get_conn().await?;
        let full_key = self.full_key(key);

        conn.del::<_, ()>(&full_key)
            .await
            .map_err(|e| StorageError::operation_failed(e.to_string(), true))?;

        Ok(())
    }

    async fn increment(
        &self,
        key: &str,
        delta: u64,
        window_start: u64,
        ttl: Duration,
    ) -> Result<u64> {
        let full_key = self.full_key(key);
        let ttl_secs = ttl.as_secs();

        // The new count only depends on the current entry, so a lost race
        // (another client's SET winning between our GET and our CAS) can be
        // safely retried with a fresh read rather than surfaced as an error.
        for _ in 0..5 {
            let mut conn = self.get_conn().await?;

            let current_json: Option<String> = conn
                .get(&full_key)
                .await
                .map_err(|e| StorageError::operation_failed(e.to_string(), true))?;

            let new_count = match &current_json {
                Some(json) => match serde_json::from_str::<StorageEntry>(json) {
                    Ok(entry) if entry.window_start == window_start => entry.count + delta,
                    _ => delta,
                },
                None => delta,
            };

            let new_entry = StorageEntry {
                count: new_count,
                window_start,
                last_update: crate::storage::current_timestamp_ms(),
                ..Default::default()
            };
            let new_json = serde_json::to_string(&new_entry)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;

            if self
                .cas_raw(&mut conn, &full_key, current_json.as_deref(), &new_json, ttl_secs)
                .await?
            {
                return Ok(new_count);
            }
        }

        Err(StorageError::AtomicConflict.into())
    }

    async fn execute_atomic<F, T>(&self, key: &str, ttl: Duration, operation: F) -> Result<T>
    where
        F: FnOnce(Option<StorageEntry>) -> (StorageEntry, T) + Send,
        T: Send,
    {
        let mut conn = self.get_conn().await?;
        let full_key = self.full_key(key);
        let ttl_secs = ttl.as_secs();

        let current_json: Option<String> = conn
            .get(&full_key)
            .await
            .map_err(|e| StorageError::operation_failed(e.to_string(), true))?;

        let current_entry = match &current_json {
            Some(json) => Some(
                serde_json::from_str(json).map_err(|e| StorageError::Serialization(e.to_string()))?,
            ),
            None => None,
        };

        // `operation` is FnOnce: unlike `increment`, we can't recompute it
        // against a fresh read if a concurrent writer beats us to the CAS.
        // A lost race is surfaced as `AtomicConflict` (retryable) instead of
        // silently discarding whichever update loses, which is what the
        // previous GET-then-SET implementation did.
        let (new_entry, result) = operation(current_entry);

        let new_json = serde_json::to_string(&new_entry)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let swapped = self
            .cas_raw(&mut conn, &full_key, current_json.as_deref(), &new_json, ttl_secs)
            .await?;

        if swapped {
            Ok(result)
        } else {
            Err(StorageError::AtomicConflict.into())
        }
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&StorageEntry>,
        new: StorageEntry,
        ttl: Duration,
    ) -> Result<bool> {
        let mut conn = self.get_conn().await?;
        let full_key = self.full_key(key);
        let ttl_secs = ttl.as_secs();

        let expected_json = expected
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let new_json =
            serde_json::to_string(&new).map_err(|e| StorageError::Serialization(e.to_string()))?;

        self.cas_raw(&mut conn, &full_key, expected_json.as_deref(), &new_json, ttl_secs)
            .await
    }
}
