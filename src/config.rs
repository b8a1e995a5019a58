//! Declarative configuration schema for building a [`RateLimiter`].
//!
//! This module is a typed schema plus eager validation — parsing a config
//! *file* (YAML/JSON/env) is explicitly out of scope here. Callers that want
//! file-based configuration deserialize into [`RateLimiterConfig`] themselves
//! (it implements `serde::Deserialize`) and then call [`RateLimiterConfig::validate`].

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ConfigError, Result};
use crate::quota::Quota;

const KNOWN_ALGORITHMS: &[&str] = &[
    "token_bucket",
    "leaky_bucket",
    "fixed_window",
    "sliding_window",
    "gcra",
];

/// Backend category names, per the external backend contract: `memory` (the
/// in-process reference implementation), `kv`/`sql`/`document` (remote store
/// categories — `redis` is this crate's concrete `kv` implementation), and
/// `multi_region` (the `MultiRegionStorage` wrapper composing several of the
/// above).
const KNOWN_BACKENDS: &[&str] = &["memory", "redis", "kv", "sql", "document", "multi_region"];

/// A rate-limiting window, either a named unit or a raw second count.
///
/// Deserializes from a JSON number (seconds) or one of the strings
/// `"second"`, `"minute"`, `"hour"`, `"day"`, `"week"` (case-insensitive).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(into = "WindowSpecWire")]
pub enum WindowSpec {
    /// An explicit number of seconds.
    Seconds(u64),
    /// One second.
    Second,
    /// 60 seconds.
    Minute,
    /// 3600 seconds.
    Hour,
    /// 86400 seconds.
    Day,
    /// 604800 seconds.
    Week,
}

impl WindowSpec {
    /// Resolve this window spec to a concrete `Duration`.
    pub fn to_duration(self) -> Duration {
        let secs = match self {
            Self::Seconds(s) => s,
            Self::Second => 1,
            Self::Minute => 60,
            Self::Hour => 3600,
            Self::Day => 86400,
            Self::Week => 604800,
        };
        Duration::from_secs(secs)
    }

    fn from_name(name: &str) -> Result<Self> {
        match name.to_lowercase().as_str() {
            "second" => Ok(Self::Second),
            "minute" => Ok(Self::Minute),
            "hour" => Ok(Self::Hour),
            "day" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            other => Err(ConfigError::InvalidQuota(format!("invalid window: {other}")).into()),
        }
    }
}

#[derive(Serialize)]
#[serde(untagged)]
enum WindowSpecWire {
    Seconds(u64),
    Name(&'static str),
}

impl From<WindowSpec> for WindowSpecWire {
    fn from(spec: WindowSpec) -> Self {
        match spec {
            WindowSpec::Seconds(s) => Self::Seconds(s),
            WindowSpec::Second => Self::Name("second"),
            WindowSpec::Minute => Self::Name("minute"),
            WindowSpec::Hour => Self::Name("hour"),
            WindowSpec::Day => Self::Name("day"),
            WindowSpec::Week => Self::Name("week"),
        }
    }
}

impl<'de> Deserialize<'de> for WindowSpec {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(WindowSpec::Seconds(n)),
            Raw::Text(s) => WindowSpec::from_name(&s).map_err(serde::de::Error::custom),
        }
    }
}

/// Which algorithm to construct, plus any algorithm-specific options.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AlgorithmSpec {
    /// One of `token_bucket`, `leaky_bucket`, `fixed_window`, `sliding_window`, `gcra`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Algorithm-specific tuning knobs, opaque to this schema.
    #[serde(default)]
    pub options: HashMap<String, Value>,
}

impl AlgorithmSpec {
    /// Construct a spec naming a known algorithm with no extra options.
    pub fn new(kind: impl Into<String>) -> Self {
        Self { kind: kind.into(), options: HashMap::new() }
    }

    fn validate(&self) -> Result<()> {
        if KNOWN_ALGORITHMS.contains(&self.kind.as_str()) {
            Ok(())
        } else {
            Err(ConfigError::InvalidAlgorithm(format!("unknown algorithm: {}", self.kind)).into())
        }
    }
}

/// Which storage backend to construct, plus any backend-specific options.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendSpec {
    /// One of `memory`, `redis`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Backend-specific connection options, opaque to this schema.
    #[serde(default)]
    pub options: HashMap<String, Value>,
}

impl BackendSpec {
    /// Construct a spec naming a known backend with no extra options.
    pub fn new(kind: impl Into<String>) -> Self {
        Self { kind: kind.into(), options: HashMap::new() }
    }

    fn validate(&self) -> Result<()> {
        if KNOWN_BACKENDS.contains(&self.kind.as_str()) {
            Ok(())
        } else {
            Err(ConfigError::InvalidStorage(format!("unknown backend: {}", self.kind)).into())
        }
    }
}

/// The full declarative configuration for one rate limiter instance.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimiterConfig {
    /// Algorithm selection.
    pub algorithm: AlgorithmSpec,
    /// Backend selection.
    pub backend: BackendSpec,
    /// Requests allowed per window.
    pub limit: u64,
    /// Window size.
    pub window: WindowSpec,
    /// Whether a denied request should surface as an error.
    #[serde(default)]
    pub raise_on_limit: bool,
}

impl RateLimiterConfig {
    /// Build a minimal config with the given algorithm/backend names.
    pub fn new(algorithm: impl Into<String>, backend: impl Into<String>, limit: u64, window: WindowSpec) -> Self {
        Self {
            algorithm: AlgorithmSpec::new(algorithm),
            backend: BackendSpec::new(backend),
            limit,
            window,
            raise_on_limit: false,
        }
    }

    /// Validate that the algorithm and backend names are known and the limit is non-zero.
    pub fn validate(&self) -> Result<()> {
        self.algorithm.validate()?;
        self.backend.validate()?;
        if self.limit == 0 {
            return Err(ConfigError::InvalidQuota("limit must be greater than 0".into()).into());
        }
        Ok(())
    }

    /// Derive the `Quota` this configuration describes.
    pub fn quota(&self) -> Quota {
        Quota::new(self.limit, self.window.to_duration())
    }
}
