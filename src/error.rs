//! Error types for rate limiting operations.
//!
//! This module provides a comprehensive error hierarchy for all rate limiting
//! operations, including storage errors, configuration errors, and key extraction errors.

use std::time::Duration;
use thiserror::Error;

/// Result type for rate limiting operations.
pub type Result<T> = std::result::Result<T, RateLimitError>;

/// Coarse error classification, independent of the nested detail enums.
///
/// Every `RateLimitError` maps to exactly one of these. Callers that only
/// need to branch on the failure category (retry, surface 429, surface 503,
/// etc.) should match on `kind()` rather than the full error enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A caller-supplied argument was invalid (e.g. zero weight).
    InvalidArgument,
    /// The request was denied by the rate limit.
    LimitExceeded,
    /// The storage backend could not be reached or failed.
    BackendUnavailable,
    /// The limiter or one of its components was configured incorrectly.
    Misconfigured,
    /// An operation did not complete within its deadline.
    Timeout,
}

/// Main error type for rate limiting operations.
#[derive(Debug, Error)]
pub enum RateLimitError {
    /// Storage backend error.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Key extraction error.
    #[error("Key extraction failed: {0}")]
    KeyExtraction(String),

    /// Connection error (e.g., Redis connection failed).
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Rate limit exceeded with retry information.
    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimitExceeded {
        /// How long to wait before retrying.
        retry_after: Option<Duration>,
        /// Current remaining quota.
        remaining: u64,
        /// Maximum quota limit.
        limit: u64,
    },

    /// An operation (e.g. a deadline-bound async acquire) timed out.
    #[error("Operation timed out after {0:?}")]
    OperationTimeout(Duration),

    /// A caller-supplied argument was invalid.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl RateLimitError {
    /// Classify this error into one of the five coarse kinds.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::RateLimitExceeded { .. } => ErrorKind::LimitExceeded,
            Self::Storage(_) => ErrorKind::BackendUnavailable,
            Self::Connection(ConnectionError::Timeout(_)) => ErrorKind::Timeout,
            Self::Connection(_) => ErrorKind::BackendUnavailable,
            Self::OperationTimeout(_) => ErrorKind::Timeout,
            Self::Config(_) => ErrorKind::Misconfigured,
            Self::KeyExtraction(_) => ErrorKind::InvalidArgument,
            Self::Internal(_) => ErrorKind::Misconfigured,
        }
    }
}

/// Storage-related errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Generic storage operation failed.
    #[error("{message}")]
    OperationFailed {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Key not found.
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Atomic operation failed (CAS conflict).
    #[error("Atomic operation failed, state was modified concurrently")]
    AtomicConflict,

    /// Connection pool exhausted.
    #[error("Connection pool exhausted")]
    PoolExhausted,
}

impl StorageError {
    /// Create a new operation failed error.
    pub fn operation_failed(message: impl Into<String>, retryable: bool) -> Self {
        Self::OperationFailed {
            message: message.into(),
            retryable,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::OperationFailed { retryable, .. } => *retryable,
            Self::AtomicConflict => true,
            Self::PoolExhausted => true,
            _ => false,
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Invalid quota configuration.
    #[error("Invalid quota: {0}")]
    InvalidQuota(String),

    /// Invalid algorithm configuration.
    #[error("Invalid algorithm configuration: {0}")]
    InvalidAlgorithm(String),

    /// Invalid storage configuration.
    #[error("Invalid storage configuration: {0}")]
    InvalidStorage(String),

    /// Missing required configuration.
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    /// A name (pool, tier, registered algorithm) was registered twice.
    #[error("Already registered: {0}")]
    DuplicateName(String),

    /// A referenced name (pool, tier, registered algorithm) does not exist.
    #[error("Not found: {0}")]
    NotFound(String),
}

/// Connection-related errors.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Failed to connect.
    #[error("Failed to connect: {0}")]
    ConnectionFailed(String),

    /// Connection timeout.
    #[error("Connection timeout after {0:?}")]
    Timeout(Duration),

    /// Connection closed unexpectedly.
    #[error("Connection closed unexpectedly")]
    Closed,

    /// Authentication failed.
    #[error("Authentication failed: {0}")]
    AuthFailed(String),
}
