//! Error types for rampart operations

use std::time::Duration;
use thiserror::Error;

/// Caller input errors. Never counted against the breaker or rate limiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Page size {requested} exceeds maximum of {max}")]
    PageSizeExceeded { requested: u32, max: u32 },
}

/// Failures of the protected downstream dependency.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DependencyError {
    #[error("Dependency {dependency} timed out after {after:?}")]
    Timeout { dependency: String, after: Duration },

    #[error("Connection to {dependency} failed: {reason}")]
    Connection { dependency: String, reason: String },

    #[error("Dependency {dependency} failed with status {status}: {message}")]
    Server {
        dependency: String,
        status: u16,
        message: String,
    },

    #[error("Probe task for {dependency} aborted: {reason}")]
    Aborted { dependency: String, reason: String },
}

/// Shared store failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store {backend} unavailable: {reason}")]
    Unavailable { backend: String, reason: String },

    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Serialization failed for key {key}: {reason}")]
    Serialization { key: String, reason: String },

    #[error("Corrupt value stored under key {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Key too long ({len} bytes, max {max})")]
    KeyTooLong { len: usize, max: usize },

    #[error("Store lock poisoned")]
    LockPoisoned,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all rampart errors.
#[derive(Debug, Clone, Error)]
pub enum RampartError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Dependency error: {0}")]
    Dependency(#[from] DependencyError),

    #[error("Rate limit exceeded for {scope} (limit {limit}), retry after {retry_after:?}")]
    RateLimitExceeded {
        scope: String,
        limit: u32,
        retry_after: Duration,
    },

    #[error("Circuit {name} is open, retry after {retry_after:?}")]
    CircuitOpen { name: String, retry_after: Duration },

    #[error("Cache store error: {0}")]
    Store(#[from] StoreError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl RampartError {
    /// Only dependency-level failures move the circuit breaker.
    pub fn counts_toward_breaker(&self) -> bool {
        matches!(self, Self::Dependency(_))
    }

    /// Whether a caller retry (with backoff) can plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Dependency(_))
    }

    /// How long the caller should wait before trying again, when known.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimitExceeded { retry_after, .. } | Self::CircuitOpen { retry_after, .. } => {
                Some(*retry_after)
            }
            _ => None,
        }
    }

    /// Stable machine-readable code for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_FAILED",
            Self::Dependency(DependencyError::Timeout { .. }) => "DEPENDENCY_TIMEOUT",
            Self::Dependency(_) => "DEPENDENCY_FAILED",
            Self::RateLimitExceeded { .. } => "RATE_LIMITED",
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Self::Store(_) => "CACHE_STORE_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
        }
    }
}

/// Result type alias for rampart operations.
pub type RampartResult<T> = Result<T, RampartError>;

/// Result type alias for shared store operations.
pub type StoreResult<T> = Result<T, StoreError>;

// =============================================================================
// TESTS
// =============================================================================
