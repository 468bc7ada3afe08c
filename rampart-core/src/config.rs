//! Configuration Module
//!
//! Breaker thresholds, per-route-class rate limits, per-resource-class TTLs,
//! page size limits and shared store location. Loaded once at process start
//! from environment variables, with defaults suitable for development.

use std::path::PathBuf;
use std::time::Duration;

use crate::constants::*;
use crate::error::ConfigError;
use crate::rate::{RateLimitSpec, RouteClass};
use crate::resource::ResourceCatalog;

// ============================================================================
// CIRCUIT BREAKER
// ============================================================================

/// Configuration for the circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub half_open_max_calls: u32,
    /// Every wrapped call is cut off after this long; a timeout is a failure.
    pub call_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_CIRCUIT_FAILURE_THRESHOLD,
            recovery_timeout: Duration::from_secs(DEFAULT_CIRCUIT_RECOVERY_SECS),
            half_open_max_calls: DEFAULT_CIRCUIT_HALF_OPEN_MAX_CALLS,
            call_timeout: Duration::from_millis(DEFAULT_CALL_TIMEOUT_MS),
        }
    }
}

// ============================================================================
// RATE LIMITS
// ============================================================================

/// One limit per route class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimits {
    pub general: RateLimitSpec,
    pub submission: RateLimitSpec,
    pub lightweight: RateLimitSpec,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            general: RateLimitSpec::per_minutes(
                DEFAULT_RATE_LIMIT_GENERAL,
                DEFAULT_RATE_LIMIT_WINDOW_MINUTES,
            ),
            submission: RateLimitSpec::per_minutes(
                DEFAULT_RATE_LIMIT_SUBMISSION,
                DEFAULT_RATE_LIMIT_WINDOW_MINUTES,
            ),
            lightweight: RateLimitSpec::per_minutes(
                DEFAULT_RATE_LIMIT_LIGHTWEIGHT,
                DEFAULT_RATE_LIMIT_WINDOW_MINUTES,
            ),
        }
    }
}

impl RateLimits {
    pub fn for_class(&self, class: RouteClass) -> RateLimitSpec {
        match class {
            RouteClass::General => self.general,
            RouteClass::Submission => self.submission,
            RouteClass::Lightweight => self.lightweight,
        }
    }

    pub fn set(&mut self, class: RouteClass, spec: RateLimitSpec) {
        match class {
            RouteClass::General => self.general = spec,
            RouteClass::Submission => self.submission = spec,
            RouteClass::Lightweight => self.lightweight = spec,
        }
    }
}

// ============================================================================
// SHARED STORE
// ============================================================================

/// Where the shared store lives. No path means process-local only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub path: Option<PathBuf>,
    pub map_size_mb: usize,
    /// How often expired entries are swept out of the store.
    pub purge_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            map_size_mb: DEFAULT_STORE_MAP_SIZE_MB,
            purge_interval: Duration::from_secs(DEFAULT_STORE_PURGE_INTERVAL_SECS),
        }
    }
}

// ============================================================================
// RAMPART CONFIGURATION
// ============================================================================

/// Complete layer configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RampartConfig {
    pub breaker: BreakerConfig,
    pub rate_limits: RateLimits,
    /// Fleet-wide requests per minute before every request is refused.
    pub overload_brake: Option<u32>,
    pub catalog: ResourceCatalog,
    pub max_page_size: u32,
    pub store: StoreConfig,
}

impl Default for RampartConfig {
    fn default() -> Self {
        Self {
            breaker: BreakerConfig::default(),
            rate_limits: RateLimits::default(),
            overload_brake: None,
            catalog: ResourceCatalog::default(),
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
            store: StoreConfig::default(),
        }
    }
}

impl RampartConfig {
    /// Create RampartConfig from environment variables.
    ///
    /// Environment variables:
    /// - `RAMPART_CIRCUIT_FAILURE_THRESHOLD`: failures before opening (default: 10)
    /// - `RAMPART_CIRCUIT_RECOVERY_SECS`: how long the circuit stays open (default: 300)
    /// - `RAMPART_CIRCUIT_HALF_OPEN_MAX_CALLS`: probes while half-open (default: 3)
    /// - `RAMPART_CALL_TIMEOUT_MS`: dependency call timeout (default: 5000)
    /// - `RAMPART_RATE_LIMIT_GENERAL` / `_SUBMISSION` / `_LIGHTWEIGHT`: `"<max>,<minutes>"`
    /// - `RAMPART_OVERLOAD_BRAKE`: fleet-wide requests per minute (default: disabled)
    /// - `RAMPART_TTL_<CLASS>_SECS`: TTL override for a resource class
    /// - `RAMPART_MAX_PAGE_SIZE`: largest accepted page size (default: 100)
    /// - `RAMPART_STORE_PATH`: LMDB directory for the shared store (default: process-local)
    /// - `RAMPART_STORE_MAP_SIZE_MB`: LMDB map size (default: 64)
    /// - `RAMPART_STORE_PURGE_SECS`: seconds between expired-entry sweeps (default: 60)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse_var::<u32, _>(&lookup, "RAMPART_CIRCUIT_FAILURE_THRESHOLD")? {
            config.breaker.failure_threshold = v;
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "RAMPART_CIRCUIT_RECOVERY_SECS")? {
            config.breaker.recovery_timeout = Duration::from_secs(v);
        }
        if let Some(v) = parse_var::<u32, _>(&lookup, "RAMPART_CIRCUIT_HALF_OPEN_MAX_CALLS")? {
            config.breaker.half_open_max_calls = v;
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "RAMPART_CALL_TIMEOUT_MS")? {
            config.breaker.call_timeout = Duration::from_millis(v);
        }

        for class in RouteClass::ALL {
            let var = format!("RAMPART_RATE_LIMIT_{}", class.as_db_str().to_uppercase());
            if let Some(raw) = lookup(&var) {
                config.rate_limits.set(class, RateLimitSpec::parse(&var, &raw)?);
            }
        }

        config.overload_brake = parse_var::<u32, _>(&lookup, "RAMPART_OVERLOAD_BRAKE")?;

        let classes: Vec<String> = config.catalog.classes().map(|(c, _)| c.to_string()).collect();
        for class in classes {
            let var = format!("RAMPART_TTL_{}_SECS", class.to_uppercase());
            if let Some(secs) = parse_var::<u64, _>(&lookup, &var)? {
                config.catalog.set_ttl(&class, Duration::from_secs(secs));
            }
        }

        if let Some(v) = parse_var::<u32, _>(&lookup, "RAMPART_MAX_PAGE_SIZE")? {
            config.max_page_size = v;
        }

        config.store.path = lookup("RAMPART_STORE_PATH")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);
        if let Some(v) = parse_var::<usize, _>(&lookup, "RAMPART_STORE_MAP_SIZE_MB")? {
            config.store.map_size_mb = v;
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "RAMPART_STORE_PURGE_SECS")? {
            config.store.purge_interval = Duration::from_secs(v);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.breaker.failure_threshold == 0 {
            return Err(invalid("breaker.failure_threshold", "0", "must be > 0"));
        }
        if self.breaker.half_open_max_calls == 0 {
            return Err(invalid("breaker.half_open_max_calls", "0", "must be > 0"));
        }
        if self.breaker.call_timeout.is_zero() {
            return Err(invalid("breaker.call_timeout", "0", "must be > 0"));
        }
        if self.max_page_size == 0 {
            return Err(invalid("max_page_size", "0", "must be > 0"));
        }
        if self.overload_brake == Some(0) {
            return Err(invalid("overload_brake", "0", "must be > 0 or unset"));
        }
        if self.store.map_size_mb == 0 {
            return Err(invalid("store.map_size_mb", "0", "must be > 0"));
        }
        if self.store.purge_interval.is_zero() {
            return Err(invalid("store.purge_interval", "0", "must be > 0"));
        }
        Ok(())
    }
}

fn invalid(field: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_var<T, F>(lookup: &F, var: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| invalid(var, &raw, "not a valid number")),
    }
}
