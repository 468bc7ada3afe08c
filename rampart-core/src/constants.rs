//! Constants for rampart
//!
//! Defaults used when configuration does not override them.

// ============================================================================
// CIRCUIT BREAKER
// ============================================================================

/// Consecutive dependency failures before the circuit opens
pub const DEFAULT_CIRCUIT_FAILURE_THRESHOLD: u32 = 10;

/// Seconds an open circuit waits before admitting probes
pub const DEFAULT_CIRCUIT_RECOVERY_SECS: u64 = 300;

/// Probe calls admitted while half-open
pub const DEFAULT_CIRCUIT_HALF_OPEN_MAX_CALLS: u32 = 3;

/// Upper bound on any single dependency call (milliseconds)
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 5_000;

// ============================================================================
// RATE LIMITING
// ============================================================================

/// General polling reads per window
pub const DEFAULT_RATE_LIMIT_GENERAL: u32 = 60;

/// Write-heavy submissions per window
pub const DEFAULT_RATE_LIMIT_SUBMISSION: u32 = 30;

/// Lightweight high-frequency reads per window
pub const DEFAULT_RATE_LIMIT_LIGHTWEIGHT: u32 = 100;

/// Rate limit window length in minutes
pub const DEFAULT_RATE_LIMIT_WINDOW_MINUTES: u64 = 1;

// ============================================================================
// CACHE TTLS
// ============================================================================

/// Frequently-changing listings (5 minutes)
pub const TTL_SHORT_SECS: u64 = 300;

/// Slow-changing master data (30 minutes)
pub const TTL_LONG_SECS: u64 = 1_800;

/// "Today" aggregates (2 minutes)
pub const TTL_TODAY_SECS: u64 = 120;

// ============================================================================
// PAGINATION
// ============================================================================

/// Default maximum page size for list queries
pub const DEFAULT_MAX_PAGE_SIZE: u32 = 100;

// ============================================================================
// SHARED STORE
// ============================================================================

/// Default LMDB map size in megabytes
pub const DEFAULT_STORE_MAP_SIZE_MB: usize = 64;

/// Seconds between sweeps that physically remove expired entries
pub const DEFAULT_STORE_PURGE_INTERVAL_SECS: u64 = 60;

/// LMDB rejects keys longer than this many bytes
pub const MAX_STORE_KEY_LEN: usize = 511;
