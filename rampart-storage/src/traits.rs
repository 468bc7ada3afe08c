//! Shared store client interface.
//!
//! This module defines the operations every backend must provide. Values are
//! opaque bytes; callers own their encoding.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rampart_core::StoreResult;

/// A value read back from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredValue {
    pub bytes: Vec<u8>,
    /// `None` means the value never expires on its own.
    pub expires_at: Option<DateTime<Utc>>,
}

impl StoredValue {
    /// Interpret the value as a counter written by `incr_with_expiry`.
    pub fn as_counter(&self) -> Option<u64> {
        let raw: [u8; 8] = self.bytes.as_slice().try_into().ok()?;
        Some(u64::from_le_bytes(raw))
    }
}

/// Counter state after an `incr_with_expiry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counter {
    pub value: u64,
    pub expires_at: DateTime<Utc>,
}

/// Shared store client.
///
/// Implementations must be safe to call from many tasks at once, and every
/// read-modify-write exposed here (`incr_with_expiry`) must be atomic with
/// respect to every other process using the same store.
///
/// # Expiry
///
/// A value whose expiry has passed is never returned by `get`, whether or not
/// the backend has physically removed it yet.
///
/// # Tags
///
/// Backends advertise tag support through `supports_tags`. When it is false
/// `set` ignores the tags it is given and `tag_flush` removes nothing;
/// callers branch on the capability, never on the backend identity.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Short backend name for logs and metrics.
    fn backend_name(&self) -> &'static str;

    /// Whether `tag_flush` actually removes tagged keys.
    fn supports_tags(&self) -> bool;

    /// Whether every worker process sees the same data.
    fn is_shared(&self) -> bool;

    /// Get a live value.
    async fn get(&self, key: &str) -> StoreResult<Option<StoredValue>>;

    /// Store a value, optionally expiring after `ttl` and indexed under `tags`.
    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
        tags: &[String],
    ) -> StoreResult<()>;

    /// Remove a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Atomically increment a counter.
    ///
    /// A missing or expired counter restarts at 1 with expiry `now + ttl`;
    /// a live counter keeps its original expiry.
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> StoreResult<Counter>;

    /// Remove every key indexed under any of `tags`. Returns the number removed.
    async fn tag_flush(&self, tags: &[String]) -> StoreResult<u64>;

    /// Physically remove expired values and any tag index rows pointing at
    /// them. Returns the number of values removed.
    async fn purge_expired(&self) -> StoreResult<u64>;

    /// Cheap liveness check.
    async fn ping(&self) -> StoreResult<()>;

    /// Get store statistics.
    async fn stats(&self) -> StoreResult<CacheStats>;
}

/// Statistics about store usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of reads that found a live value.
    pub hits: u64,
    /// Number of reads that found nothing or an expired value.
    pub misses: u64,
    /// Number of entries currently stored (including not-yet-purged expired ones).
    pub entry_count: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_stats_hit_rate() {
        let stats = CacheStats {
            hits: 80,
            misses: 20,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.8).abs() < 0.001);

        let empty_stats = CacheStats::default();
        assert!((empty_stats.hit_rate() - 0.0).abs() < 0.001);
    }

    #[test]
    fn test_stored_value_as_counter() {
        let value = StoredValue {
            bytes: 7u64.to_le_bytes().to_vec(),
            expires_at: None,
        };
        assert_eq!(value.as_counter(), Some(7));

        let not_counter = StoredValue {
            bytes: b"{}".to_vec(),
            expires_at: None,
        };
        assert_eq!(not_counter.as_counter(), None);
    }
}
