//! LMDB-backed shared store.
//!
//! Uses the heed crate (Rust bindings for LMDB). Every worker process opens
//! the same directory; LMDB serializes write transactions across processes,
//! which is what makes `incr_with_expiry` and the tag index consistent for
//! the whole pool.
//!
//! # Layout
//!
//! Two named databases live in one environment:
//! - `entries`: `key -> [expires_at millis: 8 bytes LE][payload]`, where
//!   `i64::MIN` in the header means "never expires".
//! - `tags`: `tag \x1f key -> ()`, scanned by prefix on flush.
//!
//! # Reclaiming space
//!
//! Expired entries stay on disk until purged. [`SharedStore::purge_expired`]
//! removes them along with tag rows whose entry is gone. Writes also sweep
//! on their own once the trees fill three quarters of the map, so the sweep
//! still has free pages to work with. A write that hits `MDB_MAP_FULL`
//! anyway purges once and retries before giving up.

use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions, MdbError, RoTxn, RwTxn};
use rampart_core::constants::MAX_STORE_KEY_LEN;
use rampart_core::{add_duration, Clock, StoreError, StoreResult};
use tracing::{debug, warn};

use crate::traits::{CacheStats, Counter, SharedStore, StoredValue};

const NO_EXPIRY: i64 = i64::MIN;
const HEADER_LEN: usize = 8;
const TAG_SEPARATOR: u8 = 0x1f;
/// Share of the map used by the trees above which writes sweep first.
const SWEEP_HIGH_WATER: f64 = 0.75;
/// Minimum clock time between sweeps triggered by writes.
const SWEEP_MIN_GAP_MS: i64 = 10_000;

/// Error type for LMDB store operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbStoreError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open a database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// The memory map has no room left, even after purging expired entries.
    #[error("LMDB map is full")]
    MapFull,

    /// Stored bytes do not match the envelope format.
    #[error("Corrupt entry {key}: {reason}")]
    Corrupt { key: String, reason: String },

    /// LMDB rejects keys above its compiled-in limit.
    #[error("Key too long ({len} bytes, max {max})")]
    KeyTooLong { len: usize, max: usize },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbStoreError> for StoreError {
    fn from(e: LmdbStoreError) -> Self {
        match e {
            LmdbStoreError::EnvOpen(reason)
            | LmdbStoreError::DbOpen(reason) => StoreError::Unavailable {
                backend: "lmdb".to_string(),
                reason,
            },
            LmdbStoreError::Io(io) => StoreError::Unavailable {
                backend: "lmdb".to_string(),
                reason: io.to_string(),
            },
            LmdbStoreError::Transaction(reason) => StoreError::TransactionFailed { reason },
            LmdbStoreError::MapFull => StoreError::Unavailable {
                backend: "lmdb".to_string(),
                reason: "map full".to_string(),
            },
            LmdbStoreError::Corrupt { key, reason } => StoreError::Corrupt { key, reason },
            LmdbStoreError::KeyTooLong { len, max } => StoreError::KeyTooLong { len, max },
        }
    }
}

fn txn_err(e: heed::Error) -> LmdbStoreError {
    match e {
        heed::Error::Mdb(MdbError::MapFull) => LmdbStoreError::MapFull,
        other => LmdbStoreError::Transaction(other.to_string()),
    }
}

/// LMDB-backed [`SharedStore`].
pub struct LmdbStore {
    env: Env,
    entries: Database<Bytes, Bytes>,
    tags: Database<Bytes, Bytes>,
    clock: Arc<dyn Clock>,
    hits: AtomicU64,
    misses: AtomicU64,
    last_sweep_ms: AtomicI64,
}

impl LmdbStore {
    /// Open (or create) the store in `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory cannot be created
    /// - LMDB environment cannot be opened
    /// - The named databases cannot be created
    pub fn open<P: AsRef<Path>>(
        path: P,
        map_size_mb: usize,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, LmdbStoreError> {
        std::fs::create_dir_all(&path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size_mb * 1024 * 1024)
                .max_dbs(2)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbStoreError::EnvOpen(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(txn_err)?;
        let entries: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, Some("entries"))
            .map_err(|e| LmdbStoreError::DbOpen(e.to_string()))?;
        let tags: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, Some("tags"))
            .map_err(|e| LmdbStoreError::DbOpen(e.to_string()))?;
        wtxn.commit().map_err(txn_err)?;

        debug!(path = %path.as_ref().display(), map_size_mb, "Opened LMDB store");

        Ok(Self {
            env,
            entries,
            tags,
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            last_sweep_ms: AtomicI64::new(i64::MIN),
        })
    }

    /// Physically remove expired entries and tag rows left without an entry.
    fn sweep_expired(&self) -> Result<u64, LmdbStoreError> {
        let now = self.clock.now();
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;

        let expired: Vec<Vec<u8>> = {
            let mut keys = Vec::new();
            for result in self.entries.iter(&wtxn).map_err(txn_err)? {
                let Ok((key, bytes)) = result else { continue };
                if let Ok((expires_at, _)) = decode_envelope(key, bytes) {
                    if !is_live(expires_at, now) {
                        keys.push(key.to_vec());
                    }
                }
            }
            keys
        };

        let mut removed = 0u64;
        for key in &expired {
            if self.entries.delete(&mut wtxn, key).map_err(txn_err)? {
                removed += 1;
            }
        }

        let orphans: Vec<Vec<u8>> = {
            let mut rows = Vec::new();
            for result in self.tags.iter(&wtxn).map_err(txn_err)? {
                let Ok((index_key, _)) = result else { continue };
                let Some(split) = index_key.iter().position(|b| *b == TAG_SEPARATOR) else {
                    rows.push(index_key.to_vec());
                    continue;
                };
                let key = &index_key[split + 1..];
                if self.entries.get(&wtxn, key).map_err(txn_err)?.is_none() {
                    rows.push(index_key.to_vec());
                }
            }
            rows
        };
        for index_key in &orphans {
            self.tags.delete(&mut wtxn, index_key).map_err(txn_err)?;
        }

        wtxn.commit().map_err(txn_err)?;
        if removed > 0 || !orphans.is_empty() {
            debug!(removed, tag_rows = orphans.len(), "Purged expired entries");
        }
        Ok(removed)
    }

    /// Fraction of the map held by the entry and tag trees.
    fn occupancy(&self) -> Result<f64, LmdbStoreError> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let mut bytes = 0usize;
        for db in [&self.entries, &self.tags] {
            let stat = db.stat(&rtxn).map_err(txn_err)?;
            let pages = stat.branch_pages + stat.leaf_pages + stat.overflow_pages;
            bytes += pages * stat.page_size as usize;
        }
        Ok(bytes as f64 / self.env.info().map_size as f64)
    }

    fn sweep_if_crowded(&self) {
        let now_ms = self.clock.now().timestamp_millis();
        if now_ms.saturating_sub(self.last_sweep_ms.load(Ordering::Relaxed)) < SWEEP_MIN_GAP_MS {
            return;
        }
        match self.occupancy() {
            Ok(used) if used >= SWEEP_HIGH_WATER => {
                self.last_sweep_ms.store(now_ms, Ordering::Relaxed);
                if let Err(e) = self.sweep_expired() {
                    warn!(error = %e, "Sweep of expired entries failed");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Could not read LMDB occupancy"),
        }
    }

    /// Run `op` in a write transaction. When the map is full, purge expired
    /// entries and try once more.
    fn write_reclaiming<T, F>(&self, op: F) -> Result<T, LmdbStoreError>
    where
        F: Fn(&mut RwTxn<'_>) -> Result<T, LmdbStoreError>,
    {
        self.sweep_if_crowded();
        match self.write_once(&op) {
            Err(LmdbStoreError::MapFull) => {
                self.last_sweep_ms
                    .store(self.clock.now().timestamp_millis(), Ordering::Relaxed);
                let purged = self.sweep_expired()?;
                warn!(purged, "LMDB map full, purged expired entries and retrying");
                self.write_once(&op)
            }
            other => other,
        }
    }

    fn write_once<T, F>(&self, op: &F) -> Result<T, LmdbStoreError>
    where
        F: Fn(&mut RwTxn<'_>) -> Result<T, LmdbStoreError>,
    {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let out = op(&mut wtxn)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(out)
    }

    fn read_live(
        &self,
        txn: &RoTxn,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<(Option<DateTime<Utc>>, Vec<u8>)>, LmdbStoreError> {
        match self.entries.get(txn, key.as_bytes()).map_err(txn_err)? {
            Some(bytes) => {
                let (expires_at, payload) = decode_envelope(key.as_bytes(), bytes)?;
                if is_live(expires_at, now) {
                    Ok(Some((expires_at, payload.to_vec())))
                } else {
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }
}

fn check_key(key: &[u8]) -> Result<(), LmdbStoreError> {
    if key.is_empty() || key.len() > MAX_STORE_KEY_LEN {
        return Err(LmdbStoreError::KeyTooLong {
            len: key.len(),
            max: MAX_STORE_KEY_LEN,
        });
    }
    Ok(())
}

fn is_live(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    expires_at.map_or(true, |at| now < at)
}

fn encode_envelope(expires_at: Option<DateTime<Utc>>, payload: &[u8]) -> Vec<u8> {
    let header = expires_at.map_or(NO_EXPIRY, |at| at.timestamp_millis());
    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.extend_from_slice(&header.to_le_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

fn decode_envelope<'a>(
    key: &[u8],
    bytes: &'a [u8],
) -> Result<(Option<DateTime<Utc>>, &'a [u8]), LmdbStoreError> {
    let corrupt = |reason: &str| LmdbStoreError::Corrupt {
        key: String::from_utf8_lossy(key).into_owned(),
        reason: reason.to_string(),
    };

    let header: [u8; HEADER_LEN] = bytes
        .get(..HEADER_LEN)
        .and_then(|h| h.try_into().ok())
        .ok_or_else(|| corrupt("missing expiry header"))?;
    let millis = i64::from_le_bytes(header);
    let expires_at = if millis == NO_EXPIRY {
        None
    } else {
        Some(DateTime::from_timestamp_millis(millis).ok_or_else(|| corrupt("expiry out of range"))?)
    };
    Ok((expires_at, &bytes[HEADER_LEN..]))
}

fn tag_prefix(tag: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(tag.len() + 1);
    prefix.extend_from_slice(tag.as_bytes());
    prefix.push(TAG_SEPARATOR);
    prefix
}

fn tag_index_key(tag: &str, key: &str) -> Vec<u8> {
    let mut index_key = tag_prefix(tag);
    index_key.extend_from_slice(key.as_bytes());
    index_key
}

#[async_trait]
impl SharedStore for LmdbStore {
    fn backend_name(&self) -> &'static str {
        "lmdb"
    }

    fn supports_tags(&self) -> bool {
        true
    }

    fn is_shared(&self) -> bool {
        true
    }

    async fn get(&self, key: &str) -> StoreResult<Option<StoredValue>> {
        let now = self.clock.now();
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        match self.read_live(&rtxn, key, now)? {
            Some((expires_at, bytes)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(StoredValue { bytes, expires_at }))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
        tags: &[String],
    ) -> StoreResult<()> {
        check_key(key.as_bytes())?;
        let index_keys: Vec<Vec<u8>> = tags.iter().map(|t| tag_index_key(t, key)).collect();
        for index_key in &index_keys {
            check_key(index_key)?;
        }

        let expires_at = ttl.map(|ttl| add_duration(self.clock.now(), ttl));
        let envelope = encode_envelope(expires_at, &value);

        self.write_reclaiming(|wtxn| {
            self.entries
                .put(wtxn, key.as_bytes(), &envelope)
                .map_err(txn_err)?;
            for index_key in &index_keys {
                self.tags.put(wtxn, index_key, &[]).map_err(txn_err)?;
            }
            Ok(())
        })?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let deleted = self
            .entries
            .delete(&mut wtxn, key.as_bytes())
            .map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(deleted)
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> StoreResult<Counter> {
        check_key(key.as_bytes())?;
        let now = self.clock.now();

        // Read and write under one write transaction so concurrent workers
        // never observe or lose an intermediate value.
        let counter = self.write_reclaiming(|wtxn| {
            let counter = match self.read_live(wtxn, key, now)? {
                Some((Some(expires_at), bytes)) => {
                    let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                        LmdbStoreError::Corrupt {
                            key: key.to_string(),
                            reason: "counter is not 8 bytes".to_string(),
                        }
                    })?;
                    Counter {
                        value: u64::from_le_bytes(raw).saturating_add(1),
                        expires_at,
                    }
                }
                _ => Counter {
                    value: 1,
                    expires_at: add_duration(now, ttl),
                },
            };

            let envelope = encode_envelope(Some(counter.expires_at), &counter.value.to_le_bytes());
            self.entries
                .put(wtxn, key.as_bytes(), &envelope)
                .map_err(txn_err)?;
            Ok(counter)
        })?;
        Ok(counter)
    }

    async fn tag_flush(&self, tags: &[String]) -> StoreResult<u64> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;

        let mut index_keys = Vec::new();
        for tag in tags {
            let prefix = tag_prefix(tag);
            for result in self.tags.prefix_iter(&wtxn, &prefix).map_err(txn_err)? {
                let (index_key, _) = result.map_err(txn_err)?;
                index_keys.push((index_key.to_vec(), prefix.len()));
            }
        }

        let mut removed = 0u64;
        for (index_key, prefix_len) in &index_keys {
            if self
                .entries
                .delete(&mut wtxn, &index_key[*prefix_len..])
                .map_err(txn_err)?
            {
                removed += 1;
            }
            self.tags.delete(&mut wtxn, index_key).map_err(txn_err)?;
        }

        wtxn.commit().map_err(txn_err)?;
        debug!(tags = ?tags, removed, "Flushed tagged entries");
        Ok(removed)
    }

    async fn purge_expired(&self) -> StoreResult<u64> {
        Ok(self.sweep_expired()?)
    }

    async fn ping(&self) -> StoreResult<()> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        self.entries.len(&rtxn).map_err(txn_err)?;
        Ok(())
    }

    async fn stats(&self) -> StoreResult<CacheStats> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let entry_count = self.entries.len(&rtxn).map_err(txn_err)?;
        Ok(CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rampart_core::ManualClock;
    use tempfile::TempDir;

    fn create_test_store() -> (LmdbStore, ManualClock, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let clock = ManualClock::at_epoch();
        let store = LmdbStore::open(temp_dir.path(), 10, Arc::new(clock.clone()))
            .expect("store creation should succeed");
        (store, clock, temp_dir)
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let (store, _clock, _dir) = create_test_store();

        store
            .set("cache:teachers", b"[1,2,3]".to_vec(), None, &[])
            .await
            .expect("set should succeed");

        let value = store
            .get("cache:teachers")
            .await
            .expect("get should succeed")
            .expect("value should exist");
        assert_eq!(value.bytes, b"[1,2,3]");
        assert_eq!(value.expires_at, None);
    }

    #[tokio::test]
    async fn test_expired_entry_reads_as_missing() {
        let (store, clock, _dir) = create_test_store();

        store
            .set("k", b"v".to_vec(), Some(Duration::from_secs(120)), &[])
            .await
            .expect("set should succeed");

        clock.advance(Duration::from_secs(119));
        assert!(store.get("k").await.unwrap().is_some());

        clock.advance(Duration::from_secs(1));
        assert!(store.get("k").await.unwrap().is_none());

        assert_eq!(store.purge_expired().await.expect("purge should succeed"), 1);
        assert_eq!(store.stats().await.unwrap().entry_count, 0);
    }

    #[tokio::test]
    async fn test_purge_drops_tag_rows_of_expired_entries() {
        let (store, clock, _dir) = create_test_store();
        let tags = vec!["schedules".to_string()];
        store
            .set("old", b"1".to_vec(), Some(Duration::from_secs(60)), &tags)
            .await
            .unwrap();
        store.set("kept", b"2".to_vec(), None, &tags).await.unwrap();

        clock.advance(Duration::from_secs(61));
        assert_eq!(store.purge_expired().await.unwrap(), 1);

        let rtxn = store.env.read_txn().unwrap();
        assert_eq!(store.tags.len(&rtxn).unwrap(), 1);
        drop(rtxn);
        assert_eq!(store.tag_flush(&tags).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_full_map_reclaims_expired_entries() {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let clock = ManualClock::at_epoch();
        let store = LmdbStore::open(temp_dir.path(), 1, Arc::new(clock.clone()))
            .expect("store creation should succeed");
        let payload = vec![7u8; 1024];
        let tags = vec!["schedules".to_string()];

        // Several times the map size in total, never more than one entry live.
        for day in 0..3_000u32 {
            store
                .set(
                    &format!("cache:todaySchedule:day={}", day),
                    payload.clone(),
                    Some(Duration::from_secs(120)),
                    &tags,
                )
                .await
                .unwrap_or_else(|e| panic!("write {} failed: {}", day, e));
            clock.advance(Duration::from_secs(130));
        }

        let window = Duration::from_secs(60);
        for expected in 1..=5u64 {
            let counter = store.incr_with_expiry("rate:subject", window).await.unwrap();
            assert_eq!(counter.value, expected);
        }
        assert!(store.stats().await.unwrap().entry_count < 3_000);
    }

    #[tokio::test]
    async fn test_incr_with_expiry() {
        let (store, clock, _dir) = create_test_store();
        let window = Duration::from_secs(60);

        for expected in 1..=5u64 {
            let counter = store.incr_with_expiry("rate:abc", window).await.unwrap();
            assert_eq!(counter.value, expected);
        }

        let stored = store.get("rate:abc").await.unwrap().unwrap();
        assert_eq!(stored.as_counter(), Some(5));

        clock.advance(window);
        let counter = store.incr_with_expiry("rate:abc", window).await.unwrap();
        assert_eq!(counter.value, 1);
    }

    #[tokio::test]
    async fn test_incr_is_atomic_across_tasks() {
        let (store, _clock, _dir) = create_test_store();
        let store = Arc::new(store);
        let window = Duration::from_secs(60);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                for _ in 0..25 {
                    store.incr_with_expiry("shared", window).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.expect("task should not panic");
        }

        let stored = store.get("shared").await.unwrap().unwrap();
        assert_eq!(stored.as_counter(), Some(200));
    }

    #[tokio::test]
    async fn test_tag_flush() {
        let (store, _clock, _dir) = create_test_store();
        let schedule_tags = vec!["schedules".to_string(), "timetable".to_string()];
        let master_tags = vec!["master".to_string()];

        store.set("a", b"1".to_vec(), None, &schedule_tags).await.unwrap();
        store.set("b", b"2".to_vec(), None, &schedule_tags).await.unwrap();
        store.set("c", b"3".to_vec(), None, &master_tags).await.unwrap();

        let removed = store
            .tag_flush(&["schedules".to_string(), "timetable".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert!(store.get("a").await.unwrap().is_none());
        assert!(store.get("b").await.unwrap().is_none());
        assert!(store.get("c").await.unwrap().is_some());

        // Index entries are gone too; a second flush removes nothing.
        assert_eq!(store.tag_flush(&schedule_tags).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_tag_prefix_does_not_match_longer_tag() {
        let (store, _clock, _dir) = create_test_store();
        store
            .set("a", b"1".to_vec(), None, &["academic".to_string()])
            .await
            .unwrap();
        store
            .set("b", b"2".to_vec(), None, &["academic_year".to_string()])
            .await
            .unwrap();

        assert_eq!(store.tag_flush(&["academic".to_string()]).await.unwrap(), 1);
        assert!(store.get("b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_key_too_long() {
        let (store, _clock, _dir) = create_test_store();
        let key = "k".repeat(MAX_STORE_KEY_LEN + 1);
        let err = store.set(&key, vec![], None, &[]).await.unwrap_err();
        assert!(matches!(err, StoreError::KeyTooLong { .. }));
    }

    #[tokio::test]
    async fn test_delete_and_stats() {
        let (store, _clock, _dir) = create_test_store();
        store.set("k", b"v".to_vec(), None, &[]).await.unwrap();

        let _ = store.get("k").await.unwrap();
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
        let _ = store.get("k").await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entry_count, 0);
        assert!(store.ping().await.is_ok());
    }

    #[test]
    fn test_envelope_rejects_short_value() {
        let err = decode_envelope(b"k", &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, LmdbStoreError::Corrupt { .. }));
    }
}
