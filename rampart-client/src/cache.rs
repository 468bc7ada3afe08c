//! On-device TTL cache with stale fallback.
//!
//! Each key is one JSON file under the cache directory, named by the SHA-256
//! of the key. A read that finds a record younger than the caller's TTL
//! returns it without touching the network. Otherwise the fetch runs; its
//! result replaces the record, and if it fails the old record is returned no
//! matter how old it is.
//!
//! Check, fetch and write for one key happen under a per-key async mutex, so
//! two concurrent readers of the same key never both fetch and race to
//! overwrite. Different keys do not wait on each other. The mutex entry is
//! dropped again once no task holds or waits on it.
//!
//! [`ClientCache::clear_all`] starts a new epoch. A fetch that began before
//! the clear neither writes its result nor falls back to a record from the
//! previous epoch, so nothing from before a logout reappears after it.

use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rampart_core::{add_duration, elapsed_between, Clock, SystemClock};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, warn};

use crate::error::{ClientError, ClientResult, FetchError};

/// For data that changes during the day (schedules).
pub const TTL_SHORT: Duration = Duration::from_secs(5 * 60);

/// For master data (users, teachers, subjects, classrooms).
pub const TTL_LONG: Duration = Duration::from_secs(30 * 60);

const RECORD_EXT: &str = "json";

/// One cached payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCacheRecord {
    pub key: String,
    pub payload: Vec<u8>,
    pub saved_at: DateTime<Utc>,
}

impl ClientCacheRecord {
    /// Fresh while `now - saved_at <= ttl`.
    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now < self.saved_at || elapsed_between(self.saved_at, now) <= ttl
    }

    pub fn remaining_ttl(&self, now: DateTime<Utc>, ttl: Duration) -> Duration {
        elapsed_between(now, add_duration(self.saved_at, ttl))
    }
}

/// On-disk form of a record.
#[derive(Serialize, Deserialize)]
struct RecordFile {
    key: String,
    payload_b64: String,
    saved_at: DateTime<Utc>,
}

/// Where a returned payload came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Fresh record, no network call made.
    Cache,
    /// Fetched just now.
    Network,
    /// Fetch failed; this is the last record saved, however old.
    StaleFallback,
}

/// A payload and where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Cached<T> {
    pub value: T,
    pub origin: Origin,
    pub saved_at: DateTime<Utc>,
}

impl<T> Cached<T> {
    pub fn is_stale(&self) -> bool {
        self.origin == Origin::StaleFallback
    }

    fn map<U>(self, f: impl FnOnce(T) -> U) -> Cached<U> {
        Cached {
            value: f(self.value),
            origin: self.origin,
            saved_at: self.saved_at,
        }
    }
}

/// Device-local TTL cache.
#[derive(Clone)]
pub struct ClientCache {
    dir: PathBuf,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    /// Bumped by `clear_all`; writes hold it shared.
    epoch: Arc<RwLock<u64>>,
    clock: Arc<dyn Clock>,
}

/// A held per-key lock.
struct KeyLock<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    key: &'a str,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyLock<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl ClientCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_clock(dir, Arc::new(SystemClock))
    }

    pub fn with_clock(dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            dir: dir.into(),
            locks: Arc::new(DashMap::new()),
            epoch: Arc::new(RwLock::new(0)),
            clock,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, key: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        self.dir.join(format!("{}.{}", digest, RECORD_EXT))
    }

    async fn lock_key<'a>(&'a self, key: &'a str) -> KeyLock<'a> {
        let lock = Arc::clone(
            self.locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        KeyLock {
            locks: &self.locks,
            key,
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Return a fresh record, or fetch and store a new payload.
    ///
    /// When `fetch` fails, an existing record is returned as
    /// [`Origin::StaleFallback`]; with no record the fetch error propagates.
    pub async fn read_or_fetch<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        fetch: F,
    ) -> ClientResult<Cached<Vec<u8>>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>, FetchError>>,
    {
        let _lock = self.lock_key(key).await;
        let epoch = *self.epoch.read().await;

        let existing = self.load_or_discard(key).await;
        if let Some(record) = &existing {
            if record.is_fresh(self.clock.now(), ttl) {
                debug!(key, "Client cache hit");
                return Ok(Cached {
                    value: record.payload.clone(),
                    origin: Origin::Cache,
                    saved_at: record.saved_at,
                });
            }
        }

        self.fetch_and_store(key, epoch, existing, fetch).await
    }

    /// Fetch regardless of freshness, still falling back to the stored
    /// record if the fetch fails.
    pub async fn refresh<F, Fut>(&self, key: &str, fetch: F) -> ClientResult<Cached<Vec<u8>>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>, FetchError>>,
    {
        let _lock = self.lock_key(key).await;
        let epoch = *self.epoch.read().await;

        let existing = self.load_or_discard(key).await;
        self.fetch_and_store(key, epoch, existing, fetch).await
    }

    async fn fetch_and_store<F, Fut>(
        &self,
        key: &str,
        epoch: u64,
        existing: Option<ClientCacheRecord>,
        fetch: F,
    ) -> ClientResult<Cached<Vec<u8>>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>, FetchError>>,
    {
        match fetch().await {
            Ok(payload) => {
                let saved_at = self.clock.now();
                let record = ClientCacheRecord {
                    key: key.to_string(),
                    payload,
                    saved_at,
                };
                let current = self.epoch.read().await;
                if *current != epoch {
                    debug!(key, "Cache cleared during fetch, not storing result");
                } else if let Err(e) = self.write_record(&record).await {
                    warn!(key, error = %e, "Failed to persist fetched payload");
                }
                Ok(Cached {
                    value: record.payload,
                    origin: Origin::Network,
                    saved_at,
                })
            }
            Err(e) => {
                let cleared = *self.epoch.read().await != epoch;
                match existing {
                    Some(record) if !cleared => {
                        warn!(key, error = %e, saved_at = %record.saved_at, "Fetch failed, serving stale copy");
                        Ok(Cached {
                            value: record.payload,
                            origin: Origin::StaleFallback,
                            saved_at: record.saved_at,
                        })
                    }
                    _ => Err(ClientError::Fetch(e)),
                }
            }
        }
    }

    /// Store a payload as if it had just been fetched.
    pub async fn save(&self, key: &str, payload: Vec<u8>) -> ClientResult<()> {
        let _lock = self.lock_key(key).await;
        let _epoch = self.epoch.read().await;
        self.write_record(&ClientCacheRecord {
            key: key.to_string(),
            payload,
            saved_at: self.clock.now(),
        })
        .await
    }

    /// The stored record for `key`, fresh or not.
    pub async fn load(&self, key: &str) -> ClientResult<Option<ClientCacheRecord>> {
        let path = self.record_path(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let file: RecordFile = serde_json::from_slice(&bytes)?;
        if file.key != key {
            return Err(ClientError::Corrupt {
                key: key.to_string(),
                reason: format!("record belongs to '{}'", file.key),
            });
        }
        let payload = BASE64
            .decode(file.payload_b64.as_bytes())
            .map_err(|e| ClientError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Some(ClientCacheRecord {
            key: file.key,
            payload,
            saved_at: file.saved_at,
        }))
    }

    async fn load_or_discard(&self, key: &str) -> Option<ClientCacheRecord> {
        match self.load(key).await {
            Ok(record) => record,
            Err(e) => {
                warn!(key, error = %e, "Ignoring unreadable cache record");
                None
            }
        }
    }

    async fn write_record(&self, record: &ClientCacheRecord) -> ClientResult<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let file = RecordFile {
            key: record.key.clone(),
            payload_b64: BASE64.encode(&record.payload),
            saved_at: record.saved_at,
        };
        let contents = serde_json::to_vec(&file)?;

        let path = self.record_path(&record.key);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Drop the record for `key`. Returns whether one existed.
    pub async fn invalidate(&self, key: &str) -> ClientResult<bool> {
        let _lock = self.lock_key(key).await;
        match tokio::fs::remove_file(self.record_path(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Drop every record, e.g. on logout. Returns how many were removed.
    ///
    /// Waits for writes in progress; fetches still in flight afterwards do
    /// not store their results.
    pub async fn clear_all(&self) -> ClientResult<u64> {
        let mut epoch = self.epoch.write().await;
        *epoch = epoch.wrapping_add(1);

        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0u64;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let ext = path.extension().and_then(|e| e.to_str());
            if !matches!(ext, Some(RECORD_EXT) | Some("tmp")) {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += u64::from(ext == Some(RECORD_EXT)),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        debug!(removed, "Cleared client cache");
        Ok(removed)
    }

    /// Whether a fresh record exists.
    pub async fn is_valid(&self, key: &str, ttl: Duration) -> bool {
        match self.load_or_discard(key).await {
            Some(record) => record.is_fresh(self.clock.now(), ttl),
            None => false,
        }
    }

    /// Time left before the record goes stale; zero when missing.
    pub async fn remaining_ttl(&self, key: &str, ttl: Duration) -> Duration {
        match self.load_or_discard(key).await {
            Some(record) => record.remaining_ttl(self.clock.now(), ttl),
            None => Duration::ZERO,
        }
    }

    // ===== Typed JSON helpers =====

    /// [`read_or_fetch`](Self::read_or_fetch) for JSON payloads.
    ///
    /// The fetched body must decode as `T` before it is stored, so a garbled
    /// response never replaces a good record.
    pub async fn read_or_fetch_json<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        fetch: F,
    ) -> ClientResult<Cached<T>>
    where
        T: DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>, FetchError>>,
    {
        let cached = self
            .read_or_fetch(key, ttl, || async move {
                let body = fetch().await?;
                serde_json::from_slice::<serde_json::Value>(&body)
                    .map_err(|e| FetchError::InvalidResponse(e.to_string()))?;
                Ok::<_, FetchError>(body)
            })
            .await?;
        let value = serde_json::from_slice::<T>(&cached.value)?;
        Ok(cached.map(|_| value))
    }

    pub async fn save_json<T: Serialize>(&self, key: &str, value: &T) -> ClientResult<()> {
        self.save(key, serde_json::to_vec(value)?).await
    }

    /// Fresh JSON record, decoded.
    pub async fn load_json<T: DeserializeOwned>(
        &self,
        key: &str,
        ttl: Duration,
    ) -> ClientResult<Option<T>> {
        match self.load(key).await? {
            Some(record) if record.is_fresh(self.clock.now(), ttl) => {
                Ok(Some(serde_json::from_slice(&record.payload)?))
            }
            _ => Ok(None),
        }
    }
}

impl std::fmt::Debug for ClientCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCache")
            .field("dir", &self.dir)
            .field("locked_keys", &self.locks.len())
            .finish()
    }
}
