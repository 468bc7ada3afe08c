//! Process-local store.
//!
//! Used as the boot-time fallback when the shared store cannot be reached.
//! Guarantees that depend on cross-process visibility (fleet-wide rate limits,
//! a breaker state every worker agrees on) shrink to this one process.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rampart_core::{add_duration, Clock, StoreError, StoreResult};

use crate::traits::{CacheStats, Counter, SharedStore, StoredValue};

#[derive(Debug, Clone)]
struct MemEntry {
    bytes: Vec<u8>,
    expires_at: Option<DateTime<Utc>>,
}

impl MemEntry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    entries: HashMap<String, MemEntry>,
    tags: HashMap<String, HashSet<String>>,
}

/// In-memory store with optional tag support.
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
    clock: Arc<dyn Clock>,
    tags_enabled: bool,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_tag_support(clock, true)
    }

    /// A store that reports `supports_tags() == false`, like a file-backed
    /// cache driver.
    pub fn with_tag_support(clock: Arc<dyn Clock>, tags_enabled: bool) -> Self {
        Self {
            inner: RwLock::new(MemoryInner::default()),
            clock,
            tags_enabled,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

}

#[async_trait]
impl SharedStore for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    fn supports_tags(&self) -> bool {
        self.tags_enabled
    }

    fn is_shared(&self) -> bool {
        false
    }

    async fn get(&self, key: &str) -> StoreResult<Option<StoredValue>> {
        let now = self.clock.now();
        let inner = self.inner.read().map_err(|_| StoreError::LockPoisoned)?;
        match inner.entries.get(key).filter(|e| e.is_live(now)) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(StoredValue {
                    bytes: entry.bytes.clone(),
                    expires_at: entry.expires_at,
                }))
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
        let expires_at = ttl.map(|ttl| add_duration(self.clock.now(), ttl));
        let mut inner = self.inner.write().map_err(|_| StoreError::LockPoisoned)?;
        inner.entries.insert(
            key.to_string(),
            MemEntry {
                bytes: value,
                expires_at,
            },
        );
        if self.tags_enabled {
            for tag in tags {
                inner
                    .tags
                    .entry(tag.clone())
                    .or_default()
                    .insert(key.to_string());
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut inner = self.inner.write().map_err(|_| StoreError::LockPoisoned)?;
        Ok(inner.entries.remove(key).is_some())
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> StoreResult<Counter> {
        let now = self.clock.now();
        let mut inner = self.inner.write().map_err(|_| StoreError::LockPoisoned)?;

        let current = inner
            .entries
            .get(key)
            .filter(|e| e.is_live(now))
            .and_then(|e| {
                let raw: [u8; 8] = e.bytes.as_slice().try_into().ok()?;
                Some((u64::from_le_bytes(raw), e.expires_at))
            });

        let counter = match current {
            Some((value, Some(expires_at))) => Counter {
                value: value.saturating_add(1),
                expires_at,
            },
            _ => Counter {
                value: 1,
                expires_at: add_duration(now, ttl),
            },
        };

        inner.entries.insert(
            key.to_string(),
            MemEntry {
                bytes: counter.value.to_le_bytes().to_vec(),
                expires_at: Some(counter.expires_at),
            },
        );
        Ok(counter)
    }

    async fn tag_flush(&self, tags: &[String]) -> StoreResult<u64> {
        if !self.tags_enabled {
            return Ok(0);
        }
        let mut inner = self.inner.write().map_err(|_| StoreError::LockPoisoned)?;
        let mut removed = 0u64;
        for tag in tags {
            let Some(keys) = inner.tags.remove(tag) else {
                continue;
            };
            for key in keys {
                if inner.entries.remove(&key).is_some() {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn purge_expired(&self) -> StoreResult<u64> {
        let now = self.clock.now();
        let mut inner = self.inner.write().map_err(|_| StoreError::LockPoisoned)?;
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| entry.is_live(now));
        let removed = (before - inner.entries.len()) as u64;

        let MemoryInner { entries, tags } = &mut *inner;
        tags.retain(|_, keys| {
            keys.retain(|key| entries.contains_key(key));
            !keys.is_empty()
        });
        Ok(removed)
    }

    async fn ping(&self) -> StoreResult<()> {
        self.inner
            .read()
            .map(|_| ())
            .map_err(|_| StoreError::LockPoisoned)
    }

    async fn stats(&self) -> StoreResult<CacheStats> {
        let inner = self.inner.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: inner.entries.len() as u64,
        })
    }
}
