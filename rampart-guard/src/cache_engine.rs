//! TTL response cache over the shared store.
//!
//! Reads never return an entry whose `created_at + ttl` has passed. A miss
//! computes synchronously and stores the result under the resource class's
//! TTL and tags; there is no background refresh.
//!
//! The shared store being unreachable is not a request failure: reads treat
//! it as a miss and compute through, writes are dropped with a warning.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rampart_core::{add_duration, Clock, RampartResult, ResourceCatalog, StoreError};
use rampart_storage::SharedStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::cache_key::{CacheKey, QueryShape};
use crate::metrics::metrics;

/// A cached response as persisted in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn expires_at(&self) -> DateTime<Utc> {
        add_duration(self.created_at, self.ttl)
    }

    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at()
    }
}

/// Result of a cache read.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRead {
    pub payload: Value,
    pub hit: bool,
    pub key: CacheKey,
    /// When the payload was computed.
    pub created_at: DateTime<Utc>,
}

/// What an invalidation actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invalidation {
    Flushed { removed: u64 },
    /// The store cannot flush by tag; entries age out by TTL instead.
    Skipped,
}

/// Response cache keyed by query shape.
#[derive(Clone)]
pub struct ResponseCache {
    store: Arc<dyn SharedStore>,
    catalog: Arc<ResourceCatalog>,
    clock: Arc<dyn Clock>,
}

impl ResponseCache {
    pub fn new(
        store: Arc<dyn SharedStore>,
        catalog: Arc<ResourceCatalog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            catalog,
            clock,
        }
    }

    pub fn catalog(&self) -> &ResourceCatalog {
        &self.catalog
    }

    /// Serve from cache, or compute and store.
    pub async fn get<F, Fut>(&self, query: &QueryShape, compute: F) -> RampartResult<CacheRead>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RampartResult<Value>>,
    {
        let key = query.cache_key();
        if let Some(entry) = self.lookup(query, &key).await {
            return Ok(CacheRead {
                payload: entry.payload,
                hit: true,
                key,
                created_at: entry.created_at,
            });
        }

        let payload = compute().await?;
        let created_at = self.put(query, &key, &payload).await;
        Ok(CacheRead {
            payload,
            hit: false,
            key,
            created_at,
        })
    }

    /// Fresh entry for `query`, if any. Store trouble reads as a miss.
    pub async fn peek(&self, query: &QueryShape) -> Option<CacheEntry> {
        self.lookup(query, &query.cache_key()).await
    }

    async fn lookup(&self, query: &QueryShape, key: &CacheKey) -> Option<CacheEntry> {
        let class = query.resource_class.as_str();
        let outcome = match self.store.get(key.as_str()).await {
            Ok(Some(stored)) => match serde_json::from_slice::<CacheEntry>(&stored.bytes) {
                Ok(entry) if entry.is_fresh(self.clock.now()) => Some(entry),
                Ok(_) => None,
                Err(e) => {
                    warn!(key = %key, error = %e, "Discarding unreadable cache entry");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(key = %key, error = %e, "Cache store read failed, computing through");
                if let Some(m) = metrics() {
                    m.record_cache_lookup(class, "error");
                }
                return None;
            }
        };

        if let Some(m) = metrics() {
            m.record_cache_lookup(class, if outcome.is_some() { "hit" } else { "miss" });
        }
        match &outcome {
            Some(_) => debug!(key = %key, "Cache hit"),
            None => debug!(key = %key, "Cache miss"),
        }
        outcome
    }

    async fn put(&self, query: &QueryShape, key: &CacheKey, payload: &Value) -> DateTime<Utc> {
        let policy = self.catalog.policy(query.resource_class.as_str());
        let entry = CacheEntry {
            key: key.to_string(),
            payload: payload.clone(),
            created_at: self.clock.now(),
            ttl: policy.ttl,
        };
        let created_at = entry.created_at;
        let tags: Vec<String> = policy.tags.iter().cloned().collect();

        let written = match serde_json::to_vec(&entry) {
            Ok(bytes) => self
                .store
                .set(key.as_str(), bytes, Some(policy.ttl), &tags)
                .await,
            Err(e) => Err(StoreError::Serialization {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        };
        if let Err(e) = written {
            warn!(key = %key, error = %e, "Cache store write failed, response not cached");
        }
        created_at
    }

    /// Flush every entry carrying any of `tags`.
    ///
    /// Without tag support this logs and returns [`Invalidation::Skipped`];
    /// callers must not assume read-after-write consistency in that mode.
    pub async fn invalidate(&self, tags: &BTreeSet<String>) -> RampartResult<Invalidation> {
        if tags.is_empty() {
            return Ok(Invalidation::Flushed { removed: 0 });
        }
        if !self.store.supports_tags() {
            warn!(
                backend = self.store.backend_name(),
                tags = ?tags,
                "Store cannot flush by tag, relying on TTL expiry"
            );
            return Ok(Invalidation::Skipped);
        }

        let tags: Vec<String> = tags.iter().cloned().collect();
        let removed = self.store.tag_flush(&tags).await?;
        debug!(tags = ?tags, removed, "Invalidated cached responses");
        Ok(Invalidation::Flushed { removed })
    }

    /// Drop the single entry for `query`.
    pub async fn forget(&self, query: &QueryShape) -> RampartResult<bool> {
        Ok(self.store.delete(query.cache_key().as_str()).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rampart_core::{ManualClock, RampartError, ResourceClass};
    use rampart_storage::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn cache_with(tags: bool) -> (ResponseCache, ManualClock) {
        let clock = ManualClock::at_epoch();
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let store = MemoryStore::with_tag_support(Arc::clone(&shared), tags);
        let cache = ResponseCache::new(
            Arc::new(store),
            Arc::new(ResourceCatalog::default()),
            shared,
        );
        (cache, clock)
    }

    fn today() -> QueryShape {
        QueryShape::new(ResourceClass::new("todaySchedule").unwrap()).filter("class_id", "7")
    }

    #[tokio::test]
    async fn test_miss_then_hit_then_expiry() {
        let (cache, clock) = cache_with(true);
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let compute = move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({ "version": n }))
        };

        let first = cache.get(&today(), compute).await.unwrap();
        assert!(!first.hit);

        clock.advance(Duration::from_secs(60));
        let second = cache.get(&today(), compute).await.unwrap();
        assert!(second.hit);
        assert_eq!(second.payload, first.payload);

        clock.advance(Duration::from_secs(60));
        let third = cache.get(&today(), compute).await.unwrap();
        assert!(!third.hit, "read at created_at + ttl must recompute");
        assert_eq!(third.payload, json!({ "version": 1 }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_compute_error_is_not_cached() {
        let (cache, _clock) = cache_with(true);
        let err = cache
            .get(&today(), || async {
                Err(RampartError::Dependency(
                    rampart_core::DependencyError::Connection {
                        dependency: "database".to_string(),
                        reason: "refused".to_string(),
                    },
                ))
            })
            .await
            .unwrap_err();
        assert!(err.counts_toward_breaker());
        assert!(cache.peek(&today()).await.is_none());
    }

    #[tokio::test]
    async fn test_invalidate_by_tag() {
        let (cache, _clock) = cache_with(true);
        cache.get(&today(), || async { Ok(json!([1])) }).await.unwrap();
        let teachers = QueryShape::new(ResourceClass::new("teachers").unwrap());
        cache.get(&teachers, || async { Ok(json!([2])) }).await.unwrap();

        let tags: BTreeSet<String> = ["schedules".to_string()].into_iter().collect();
        let outcome = cache.invalidate(&tags).await.unwrap();
        assert_eq!(outcome, Invalidation::Flushed { removed: 1 });
        assert!(cache.peek(&today()).await.is_none());
        assert!(cache.peek(&teachers).await.is_some());
    }

    #[tokio::test]
    async fn test_invalidate_without_tag_support_is_skipped() {
        let (cache, _clock) = cache_with(false);
        cache.get(&today(), || async { Ok(json!([1])) }).await.unwrap();

        let tags: BTreeSet<String> = ["schedules".to_string()].into_iter().collect();
        assert_eq!(cache.invalidate(&tags).await.unwrap(), Invalidation::Skipped);
        assert!(cache.peek(&today()).await.is_some());
    }

    #[tokio::test]
    async fn test_forget_single_entry() {
        let (cache, _clock) = cache_with(true);
        cache.get(&today(), || async { Ok(json!([1])) }).await.unwrap();
        assert!(cache.forget(&today()).await.unwrap());
        assert!(cache.peek(&today()).await.is_none());
    }
}
