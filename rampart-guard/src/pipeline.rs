//! Request pipeline: validation, overload brake, rate limit, cache, breaker.
//!
//! ```text
//! request ─▶ validate ─▶ brake ─▶ rate limit ─▶ cache ─┬─ hit ─▶ payload
//!                                                      └─ miss ─▶ breaker ─▶ DataSource
//! ```
//!
//! Cache hits are served even while the breaker is open; the breaker only
//! gates the dependency call a miss would make.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use rampart_core::{
    Clock, RampartConfig, RampartResult, RateDecision, ResourceClass, RouteClass,
};
use rampart_storage::StoreSelection;
use serde_json::Value;
use tracing::{debug, warn};

use crate::brake::OverloadBrake;
use crate::breaker::CircuitBreaker;
use crate::cache_engine::{Invalidation, ResponseCache};
use crate::cache_key::QueryShape;
use crate::metrics::metrics;
use crate::rate_limit::FixedWindowLimiter;

/// Name under which the data-access breaker is stored.
pub const DATA_SOURCE_BREAKER: &str = "database";

/// The data-access boundary: computes a result for a query.
#[async_trait]
pub trait DataSource: Send + Sync {
    async fn compute(&self, query: &QueryShape) -> RampartResult<Value>;
}

/// A resolved inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardRequest {
    pub client_identity: String,
    pub route_class: RouteClass,
    pub query: QueryShape,
}

/// Payload plus the metadata the HTTP layer reports.
#[derive(Debug, Clone, PartialEq)]
pub struct GuardResponse {
    pub payload: Value,
    pub cache_hit: bool,
    pub rate: RateDecision,
}

/// The assembled resilience layer for one process.
#[derive(Clone)]
pub struct Guard {
    cache: ResponseCache,
    breaker: CircuitBreaker,
    limiter: FixedWindowLimiter,
    brake: Option<OverloadBrake>,
    source: Arc<dyn DataSource>,
    max_page_size: u32,
    degraded: bool,
}

impl Guard {
    pub fn new(
        selection: &StoreSelection,
        config: &RampartConfig,
        source: Arc<dyn DataSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let store = selection.store();
        let degraded = selection.is_degraded();
        if degraded {
            warn!(
                mode = ?selection.mode(),
                "Running on a process-local store: rate limits and breaker state are per process"
            );
        }
        if let Some(m) = metrics() {
            m.set_store_degraded(degraded);
        }

        Self {
            cache: ResponseCache::new(
                Arc::clone(&store),
                Arc::new(config.catalog.clone()),
                Arc::clone(&clock),
            ),
            breaker: CircuitBreaker::new(
                DATA_SOURCE_BREAKER,
                Arc::clone(&store),
                Arc::clone(&clock),
                config.breaker.clone(),
            ),
            limiter: FixedWindowLimiter::new(
                Arc::clone(&store),
                Arc::clone(&clock),
                config.rate_limits.clone(),
            ),
            brake: config
                .overload_brake
                .map(|max| OverloadBrake::new(Arc::clone(&store), Arc::clone(&clock), max)),
            source,
            max_page_size: config.max_page_size,
            degraded,
        }
    }

    pub async fn handle(&self, request: GuardRequest) -> RampartResult<GuardResponse> {
        request.query.validate(self.max_page_size)?;
        let rate = self
            .admit(&request.client_identity, request.route_class)
            .await?;
        self.serve(request, rate).await
    }

    /// Serve a request that [`rate_limit_middleware`](crate::rate_limit_middleware)
    /// already admitted.
    ///
    /// The middleware stores its [`RateDecision`] in the request extensions;
    /// passing it here skips the brake and the limiter so the request is
    /// counted once.
    pub async fn handle_admitted(
        &self,
        request: GuardRequest,
        rate: RateDecision,
    ) -> RampartResult<GuardResponse> {
        request.query.validate(self.max_page_size)?;
        self.serve(request, rate).await
    }

    /// Overload brake, then the per-client limiter.
    pub async fn admit(
        &self,
        identity: &str,
        route_class: RouteClass,
    ) -> RampartResult<RateDecision> {
        if let Some(brake) = &self.brake {
            brake.check().await?;
        }
        self.limiter.check(identity, route_class).await
    }

    async fn serve(&self, request: GuardRequest, rate: RateDecision) -> RampartResult<GuardResponse> {
        let source = Arc::clone(&self.source);
        let query = request.query.clone();
        let read = self
            .cache
            .get(&request.query, || {
                self.breaker
                    .call(move || async move { source.compute(&query).await })
            })
            .await?;

        debug!(
            resource_class = %request.query.resource_class,
            hit = read.hit,
            "Request served"
        );
        Ok(GuardResponse {
            payload: read.payload,
            cache_hit: read.hit,
            rate,
        })
    }

    /// Flush cached responses after a write.
    pub async fn invalidate(&self, tags: &BTreeSet<String>) -> RampartResult<Invalidation> {
        self.cache.invalidate(tags).await
    }

    /// Flush everything sharing a tag with `class`.
    pub async fn invalidate_class(&self, class: &ResourceClass) -> RampartResult<Invalidation> {
        let tags = self.cache.catalog().tags(class).clone();
        self.cache.invalidate(&tags).await
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn limiter(&self) -> &FixedWindowLimiter {
        &self.limiter
    }

    pub fn brake(&self) -> Option<&OverloadBrake> {
        self.brake.as_ref()
    }
}

impl std::fmt::Debug for Guard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Guard")
            .field("breaker", &self.breaker)
            .field("limiter", &self.limiter)
            .field("brake", &self.brake.is_some())
            .field("max_page_size", &self.max_page_size)
            .field("degraded", &self.degraded)
            .finish()
    }
}
