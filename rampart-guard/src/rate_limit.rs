//! Fixed-window rate limiting per `(client identity, route class)`.
//!
//! Each subject gets one counter in the shared store that expires at the end
//! of its window. Requests beyond the limit are rejected with the time left
//! until the window resets. A client can still send up to twice the limit
//! across a window boundary; that edge is accepted in exchange for a single
//! counter per subject.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rampart_core::{
    add_duration, elapsed_between, Clock, RampartError, RampartResult, RateBucket, RateDecision,
    RateLimitSpec, RateLimits, RouteClass, StoreResult,
};
use rampart_storage::{Counter, SharedStore};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::metrics::metrics;

const BUCKET_PREFIX: &str = "rate:";

/// Opaque subject key for one client on one route class.
pub fn subject_key(identity: &str, route_class: RouteClass) -> String {
    let mut hasher = Sha256::new();
    hasher.update(identity.as_bytes());
    hasher.update(b"|");
    hasher.update(route_class.as_db_str().as_bytes());
    hex::encode(hasher.finalize())
}

/// Fixed-window limiter backed by the shared store.
#[derive(Clone)]
pub struct FixedWindowLimiter {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    limits: RateLimits,
}

impl FixedWindowLimiter {
    pub fn new(store: Arc<dyn SharedStore>, clock: Arc<dyn Clock>, limits: RateLimits) -> Self {
        Self {
            store,
            clock,
            limits,
        }
    }

    pub fn limit_for(&self, route_class: RouteClass) -> RateLimitSpec {
        self.limits.for_class(route_class)
    }

    /// Admit or reject one request.
    pub async fn check(&self, identity: &str, route_class: RouteClass) -> RampartResult<RateDecision> {
        let spec = self.limits.for_class(route_class);
        let key = format!("{}{}", BUCKET_PREFIX, subject_key(identity, route_class));
        let now = self.clock.now();

        let decision = match self.count(&key, spec, now).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(route_class = %route_class, error = %e, "Rate limit store unavailable, admitting request");
                return Ok(RateDecision {
                    route_class,
                    limit: spec.max,
                    remaining: spec.max,
                    reset_at: add_duration(now, spec.window),
                });
            }
        };

        let allowed = decision.is_ok();
        if let Some(m) = metrics() {
            m.record_rate_decision(route_class.as_db_str(), allowed);
        }

        match decision {
            Ok(counter) => Ok(RateDecision {
                route_class,
                limit: spec.max,
                remaining: spec.max.saturating_sub(clamp_u32(counter.value)),
                reset_at: counter.expires_at,
            }),
            Err(reset_at) => {
                let retry_after = elapsed_between(now, reset_at);
                warn!(
                    route_class = %route_class,
                    limit = spec.max,
                    retry_after_secs = retry_after.as_secs(),
                    "Rate limit exceeded"
                );
                Err(RampartError::RateLimitExceeded {
                    scope: route_class.to_string(),
                    limit: spec.max,
                    retry_after,
                })
            }
        }
    }

    /// `check` without the details.
    pub async fn allow(&self, identity: &str, route_class: RouteClass) -> bool {
        self.check(identity, route_class).await.is_ok()
    }

    /// Inner result is `Err(reset_at)` when the request must be rejected.
    async fn count(
        &self,
        key: &str,
        spec: RateLimitSpec,
        now: DateTime<Utc>,
    ) -> StoreResult<Result<Counter, DateTime<Utc>>> {
        let limit = u64::from(spec.max);

        // A full bucket rejects without incrementing.
        if let Some(stored) = self.store.get(key).await? {
            if let (Some(count), Some(expires_at)) = (stored.as_counter(), stored.expires_at) {
                if count >= limit && now < expires_at {
                    return Ok(Err(expires_at));
                }
            }
        }

        let counter = self.store.incr_with_expiry(key, spec.window).await?;
        if counter.value > limit {
            return Ok(Err(counter.expires_at));
        }
        Ok(Ok(counter))
    }

    /// Current window for a subject, if one is open.
    pub async fn bucket(&self, identity: &str, route_class: RouteClass) -> RampartResult<Option<RateBucket>> {
        let spec = self.limits.for_class(route_class);
        let subject = subject_key(identity, route_class);
        let key = format!("{}{}", BUCKET_PREFIX, subject);

        let Some(stored) = self.store.get(&key).await? else {
            return Ok(None);
        };
        let (Some(count), Some(expires_at)) = (stored.as_counter(), stored.expires_at) else {
            return Ok(None);
        };
        let window = chrono::Duration::from_std(spec.window).unwrap_or(chrono::Duration::MAX);
        Ok(Some(RateBucket {
            subject_key: subject,
            window_start: expires_at.checked_sub_signed(window).unwrap_or(expires_at),
            count,
        }))
    }
}

fn clamp_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

impl std::fmt::Debug for FixedWindowLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedWindowLimiter")
            .field("backend", &self.store.backend_name())
            .field("limits", &self.limits)
            .finish()
    }
}

/// Seconds to advertise in `Retry-After`, never zero.
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
    secs.max(1)
}
