//! Rampart Guard - resilience and caching for a polled school-administration API
//!
//! Protects the data-access layer from a fleet of polling mobile clients:
//!
//! - [`ResponseCache`]: TTL response cache keyed by query shape, with
//!   tag-based invalidation
//! - [`CircuitBreaker`]: three-state breaker whose state lives in the shared
//!   store
//! - [`FixedWindowLimiter`]: per-client, per-route-class request budgets
//! - [`OverloadBrake`]: optional fleet-wide request ceiling
//! - [`Guard`]: all of the above assembled into one request pipeline
//!
//! Every component receives the shared store explicitly; see
//! [`rampart_storage::StoreSelection`] for how a process picks it.

pub mod brake;
pub mod breaker;
pub mod cache_engine;
pub mod cache_key;
pub mod http;
pub mod metrics;
pub mod pipeline;
pub mod rate_limit;
pub mod telemetry;

pub use brake::OverloadBrake;
pub use breaker::{CallOutcome, CircuitBreaker, Permit};
pub use cache_engine::{CacheEntry, CacheRead, Invalidation, ResponseCache};
pub use cache_key::{CacheKey, QueryShape};
pub use http::{
    apply_rate_headers, rate_limit_middleware, status_code, ClientIdentity, GuardError,
    RateLimitState,
};
pub use metrics::{metrics, render_metrics, RampartMetrics};
pub use pipeline::{DataSource, Guard, GuardRequest, GuardResponse, DATA_SOURCE_BREAKER};
pub use rate_limit::{subject_key, FixedWindowLimiter};
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig};
