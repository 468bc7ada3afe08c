//! Prometheus Metrics Definitions
//!
//! Cache, breaker and rate-limit counters plus the degraded-store gauge.
//! Registered once in the default registry on first use.

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter_vec, register_int_gauge, Encoder, IntCounterVec, IntGauge, TextEncoder,
};

/// Global metrics instance - initialized once on first access
pub static METRICS: Lazy<Result<RampartMetrics, prometheus::Error>> = Lazy::new(RampartMetrics::new);

/// The registered metrics, or `None` if registration failed.
pub fn metrics() -> Option<&'static RampartMetrics> {
    METRICS.as_ref().ok()
}

/// Container for all rampart metrics.
#[derive(Clone)]
pub struct RampartMetrics {
    /// Cache lookups - labels: resource_class, outcome (hit/miss/error)
    pub cache_lookups_total: IntCounterVec,

    /// Breaker transitions - labels: name, to_state
    pub breaker_transitions_total: IntCounterVec,

    /// Calls refused by an open breaker - labels: name
    pub breaker_rejections_total: IntCounterVec,

    /// Rate-limit decisions - labels: route_class, outcome (allowed/rejected)
    pub rate_limit_decisions_total: IntCounterVec,

    /// 1 while this process runs on the process-local fallback store
    pub store_degraded: IntGauge,
}

impl RampartMetrics {
    /// Create and register all metrics with Prometheus.
    pub fn new() -> Result<Self, prometheus::Error> {
        Ok(Self {
            cache_lookups_total: register_int_counter_vec!(
                "rampart_cache_lookups_total",
                "Response cache lookups by resource class and outcome",
                &["resource_class", "outcome"]
            )?,
            breaker_transitions_total: register_int_counter_vec!(
                "rampart_breaker_transitions_total",
                "Circuit breaker state transitions",
                &["name", "to_state"]
            )?,
            breaker_rejections_total: register_int_counter_vec!(
                "rampart_breaker_rejections_total",
                "Calls short-circuited by an open breaker",
                &["name"]
            )?,
            rate_limit_decisions_total: register_int_counter_vec!(
                "rampart_rate_limit_decisions_total",
                "Rate limiter decisions by route class",
                &["route_class", "outcome"]
            )?,
            store_degraded: register_int_gauge!(
                "rampart_store_degraded",
                "1 when running on the process-local fallback store"
            )?,
        })
    }

    pub fn record_cache_lookup(&self, resource_class: &str, outcome: &str) {
        self.cache_lookups_total
            .with_label_values(&[resource_class, outcome])
            .inc();
    }

    pub fn record_breaker_transition(&self, name: &str, to_state: &str) {
        self.breaker_transitions_total
            .with_label_values(&[name, to_state])
            .inc();
    }

    pub fn record_breaker_rejection(&self, name: &str) {
        self.breaker_rejections_total.with_label_values(&[name]).inc();
    }

    pub fn record_rate_decision(&self, route_class: &str, allowed: bool) {
        let outcome = if allowed { "allowed" } else { "rejected" };
        self.rate_limit_decisions_total
            .with_label_values(&[route_class, outcome])
            .inc();
    }

    pub fn set_store_degraded(&self, degraded: bool) {
        self.store_degraded.set(i64::from(degraded));
    }
}

/// Render every registered metric in the Prometheus text format.
pub fn render_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
