//! End-to-end tests of the request pipeline: cache, breaker, rate limiter and
//! store fallback working together.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{middleware, Extension, Router};
use rampart_core::{
    CircuitState, Clock, ManualClock, RampartConfig, RampartError, RateDecision, RateLimitSpec,
    RouteClass, StoreConfig,
};
use rampart_guard::http::{RETRY_AFTER, X_RATELIMIT_REMAINING};
use rampart_guard::{
    rate_limit_middleware, ClientIdentity, DataSource, Guard, GuardError, GuardRequest,
    GuardResponse, Invalidation, RateLimitState,
};
use rampart_storage::{LmdbStore, SharedStore, StoreSelection};
use rampart_test_utils::{request, resource_class, FailingStore, GuardFixture, ScriptedSource};
use serde_json::json;
use tempfile::TempDir;
use tower::ServiceExt;

fn filtered(identity: &str, class: &str, day: u32) -> GuardRequest {
    let mut req = request(identity, class);
    req.query = req.query.filter("day", day.to_string());
    req
}

#[tokio::test]
async fn test_today_schedule_scenario() {
    let fx = GuardFixture::new(&RampartConfig::default());
    let mut req = request("teacher-1", "todaySchedule");
    req.query = req.query.filter("class_id", "7A");

    let first = fx.guard.handle(req.clone()).await.unwrap();
    assert!(!first.cache_hit);
    assert_eq!(fx.source.calls(), 1);

    fx.clock.advance(Duration::from_secs(60));
    let second = fx.guard.handle(req.clone()).await.unwrap();
    assert!(second.cache_hit);
    assert_eq!(second.payload, first.payload);
    assert_eq!(fx.source.calls(), 1);

    fx.clock.advance(Duration::from_secs(70));
    let third = fx.guard.handle(req).await.unwrap();
    assert!(!third.cache_hit);
    assert_eq!(fx.source.calls(), 2);
    assert_eq!(third.payload["call"], json!(2));
}

#[tokio::test]
async fn test_breaker_trips_after_threshold_and_short_circuits() {
    let fx = GuardFixture::new(&RampartConfig::default());
    fx.source.set_failing(true);

    for day in 0..10 {
        let err = fx
            .guard
            .handle(filtered("admin", "schedules", day))
            .await
            .unwrap_err();
        assert!(matches!(err, RampartError::Dependency(_)), "{err}");
    }
    assert_eq!(fx.guard.breaker().state().await.unwrap(), CircuitState::Open);

    let err = fx
        .guard
        .handle(filtered("admin", "schedules", 10))
        .await
        .unwrap_err();
    assert!(matches!(err, RampartError::CircuitOpen { .. }), "{err}");
    assert_eq!(fx.source.calls(), 10);
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_breaker_recovers_through_half_open() {
    let fx = GuardFixture::new(&RampartConfig::default());
    fx.source.set_failing(true);
    for day in 0..10 {
        let _ = fx.guard.handle(filtered("admin", "schedules", day)).await;
    }
    fx.source.set_failing(false);

    fx.clock.advance(Duration::from_secs(299));
    assert!(matches!(
        fx.guard.handle(filtered("admin", "schedules", 100)).await,
        Err(RampartError::CircuitOpen { .. })
    ));

    fx.clock.advance(Duration::from_secs(1));
    fx.guard
        .handle(filtered("admin", "schedules", 101))
        .await
        .unwrap();
    assert_eq!(fx.guard.breaker().state().await.unwrap(), CircuitState::HalfOpen);

    for day in 102..104 {
        fx.guard
            .handle(filtered("admin", "schedules", day))
            .await
            .unwrap();
    }
    let record = fx.guard.breaker().snapshot().await.unwrap();
    assert_eq!(record.state, CircuitState::Closed);
    assert_eq!(record.consecutive_failures, 0);
}

#[tokio::test]
async fn test_cache_hits_are_served_while_circuit_is_open() {
    let fx = GuardFixture::new(&RampartConfig::default());
    let cached = fx.guard.handle(request("teacher-1", "subjects")).await.unwrap();
    assert!(!cached.cache_hit);

    fx.source.set_failing(true);
    for day in 0..10 {
        let _ = fx.guard.handle(filtered("admin", "schedules", day)).await;
    }
    assert_eq!(fx.guard.breaker().state().await.unwrap(), CircuitState::Open);

    let served = fx.guard.handle(request("teacher-2", "subjects")).await.unwrap();
    assert!(served.cache_hit);
    assert_eq!(served.payload, cached.payload);
}

#[tokio::test]
async fn test_validation_failure_spends_no_budget() {
    let fx = GuardFixture::new(&RampartConfig::default());
    let mut req = request("teacher-1", "users");
    req.query = req.query.paginate(1, 500);

    let err = fx.guard.handle(req).await.unwrap_err();
    assert!(matches!(err, RampartError::Validation(_)));
    assert!(!err.counts_toward_breaker());
    assert_eq!(fx.source.calls(), 0);
    assert!(fx
        .guard
        .limiter()
        .bucket("teacher-1", RouteClass::General)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_rate_limit_applies_before_cache() {
    let mut config = RampartConfig::default();
    config.rate_limits.general = RateLimitSpec::per_minutes(2, 1);
    let fx = GuardFixture::new(&config);

    let first = fx.guard.handle(request("parent-3", "classes")).await.unwrap();
    assert_eq!(first.rate.limit, 2);
    assert_eq!(first.rate.remaining, 1);
    let second = fx.guard.handle(request("parent-3", "classes")).await.unwrap();
    assert!(second.cache_hit);
    assert_eq!(second.rate.remaining, 0);

    fx.clock.advance(Duration::from_secs(20));
    let err = fx
        .guard
        .handle(request("parent-3", "classes"))
        .await
        .unwrap_err();
    assert!(matches!(err, RampartError::RateLimitExceeded { limit: 2, .. }));
    assert_eq!(err.retry_after(), Some(Duration::from_secs(40)));

    // Another client has its own budget.
    assert!(fx.guard.handle(request("parent-4", "classes")).await.is_ok());
}

async fn today_handler(
    State(guard): State<Guard>,
    Extension(rate): Extension<RateDecision>,
) -> Result<GuardResponse, GuardError> {
    Ok(guard
        .handle_admitted(request("teacher-9", "todaySchedule"), rate)
        .await?)
}

#[tokio::test]
async fn test_middleware_and_guard_count_each_request_once() {
    let mut config = RampartConfig::default();
    config.rate_limits.general = RateLimitSpec::per_minutes(2, 1);
    let fx = GuardFixture::new(&config);

    let app = Router::new()
        .route("/schedules/today", get(today_handler))
        .with_state(fx.guard.clone())
        .layer(middleware::from_fn_with_state(
            RateLimitState::from_guard(&fx.guard),
            rate_limit_middleware,
        ))
        .layer(Extension(ClientIdentity("teacher-9".to_string())));
    let call = || {
        app.clone().oneshot(
            axum::http::Request::builder()
                .uri("/schedules/today")
                .body(Body::empty())
                .unwrap(),
        )
    };

    let first = call().await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers()[&X_RATELIMIT_REMAINING], "1");

    let second = call().await.unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(second.headers()[&X_RATELIMIT_REMAINING], "0");

    let third = call().await.unwrap();
    assert_eq!(third.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(third.headers()[&RETRY_AFTER], "60");

    let bucket = fx
        .guard
        .limiter()
        .bucket("teacher-9", RouteClass::General)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bucket.count, 2);
    assert_eq!(fx.source.calls(), 1);
}

#[tokio::test]
async fn test_overload_brake_refuses_everyone() {
    let config = RampartConfig {
        overload_brake: Some(3),
        ..RampartConfig::default()
    };
    let fx = GuardFixture::new(&config);

    for identity in ["a", "b", "c"] {
        fx.guard.handle(request(identity, "teachers")).await.unwrap();
    }
    let err = fx.guard.handle(request("d", "teachers")).await.unwrap_err();
    assert!(matches!(
        &err,
        RampartError::RateLimitExceeded { scope, .. } if scope == "global"
    ));
}

#[tokio::test]
async fn test_invalidate_class_flushes_related_classes() {
    let fx = GuardFixture::new(&RampartConfig::default());
    fx.guard.handle(request("t", "todaySchedule")).await.unwrap();
    fx.guard.handle(request("t", "weeklySchedule")).await.unwrap();
    fx.guard.handle(request("t", "subjects")).await.unwrap();
    assert_eq!(fx.source.calls(), 3);

    let outcome = fx
        .guard
        .invalidate_class(&resource_class("todaySchedule"))
        .await
        .unwrap();
    // todaySchedule and weeklySchedule share "schedules"; subjects shares "academic".
    assert_eq!(outcome, Invalidation::Flushed { removed: 3 });

    let again = fx.guard.handle(request("t", "weeklySchedule")).await.unwrap();
    assert!(!again.cache_hit);

    let tags: BTreeSet<String> = ["master".to_string()].into_iter().collect();
    assert_eq!(
        fx.guard.invalidate(&tags).await.unwrap(),
        Invalidation::Flushed { removed: 0 }
    );
}

#[tokio::test]
async fn test_unreachable_store_computes_through() {
    let clock = ManualClock::at_epoch();
    let store: Arc<dyn SharedStore> = Arc::new(FailingStore);
    let fx = GuardFixture::on_store(&RampartConfig::default(), clock, store);

    for _ in 0..3 {
        let response = fx.guard.handle(request("t", "subjects")).await.unwrap();
        assert!(!response.cache_hit);
    }
    assert_eq!(fx.source.calls(), 3);

    let err = fx
        .guard
        .invalidate_class(&resource_class("subjects"))
        .await
        .unwrap_err();
    assert!(matches!(err, RampartError::Store(_)));
}

#[tokio::test]
async fn test_missing_store_path_runs_degraded() {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::at_epoch());
    let selection = StoreSelection::at_startup(&StoreConfig::default(), Arc::clone(&clock)).await;
    let source: Arc<dyn DataSource> = Arc::new(ScriptedSource::new());
    let guard = Guard::new(&selection, &RampartConfig::default(), source, clock);

    assert!(guard.is_degraded());
    assert!(guard.handle(request("t", "subjects")).await.is_ok());
}

#[tokio::test]
async fn test_workers_share_breaker_and_budget_through_lmdb() {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::at_epoch();
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    let store: Arc<dyn SharedStore> = Arc::new(LmdbStore::open(dir.path(), 16, shared).unwrap());

    let mut config = RampartConfig::default();
    config.rate_limits.general = RateLimitSpec::per_minutes(15, 1);
    let worker_a = GuardFixture::on_store(&config, clock.clone(), Arc::clone(&store));
    let worker_b = GuardFixture::on_store(&config, clock.clone(), Arc::clone(&store));
    assert!(!worker_a.guard.is_degraded());

    worker_a.source.set_failing(true);
    for day in 0..10 {
        let _ = worker_a.guard.handle(filtered("admin", "schedules", day)).await;
    }

    let err = worker_b
        .guard
        .handle(filtered("admin", "schedules", 99))
        .await
        .unwrap_err();
    assert!(matches!(err, RampartError::CircuitOpen { .. }));
    assert_eq!(worker_b.source.calls(), 0);

    // Same client, same budget: 15 requests across both workers.
    for _ in 0..4 {
        let _ = worker_b.guard.handle(request("admin", "subjects")).await;
    }
    let err = worker_a
        .guard
        .handle(request("admin", "subjects"))
        .await
        .unwrap_err();
    assert!(matches!(err, RampartError::RateLimitExceeded { limit: 15, .. }));
}
