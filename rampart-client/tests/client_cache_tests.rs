//! Client cache against a live local HTTP server.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use rampart_client::{
    ClientCache, ClientConfig, ClientError, FetchError, Origin, RestFetcher, TTL_SHORT,
};
use rampart_core::ManualClock;
use serde_json::{json, Value};
use tempfile::TempDir;

#[derive(Clone, Default)]
struct Backend {
    down: Arc<AtomicBool>,
    hits: Arc<AtomicU32>,
}

async fn today(State(backend): State<Backend>) -> Response {
    if backend.down.load(Ordering::SeqCst) {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::RETRY_AFTER, "30")],
            Json(json!({ "success": false, "code": "CIRCUIT_OPEN", "message": "circuit open" })),
        )
            .into_response();
    }
    let n = backend.hits.fetch_add(1, Ordering::SeqCst) + 1;
    Json(json!({ "success": true, "data": { "version": n }, "cached": false })).into_response()
}

async fn limited() -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::RETRY_AFTER, "12")],
        Json(json!({ "success": false, "code": "RATE_LIMITED" })),
    )
        .into_response()
}

async fn serve(backend: Backend) -> SocketAddr {
    let app = Router::new()
        .route("/schedules/today", get(today))
        .route("/attendance", get(limited))
        .with_state(backend);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

fn fetcher(addr: SocketAddr, dir: &TempDir) -> RestFetcher {
    let config = ClientConfig::from_toml_str(&format!(
        "api_base_url = \"http://{}\"\ncache_dir = \"{}\"\nrequest_timeout_ms = 2000\n",
        addr,
        dir.path().display()
    ))
    .unwrap();
    config.validate().unwrap();
    RestFetcher::new(&config).unwrap()
}

#[tokio::test]
async fn test_network_then_cache_then_stale_fallback() {
    let backend = Backend::default();
    let addr = serve(backend.clone()).await;
    let dir = TempDir::new().unwrap();
    let fetcher = fetcher(addr, &dir);
    let clock = ManualClock::at_epoch();
    let cache = ClientCache::with_clock(dir.path(), Arc::new(clock.clone()));

    let first = cache
        .read_or_fetch("today", TTL_SHORT, || fetcher.get_data("/schedules/today"))
        .await
        .unwrap();
    assert_eq!(first.origin, Origin::Network);
    let payload: Value = serde_json::from_slice(&first.value).unwrap();
    assert_eq!(payload, json!({ "version": 1 }));

    clock.advance(Duration::from_secs(60));
    let second = cache
        .read_or_fetch("today", TTL_SHORT, || fetcher.get_data("/schedules/today"))
        .await
        .unwrap();
    assert_eq!(second.origin, Origin::Cache);
    assert_eq!(backend.hits.load(Ordering::SeqCst), 1);

    backend.down.store(true, Ordering::SeqCst);
    clock.advance(TTL_SHORT);
    let stale = cache
        .read_or_fetch("today", TTL_SHORT, || fetcher.get_data("/schedules/today"))
        .await
        .unwrap();
    assert_eq!(stale.origin, Origin::StaleFallback);
    assert_eq!(stale.value, first.value);

    let err = cache
        .read_or_fetch("today-other-class", TTL_SHORT, || {
            fetcher.get_data("/schedules/today")
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Fetch(FetchError::Unavailable(_))));

    backend.down.store(false, Ordering::SeqCst);
    let fresh = cache
        .read_or_fetch("today", TTL_SHORT, || fetcher.get_data("/schedules/today"))
        .await
        .unwrap();
    assert_eq!(fresh.origin, Origin::Network);
    let payload: Value = serde_json::from_slice(&fresh.value).unwrap();
    assert_eq!(payload, json!({ "version": 2 }));
}

#[tokio::test]
async fn test_rate_limited_response_carries_retry_after() {
    let addr = serve(Backend::default()).await;
    let dir = TempDir::new().unwrap();
    let fetcher = fetcher(addr, &dir);

    let err = fetcher.get_bytes("attendance").await.unwrap_err();
    assert!(matches!(err, FetchError::RateLimited { retry_after: Some(12) }));
}

#[tokio::test]
async fn test_connection_refused_is_a_fetch_error() {
    let dir = TempDir::new().unwrap();
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let fetcher = fetcher(addr, &dir);

    let cache = ClientCache::new(dir.path().join("cache"));
    let err = cache
        .read_or_fetch("users", TTL_SHORT, || fetcher.get_data("users"))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Fetch(_)));
}

#[tokio::test]
async fn test_configured_ttl_table_drives_freshness() {
    let backend = Backend::default();
    let addr = serve(backend.clone()).await;
    let dir = TempDir::new().unwrap();
    let config = ClientConfig::from_toml_str(&format!(
        "api_base_url = \"http://{}\"\ncache_dir = \"{}\"\nrequest_timeout_ms = 2000\n\n[ttl]\nshort_secs = 30\nlong_secs = 600\n",
        addr,
        dir.path().display()
    ))
    .unwrap();
    config.validate().unwrap();
    let fetcher = RestFetcher::new(&config).unwrap();
    let clock = ManualClock::at_epoch();
    let cache = ClientCache::with_clock(&config.cache_dir, Arc::new(clock.clone()));

    cache
        .read_or_fetch("today", config.ttl.short(), || fetcher.get_data("/schedules/today"))
        .await
        .unwrap();

    clock.advance(Duration::from_secs(31));
    assert!(!cache.is_valid("today", config.ttl.short()).await);
    assert!(cache.is_valid("today", config.ttl.long()).await);
    let refreshed = cache
        .read_or_fetch("today", config.ttl.short(), || fetcher.get_data("/schedules/today"))
        .await
        .unwrap();
    assert_eq!(refreshed.origin, Origin::Network);
    assert_eq!(backend.hits.load(Ordering::SeqCst), 2);
}
