//! Rampart Test Utilities
//!
//! Shared test infrastructure for the rampart workspace:
//! - Scripted data sources that count calls and fail on demand
//! - A store whose every operation fails
//! - Proptest generators for query shapes and route classes
//! - A ready-made guard fixture on a manual clock

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rampart_core::{
    Clock, DependencyError, ManualClock, RampartConfig, RampartError, RampartResult, StoreError,
    StoreResult, ValidationError,
};
use rampart_guard::{DataSource, Guard, GuardRequest, QueryShape, DATA_SOURCE_BREAKER};
use rampart_storage::{CacheStats, Counter, MemoryStore, SharedStore, StoreSelection, StoredValue};
use serde_json::{json, Value};

// Re-export core types for convenience
pub use rampart_core::{ResourceClass, RouteClass};

// ============================================================================
// SCRIPTED DATA SOURCE
// ============================================================================

/// One scripted reaction of a [`ScriptedSource`].
#[derive(Debug, Clone)]
pub enum Step {
    Respond(Value),
    /// Dependency-level failure (counts toward the breaker).
    Fail,
    /// Caller-input failure (never counts toward the breaker).
    Reject,
    /// Never completes; only a timeout ends the call.
    Hang,
}

/// Data source that replays a script, then answers with a default payload.
///
/// The default payload echoes the resource class and the call number, so
/// tests can tell a recomputed response from a cached one.
#[derive(Debug, Default)]
pub struct ScriptedSource {
    script: Mutex<VecDeque<Step>>,
    failing: AtomicBool,
    calls: AtomicU32,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, step: Step) -> &Self {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(step);
        self
    }

    pub fn fail_next(&self, n: usize) -> &Self {
        for _ in 0..n {
            self.push(Step::Fail);
        }
        self
    }

    /// Fail every call once the script is exhausted.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of times `compute` has been invoked.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> Option<Step> {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }
}

pub fn dependency_failure() -> RampartError {
    RampartError::Dependency(DependencyError::Server {
        dependency: DATA_SOURCE_BREAKER.to_string(),
        status: 500,
        message: "scripted failure".to_string(),
    })
}

#[async_trait]
impl DataSource for ScriptedSource {
    async fn compute(&self, query: &QueryShape) -> RampartResult<Value> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        match self.next_step() {
            Some(Step::Respond(value)) => Ok(value),
            Some(Step::Fail) => Err(dependency_failure()),
            Some(Step::Reject) => Err(RampartError::Validation(ValidationError::InvalidValue {
                field: "filters".to_string(),
                reason: "scripted rejection".to_string(),
            })),
            Some(Step::Hang) => std::future::pending().await,
            None if self.failing.load(Ordering::SeqCst) => Err(dependency_failure()),
            None => Ok(json!({
                "resource_class": query.resource_class.as_str(),
                "call": call,
            })),
        }
    }
}

// ============================================================================
// FAILING STORE
// ============================================================================

/// Store that is never reachable.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingStore;

impl FailingStore {
    fn down<T>() -> StoreResult<T> {
        Err(StoreError::Unavailable {
            backend: "failing".to_string(),
            reason: "connection refused".to_string(),
        })
    }
}

#[async_trait]
impl SharedStore for FailingStore {
    fn backend_name(&self) -> &'static str {
        "failing"
    }

    fn supports_tags(&self) -> bool {
        true
    }

    fn is_shared(&self) -> bool {
        true
    }

    async fn get(&self, _key: &str) -> StoreResult<Option<StoredValue>> {
        Self::down()
    }

    async fn set(
        &self,
        _key: &str,
        _value: Vec<u8>,
        _ttl: Option<Duration>,
        _tags: &[String],
    ) -> StoreResult<()> {
        Self::down()
    }

    async fn delete(&self, _key: &str) -> StoreResult<bool> {
        Self::down()
    }

    async fn incr_with_expiry(&self, _key: &str, _ttl: Duration) -> StoreResult<Counter> {
        Self::down()
    }

    async fn tag_flush(&self, _tags: &[String]) -> StoreResult<u64> {
        Self::down()
    }

    async fn purge_expired(&self) -> StoreResult<u64> {
        Self::down()
    }

    async fn ping(&self) -> StoreResult<()> {
        Self::down()
    }

    async fn stats(&self) -> StoreResult<CacheStats> {
        Self::down()
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

/// A guard over a fresh memory store, driven by a manual clock.
pub struct GuardFixture {
    pub guard: Guard,
    pub clock: ManualClock,
    pub source: Arc<ScriptedSource>,
    pub store: Arc<dyn SharedStore>,
}

impl GuardFixture {
    pub fn new(config: &RampartConfig) -> Self {
        let clock = ManualClock::at_epoch();
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new(Arc::clone(&shared)));
        Self::on_store(config, clock, store)
    }

    /// Build on an existing store; `clock` must be the one the store uses.
    pub fn on_store(config: &RampartConfig, clock: ManualClock, store: Arc<dyn SharedStore>) -> Self {
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let source = Arc::new(ScriptedSource::new());
        let selection = StoreSelection::from_store(Arc::clone(&store));
        let guard = Guard::new(
            &selection,
            config,
            Arc::clone(&source) as Arc<dyn DataSource>,
            shared,
        );
        Self {
            guard,
            clock,
            source,
            store,
        }
    }
}

/// A request for `class` from `identity` on the general route class.
pub fn request(identity: &str, class: &str) -> GuardRequest {
    GuardRequest {
        client_identity: identity.to_string(),
        route_class: RouteClass::General,
        query: QueryShape::new(resource_class(class)),
    }
}

/// A resource class known to be valid.
///
/// # Panics
///
/// Panics if `name` is not a valid resource class.
pub fn resource_class(name: &str) -> ResourceClass {
    ResourceClass::new(name).expect("test resource class should be valid")
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    use super::*;
    use proptest::collection::vec;
    use proptest::prelude::*;

    const KNOWN_CLASSES: [&str; 6] = [
        "todaySchedule",
        "weeklySchedule",
        "scheduleStats",
        "subjects",
        "teachers",
        "classrooms",
    ];

    pub fn arb_resource_class() -> impl Strategy<Value = ResourceClass> {
        prop_oneof![
            prop::sample::select(KNOWN_CLASSES.to_vec()).prop_map(resource_class),
            "[a-z][A-Za-z0-9_]{0,20}".prop_map(|name| resource_class(&name)),
        ]
    }

    pub fn arb_route_class() -> impl Strategy<Value = RouteClass> {
        prop::sample::select(RouteClass::ALL.to_vec())
    }

    /// Filter pairs with distinct names. Values include the key separators.
    pub fn arb_filters() -> impl Strategy<Value = Vec<(String, String)>> {
        prop::collection::btree_map("[a-z_]{1,12}", "[A-Za-z0-9:=\\\\ -]{0,24}", 0..6)
            .prop_map(|filters| filters.into_iter().collect())
    }

    pub fn arb_query_shape() -> impl Strategy<Value = QueryShape> {
        (
            arb_resource_class(),
            any::<bool>(),
            arb_filters(),
            prop::option::of((1u32..50, 1u32..=100)),
        )
            .prop_map(|(class, relations, filters, page)| {
                let mut query = QueryShape::new(class).with_relations(relations);
                for (name, value) in filters {
                    query = query.filter(name, value);
                }
                if let Some((page, per_page)) = page {
                    query = query.paginate(page, per_page);
                }
                query
            })
    }

    /// Outcomes for a breaker run: `true` is a success.
    pub fn arb_outcomes(max_len: usize) -> impl Strategy<Value = Vec<bool>> {
        vec(any::<bool>(), 0..max_len)
    }
}
