//! Property-Based Tests for Store Semantics
//!
//! **Property: Counter windows**
//!
//! For any sequence of increments interleaved with clock advances, the value
//! returned by `incr_with_expiry` equals the number of increments since the
//! window containing it opened, and both backends agree on every step.
//!
//! **Property: Tag flush scope**
//!
//! Flushing a tag removes exactly the keys written with that tag.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use rampart_core::{Clock, ManualClock};
use rampart_storage::{LmdbStore, MemoryStore, SharedStore};
use tempfile::TempDir;
use tokio::runtime::Runtime;

fn test_runtime() -> Result<Runtime, TestCaseError> {
    Runtime::new().map_err(|e| TestCaseError::fail(format!("Failed to create runtime: {}", e)))
}

#[derive(Debug, Clone)]
enum Step {
    Incr,
    Advance(u64),
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => Just(Step::Incr),
        1 => (1u64..90).prop_map(Step::Advance),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_counter_matches_window_model(steps in prop::collection::vec(step_strategy(), 1..60)) {
        let rt = test_runtime()?;
        let dir = TempDir::new().map_err(|e| TestCaseError::fail(e.to_string()))?;
        let clock = ManualClock::at_epoch();
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());

        let lmdb = LmdbStore::open(dir.path(), 10, Arc::clone(&shared))
            .map_err(|e| TestCaseError::fail(e.to_string()))?;
        let memory = MemoryStore::new(Arc::clone(&shared));
        let window = Duration::from_secs(60);

        // Model: (count, window end)
        let mut model: Option<(u64, chrono::DateTime<chrono::Utc>)> = None;

        for step in steps {
            match step {
                Step::Advance(secs) => clock.advance(Duration::from_secs(secs)),
                Step::Incr => {
                    let now = clock.now();
                    let expected = match model {
                        Some((count, end)) if now < end => (count + 1, end),
                        _ => (1, rampart_core::add_duration(now, window)),
                    };
                    model = Some(expected);

                    let a = rt.block_on(lmdb.incr_with_expiry("rate:k", window))
                        .map_err(|e| TestCaseError::fail(e.to_string()))?;
                    let b = rt.block_on(memory.incr_with_expiry("rate:k", window))
                        .map_err(|e| TestCaseError::fail(e.to_string()))?;

                    prop_assert_eq!(a.value, expected.0);
                    prop_assert_eq!(a.expires_at, expected.1);
                    prop_assert_eq!(a, b, "backends disagree");
                }
            }
        }
    }

    #[test]
    fn prop_tag_flush_removes_exactly_tagged_keys(
        tagged in prop::collection::btree_set("[a-z]{1,8}", 0..10),
        untagged in prop::collection::btree_set("[A-Z]{1,8}", 0..10),
    ) {
        let rt = test_runtime()?;
        let dir = TempDir::new().map_err(|e| TestCaseError::fail(e.to_string()))?;
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::at_epoch());
        let store = LmdbStore::open(dir.path(), 10, clock)
            .map_err(|e| TestCaseError::fail(e.to_string()))?;
        let tag = vec!["schedules".to_string()];

        rt.block_on(async {
            for key in &tagged {
                store.set(key, b"x".to_vec(), None, &tag).await?;
            }
            for key in &untagged {
                store.set(key, b"y".to_vec(), None, &[]).await?;
            }
            Ok::<_, rampart_core::StoreError>(())
        }).map_err(|e| TestCaseError::fail(e.to_string()))?;

        let removed = rt.block_on(store.tag_flush(&tag))
            .map_err(|e| TestCaseError::fail(e.to_string()))?;
        prop_assert_eq!(removed, tagged.len() as u64);

        let mut remaining = BTreeSet::new();
        for key in tagged.iter().chain(untagged.iter()) {
            let found = rt.block_on(store.get(key))
                .map_err(|e| TestCaseError::fail(e.to_string()))?;
            if found.is_some() {
                remaining.insert(key.clone());
            }
        }
        prop_assert_eq!(remaining, untagged);
    }
}
