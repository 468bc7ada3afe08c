//! Boot-time store selection.
//!
//! The choice between the shared store and the process-local fallback is made
//! once, when the process starts. A store that becomes unreachable later is
//! not swapped out; callers see `StoreError`s and degrade per request instead.
//!
//! Whichever store is chosen, [`StoreSelection::spawn_purger`] sweeps its
//! expired entries on a fixed interval.

use std::sync::Arc;
use std::time::Duration;

use rampart_core::{Clock, StoreConfig};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::lmdb::LmdbStore;
use crate::memory::MemoryStore;
use crate::traits::SharedStore;

/// Which kind of store this process ended up with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreMode {
    /// Every worker shares one store.
    Shared,
    /// Process-local fallback; limits and breaker state are per process.
    Degraded { reason: String },
}

/// The store chosen at startup.
#[derive(Clone)]
pub struct StoreSelection {
    store: Arc<dyn SharedStore>,
    mode: StoreMode,
}

impl StoreSelection {
    /// Open the configured shared store, falling back to a process-local one.
    ///
    /// The fallback keeps tag support so invalidation stays functional inside
    /// the process.
    pub async fn at_startup(config: &StoreConfig, clock: Arc<dyn Clock>) -> Self {
        let Some(path) = config.path.as_ref() else {
            warn!("No shared store path configured, using process-local store");
            return Self::degraded(clock, "no shared store configured".to_string());
        };

        let opened = LmdbStore::open(path, config.map_size_mb, Arc::clone(&clock));
        let store = match opened {
            Ok(store) => store,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Shared store unavailable, using process-local store");
                return Self::degraded(clock, e.to_string());
            }
        };

        if let Err(e) = store.ping().await {
            warn!(path = %path.display(), error = %e, "Shared store failed health check, using process-local store");
            return Self::degraded(clock, e.to_string());
        }

        info!(path = %path.display(), "Using shared LMDB store");
        Self {
            store: Arc::new(store),
            mode: StoreMode::Shared,
        }
    }

    /// Wrap an already constructed store.
    pub fn from_store(store: Arc<dyn SharedStore>) -> Self {
        let mode = if store.is_shared() {
            StoreMode::Shared
        } else {
            StoreMode::Degraded {
                reason: format!("{} store is process-local", store.backend_name()),
            }
        };
        Self { store, mode }
    }

    fn degraded(clock: Arc<dyn Clock>, reason: String) -> Self {
        Self {
            store: Arc::new(MemoryStore::new(clock)),
            mode: StoreMode::Degraded { reason },
        }
    }

    pub fn store(&self) -> Arc<dyn SharedStore> {
        Arc::clone(&self.store)
    }

    pub fn mode(&self) -> &StoreMode {
        &self.mode
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self.mode, StoreMode::Degraded { .. })
    }

    /// Purge expired entries every `every` until `shutdown` turns true or its
    /// sender is dropped.
    ///
    /// Use [`StoreConfig::purge_interval`] for `every`.
    pub fn spawn_purger(&self, every: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(
                backend = store.backend_name(),
                interval_secs = every.as_secs(),
                "Store purge task started"
            );

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Store purge task shutting down");
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        match store.purge_expired().await {
                            Ok(0) => {}
                            Ok(removed) => debug!(removed, "Purged expired store entries"),
                            Err(e) => warn!(error = %e, "Store purge failed"),
                        }
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for StoreSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreSelection")
            .field("backend", &self.store.backend_name())
            .field("mode", &self.mode)
            .finish()
    }
}
