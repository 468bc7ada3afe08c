//! Circuit breaker whose state lives in the shared store.
//!
//! Every worker reads and writes the same [`CircuitRecord`], so a dependency
//! that fails in one process is short-circuited in all of them. Transitions
//! are read-modify-write without a global lock: under concurrency a few extra
//! half-open probes may be admitted, which is accepted.
//!
//! # States
//!
//! - `Closed`: calls pass. Consecutive dependency failures are counted and
//!   the circuit opens at `failure_threshold`; any success resets the count.
//! - `Open`: calls fail fast with [`RampartError::CircuitOpen`]. The first
//!   call after `recovery_timeout` moves the circuit to `HalfOpen`.
//! - `HalfOpen`: up to `half_open_max_calls` probes run. One failure reopens;
//!   once that many probes have succeeded the circuit closes. Probes that
//!   never settle (a worker died mid-call) are abandoned once the episode is
//!   older than `recovery_timeout`, and a fresh episode starts.
//!
//! Only errors for which [`RampartError::counts_toward_breaker`] is true move
//! the state. A store error while loading or saving the record fails open:
//! the call is admitted and a warning is logged.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rampart_core::{
    elapsed_between, BreakerConfig, CircuitRecord, CircuitState, Clock, DependencyError,
    RampartError, RampartResult, StoreError, StoreResult,
};
use rampart_storage::SharedStore;
use tracing::{info, warn};

use crate::metrics::metrics;

const RECORD_PREFIX: &str = "circuit:";

/// Admission ticket returned by [`CircuitBreaker::acquire`].
///
/// Hand it back through [`CircuitBreaker::settle`] once the call finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    /// Admitted while closed.
    Closed,
    /// Admitted as a probe of the half-open episode that began at `episode`.
    Probe { episode: DateTime<Utc> },
    /// Admitted without reading the record (store unavailable).
    Untracked,
}

/// How a permitted call ended, from the breaker's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    /// Dependency-level failure.
    Failure,
    /// Failed for a reason unrelated to the dependency's health.
    Neutral,
}

impl CallOutcome {
    pub fn of<T>(result: &RampartResult<T>) -> Self {
        match result {
            Ok(_) => Self::Success,
            Err(e) if e.counts_toward_breaker() => Self::Failure,
            Err(_) => Self::Neutral,
        }
    }
}

/// Shared-state circuit breaker for one named dependency.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    config: BreakerConfig,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
        config: BreakerConfig,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            clock,
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn record_key(&self) -> String {
        format!("{}{}", RECORD_PREFIX, self.name)
    }

    async fn load(&self) -> StoreResult<CircuitRecord> {
        let key = self.record_key();
        match self.store.get(&key).await? {
            Some(stored) => serde_json::from_slice(&stored.bytes).or_else(|e| {
                warn!(breaker = %self.name, error = %e, "Unreadable circuit record, treating as closed");
                Ok(CircuitRecord::closed(&self.name))
            }),
            None => Ok(CircuitRecord::closed(&self.name)),
        }
    }

    async fn save(&self, record: &CircuitRecord) -> StoreResult<()> {
        let key = self.record_key();
        let bytes = serde_json::to_vec(record).map_err(|e| StoreError::Serialization {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        self.store.set(&key, bytes, None, &[]).await
    }

    fn transitioned(&self, to: CircuitState) {
        info!(breaker = %self.name, state = %to, "Circuit breaker transition");
        if let Some(m) = metrics() {
            m.record_breaker_transition(&self.name, to.as_db_str());
        }
    }

    fn rejected(&self, retry_after: Duration) -> RampartError {
        if let Some(m) = metrics() {
            m.record_breaker_rejection(&self.name);
        }
        RampartError::CircuitOpen {
            name: self.name.clone(),
            retry_after,
        }
    }

    /// Decide whether a call may proceed.
    pub async fn acquire(&self) -> RampartResult<Permit> {
        let mut record = match self.load().await {
            Ok(record) => record,
            Err(e) => {
                warn!(breaker = %self.name, error = %e, "Circuit state unavailable, admitting call");
                return Ok(Permit::Untracked);
            }
        };
        let now = self.clock.now();

        match record.state {
            CircuitState::Closed => Ok(Permit::Closed),
            CircuitState::Open => {
                let opened_at = record.opened_at.unwrap_or(now);
                let elapsed = elapsed_between(opened_at, now);
                if elapsed < self.config.recovery_timeout {
                    return Err(self.rejected(self.config.recovery_timeout - elapsed));
                }
                record.opened_at = Some(opened_at);
                record.enter_half_open(now);
                record.half_open_probes_in_flight = 1;
                self.persist(&record).await;
                self.transitioned(CircuitState::HalfOpen);
                Ok(Permit::Probe { episode: now })
            }
            CircuitState::HalfOpen => {
                if record.probes_admitted() >= self.config.half_open_max_calls {
                    let stalled = record.half_open_since.map_or(true, |since| {
                        elapsed_between(since, now) >= self.config.recovery_timeout
                    });
                    if !stalled {
                        return Err(self.rejected(self.config.call_timeout));
                    }
                    warn!(
                        breaker = %self.name,
                        unsettled = record.half_open_probes_in_flight,
                        "Half-open probes never settled, restarting recovery"
                    );
                    record.enter_half_open(now);
                    self.transitioned(CircuitState::HalfOpen);
                }
                let episode = *record.half_open_since.get_or_insert(now);
                record.half_open_probes_in_flight += 1;
                self.persist(&record).await;
                Ok(Permit::Probe { episode })
            }
        }
    }

    /// Record how a permitted call ended.
    pub async fn settle(&self, permit: Permit, outcome: CallOutcome) {
        if permit == Permit::Untracked {
            return;
        }
        let mut record = match self.load().await {
            Ok(record) => record,
            Err(e) => {
                warn!(breaker = %self.name, error = %e, "Circuit state unavailable, outcome not recorded");
                return;
            }
        };
        let now = self.clock.now();

        let changed = match permit {
            Permit::Untracked => false,
            Permit::Closed => match (record.state, outcome) {
                (CircuitState::Closed, CallOutcome::Success) => {
                    let had_failures = record.consecutive_failures > 0;
                    record.consecutive_failures = 0;
                    had_failures
                }
                (CircuitState::Closed, CallOutcome::Failure) => {
                    record.consecutive_failures = record.consecutive_failures.saturating_add(1);
                    if record.consecutive_failures >= self.config.failure_threshold {
                        record.trip(now);
                        self.transitioned(CircuitState::Open);
                    }
                    true
                }
                _ => false,
            },
            Permit::Probe { episode } => {
                let same_episode = record.state == CircuitState::HalfOpen
                    && record.half_open_since == Some(episode);
                if !same_episode {
                    // Another probe already reopened or closed the circuit,
                    // or the episode was abandoned and restarted.
                    false
                } else {
                    match outcome {
                        CallOutcome::Failure => {
                            record.trip(now);
                            self.transitioned(CircuitState::Open);
                        }
                        CallOutcome::Success => {
                            record.half_open_probes_in_flight =
                                record.half_open_probes_in_flight.saturating_sub(1);
                            record.half_open_successes += 1;
                            if record.half_open_successes >= self.config.half_open_max_calls {
                                record.close();
                                self.transitioned(CircuitState::Closed);
                            }
                        }
                        CallOutcome::Neutral => {
                            record.half_open_probes_in_flight =
                                record.half_open_probes_in_flight.saturating_sub(1);
                        }
                    }
                    true
                }
            }
        };

        if changed {
            self.persist(&record).await;
        }
    }

    async fn persist(&self, record: &CircuitRecord) {
        if let Err(e) = self.save(record).await {
            warn!(breaker = %self.name, error = %e, "Failed to persist circuit state");
        }
    }

    /// Run `call` through the breaker with the configured timeout.
    ///
    /// The call and its bookkeeping run on a spawned task, so the outcome is
    /// recorded even if the caller stops waiting. A call that panics is
    /// recorded as a dependency failure.
    pub async fn call<F, Fut, T>(&self, call: F) -> RampartResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RampartResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let permit = self.acquire().await?;
        let fut = call();
        let breaker = self.clone();
        let timeout = self.config.call_timeout;

        let task = tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, fut).await {
                Ok(result) => result,
                Err(_) => Err(RampartError::Dependency(DependencyError::Timeout {
                    dependency: breaker.name.clone(),
                    after: timeout,
                })),
            };
            breaker.settle(permit, CallOutcome::of(&result)).await;
            result
        });

        match task.await {
            Ok(result) => result,
            Err(e) => {
                warn!(breaker = %self.name, error = %e, "Dependency call aborted");
                self.settle(permit, CallOutcome::Failure).await;
                Err(RampartError::Dependency(DependencyError::Aborted {
                    dependency: self.name.clone(),
                    reason: e.to_string(),
                }))
            }
        }
    }

    /// Current persisted record.
    pub async fn snapshot(&self) -> RampartResult<CircuitRecord> {
        Ok(self.load().await?)
    }

    pub async fn state(&self) -> RampartResult<CircuitState> {
        Ok(self.load().await?.state)
    }

    /// Force the circuit closed.
    pub async fn reset(&self) -> RampartResult<()> {
        self.save(&CircuitRecord::closed(&self.name)).await?;
        self.transitioned(CircuitState::Closed);
        Ok(())
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("backend", &self.store.backend_name())
            .field("config", &self.config)
            .finish()
    }
}
