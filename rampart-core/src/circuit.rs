//! Circuit breaker state as persisted in the shared store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// CIRCUIT STATE
// ============================================================================

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CircuitState {
    /// Calls flow to the dependency
    #[default]
    Closed = 0,
    /// Calls fail fast without touching the dependency
    Open = 1,
    /// A bounded number of probe calls test recovery
    HalfOpen = 2,
}

impl CircuitState {
    /// Convert to stored string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Closed => "Closed",
            Self::Open => "Open",
            Self::HalfOpen => "HalfOpen",
        }
    }

    /// Parse from stored string representation.
    pub fn from_db_str(s: &str) -> Result<Self, CircuitStateParseError> {
        match s {
            "Closed" => Ok(Self::Closed),
            "Open" => Ok(Self::Open),
            "HalfOpen" => Ok(Self::HalfOpen),
            _ => Err(CircuitStateParseError(s.to_string())),
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_db_str())
    }
}

/// Error parsing CircuitState from string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitStateParseError(pub String);

impl std::fmt::Display for CircuitStateParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid circuit state: {}", self.0)
    }
}

impl std::error::Error for CircuitStateParseError {}

// ============================================================================
// CIRCUIT RECORD
// ============================================================================

/// One breaker's persisted state, keyed by the protected dependency name.
///
/// `state == Open` implies `opened_at.is_some()`; the constructors below are
/// the only transitions and they maintain that.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitRecord {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub half_open_probes_in_flight: u32,
    /// Probes that completed successfully since entering HalfOpen.
    #[serde(default)]
    pub half_open_successes: u32,
    /// Start of the current half-open episode.
    #[serde(default)]
    pub half_open_since: Option<DateTime<Utc>>,
}

impl CircuitRecord {
    pub fn closed(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            half_open_probes_in_flight: 0,
            half_open_successes: 0,
            half_open_since: None,
        }
    }

    pub fn trip(&mut self, now: DateTime<Utc>) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.half_open_probes_in_flight = 0;
        self.half_open_successes = 0;
        self.half_open_since = None;
    }

    /// Start a fresh half-open episode at `now`, discarding any earlier probes.
    pub fn enter_half_open(&mut self, now: DateTime<Utc>) {
        self.state = CircuitState::HalfOpen;
        self.half_open_probes_in_flight = 0;
        self.half_open_successes = 0;
        self.half_open_since = Some(now);
    }

    pub fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.half_open_probes_in_flight = 0;
        self.half_open_successes = 0;
        self.half_open_since = None;
    }

    /// Probes admitted since entering HalfOpen, finished or not.
    pub fn probes_admitted(&self) -> u32 {
        self.half_open_probes_in_flight + self.half_open_successes
    }
}
