//! Rampart Core - shared types for the resilience and caching layer
//!
//! Error taxonomy, configuration, clock abstraction, and the records the
//! server-side components persist in the shared store.

pub mod circuit;
pub mod clock;
pub mod config;
pub mod constants;
pub mod error;
pub mod rate;
pub mod resource;

pub use circuit::{CircuitRecord, CircuitState, CircuitStateParseError};
pub use clock::{add_duration, elapsed_between, Clock, ManualClock, SystemClock};
pub use config::{BreakerConfig, RampartConfig, RateLimits, StoreConfig};
pub use error::{
    ConfigError, DependencyError, RampartError, RampartResult, StoreError, StoreResult,
    ValidationError,
};
pub use rate::{RateBucket, RateDecision, RateLimitSpec, RouteClass};
pub use resource::{ResourceCatalog, ResourceClass, ResourcePolicy};
