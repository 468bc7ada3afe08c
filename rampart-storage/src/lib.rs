//! Rampart Storage - the shared store behind every server-side component
//!
//! Cache entries, circuit records and rate buckets all live in one external
//! key-value store reachable by every worker process. Components receive the
//! store as an injected [`SharedStore`] handle; there is no ambient singleton.
//!
//! Two backends are provided:
//! - [`LmdbStore`]: a memory-mapped LMDB environment on local disk. LMDB
//!   serializes writers across processes, so a pool of workers pointed at the
//!   same directory observes one consistent state.
//! - [`MemoryStore`]: process-local, used when the shared store cannot be
//!   opened at startup (see [`StoreSelection`]).

pub mod lmdb;
pub mod memory;
pub mod select;
pub mod traits;

pub use lmdb::{LmdbStore, LmdbStoreError};
pub use memory::MemoryStore;
pub use select::{StoreMode, StoreSelection};
pub use traits::{CacheStats, Counter, SharedStore, StoredValue};
