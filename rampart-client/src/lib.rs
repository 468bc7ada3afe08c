//! Rampart Client - on-device cache for a rampart-protected API
//!
//! Polling clients keep a per-key TTL copy of every response they read and
//! fall back to it, however old, when the network call fails.
//!
//! ```no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use rampart_client::{ClientCache, ClientConfig, RestFetcher};
//!
//! let config = ClientConfig::from_path("client.toml".as_ref())?;
//! let fetcher = RestFetcher::new(&config)?;
//! let cache = ClientCache::new(&config.cache_dir);
//!
//! let ttl = config.ttl.short();
//! let today = cache
//!     .read_or_fetch("schedules/today", ttl, || fetcher.get_data("schedules/today"))
//!     .await?;
//! println!("{} bytes, stale: {}", today.value.len(), today.is_stale());
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod fetcher;

pub use cache::{Cached, ClientCache, ClientCacheRecord, Origin, TTL_LONG, TTL_SHORT};
pub use config::{ClientConfig, ConfigError, TtlConfig};
pub use error::{ClientError, ClientResult, FetchError};
pub use fetcher::RestFetcher;
