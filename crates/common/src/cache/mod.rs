//! Response cache for idempotent requests
//!
//! Caching is opt-in per call. An entry is fresh while
//! `now - stored_at < ttl`; fresh entries answer a request without touching
//! the network, stale entries carrying an etag are revalidated with
//! `If-None-Match`, and a `304` renews them in place of a new payload.
//!
//! ```
//! use std::time::Duration;
//!
//! use bytes::Bytes;
//! use fleetbook_common::cache::{cache_key, CacheConfig, CacheLookup, ResponseCache};
//!
//! let cache = ResponseCache::new(CacheConfig::default()).unwrap();
//! let key = cache_key("GET", "/vehicles?type=van&city=oslo");
//! cache.store(key.clone(), Bytes::from_static(b"[]"), None, Some(Duration::from_secs(5)));
//! assert!(matches!(cache.lookup(&key), CacheLookup::Fresh(_)));
//! ```

mod config;
mod core;
mod key;
mod stats;

pub use self::config::{CacheConfig, CacheConfigBuilder};
pub use self::core::{CacheEntry, CacheError, CacheLookup, ResponseCache};
pub use self::key::cache_key;
pub use self::stats::CacheStats;
