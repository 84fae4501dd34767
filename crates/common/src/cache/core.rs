//! TTL and ETag aware response cache
//!
//! Entries are immutable once stored: every write, including a `304`
//! renewal, swaps in a new `Arc<CacheEntry>`. Readers that already hold an
//! entry keep a consistent view. The map lock is held only for the in-memory
//! swap.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, trace};

use super::config::CacheConfig;
use super::stats::{CacheStats, MetricsCollector};
use crate::error::ConfigResult;
use crate::resilience::{Clock, SystemClock};

/// Non-fatal cache failure. Callers log it and fall back to the network.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cached entry '{key}' could not be decoded: {message}")]
    Corrupt { key: String, message: String },
}

/// A cached response payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    pub payload: Bytes,
    pub stored_at: Instant,
    pub ttl: Duration,
    pub etag: Option<String>,
}

impl CacheEntry {
    /// Fresh iff `now - stored_at < ttl`
    pub fn is_fresh_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) < self.ttl
    }

    /// Decode the payload as JSON.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, CacheError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| CacheError::Corrupt { key: self.key.clone(), message: e.to_string() })
    }
}

/// Result of [`ResponseCache::lookup`]
#[derive(Debug, Clone)]
pub enum CacheLookup {
    /// Usable without contacting the network
    Fresh(Arc<CacheEntry>),
    /// Expired; may still be revalidated with its etag
    Stale(Arc<CacheEntry>),
    Miss,
}

impl CacheLookup {
    pub fn entry(&self) -> Option<&Arc<CacheEntry>> {
        match self {
            CacheLookup::Fresh(entry) | CacheLookup::Stale(entry) => Some(entry),
            CacheLookup::Miss => None,
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, CacheLookup::Fresh(_))
    }
}

#[derive(Debug)]
struct Slot {
    entry: Arc<CacheEntry>,
    sequence: u64,
}

#[derive(Debug, Default)]
struct CacheStorage {
    data: HashMap<String, Slot>,
    sequence: u64,
}

impl CacheStorage {
    fn put(&mut self, entry: Arc<CacheEntry>) {
        self.sequence += 1;
        let sequence = self.sequence;
        self.data.insert(entry.key.clone(), Slot { entry, sequence });
    }

    fn oldest_key(&self) -> Option<String> {
        self.data.iter().min_by_key(|(_, slot)| slot.sequence).map(|(key, _)| key.clone())
    }
}

/// Response cache shared by all requests of one client.
pub struct ResponseCache<C: Clock = SystemClock> {
    storage: Mutex<CacheStorage>,
    config: CacheConfig,
    metrics: MetricsCollector,
    clock: C,
}

impl ResponseCache<SystemClock> {
    pub fn new(config: CacheConfig) -> ConfigResult<Self> {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> ResponseCache<C> {
    /// Creates a new cache with the specified configuration and clock.
    pub fn with_clock(config: CacheConfig, clock: C) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            storage: Mutex::new(CacheStorage::default()),
            config,
            metrics: MetricsCollector::default(),
            clock,
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Look up `key`, classifying the entry as fresh or stale.
    pub fn lookup(&self, key: &str) -> CacheLookup {
        let now = self.clock.now();
        let entry = self.storage.lock().data.get(key).map(|slot| Arc::clone(&slot.entry));

        match entry {
            Some(entry) if entry.is_fresh_at(now) => {
                self.metrics.record_hit();
                trace!(key, "Cache hit");
                CacheLookup::Fresh(entry)
            }
            Some(entry) => {
                self.metrics.record_stale_hit();
                trace!(key, "Cache entry stale");
                CacheLookup::Stale(entry)
            }
            None => {
                self.metrics.record_miss();
                CacheLookup::Miss
            }
        }
    }

    /// Store a payload, replacing any existing entry for `key`.
    ///
    /// `ttl` falls back to the configured default.
    pub fn store(
        &self,
        key: impl Into<String>,
        payload: Bytes,
        etag: Option<String>,
        ttl: Option<Duration>,
    ) -> Arc<CacheEntry> {
        let entry = Arc::new(CacheEntry {
            key: key.into(),
            payload,
            stored_at: self.clock.now(),
            ttl: ttl.unwrap_or(self.config.default_ttl),
            etag,
        });

        let evicted = {
            let mut storage = self.storage.lock();
            let mut evicted = None;
            if let Some(max) = self.config.max_entries {
                if storage.data.len() >= max && !storage.data.contains_key(&entry.key) {
                    evicted = storage.oldest_key();
                    if let Some(oldest) = &evicted {
                        storage.data.remove(oldest);
                    }
                }
            }
            storage.put(Arc::clone(&entry));
            evicted
        };

        self.metrics.record_insert();
        if let Some(oldest) = evicted {
            self.metrics.record_eviction();
            debug!(evicted = %oldest, "Cache full, evicted oldest entry");
        }
        debug!(
            key = %entry.key,
            ttl_ms = u64::try_from(entry.ttl.as_millis()).unwrap_or(u64::MAX),
            "Stored response in cache"
        );
        entry
    }

    /// Renew an entry after `304 Not Modified`: same payload and etag, new
    /// `stored_at`.
    pub fn renew(&self, key: &str) -> Option<Arc<CacheEntry>> {
        let now = self.clock.now();
        let renewed = {
            let mut storage = self.storage.lock();
            let current = Arc::clone(&storage.data.get(key)?.entry);
            let renewed = Arc::new(CacheEntry { stored_at: now, ..(*current).clone() });
            storage.put(Arc::clone(&renewed));
            renewed
        };

        self.metrics.record_renewal();
        debug!(key, "Cache entry renewed by revalidation");
        Some(renewed)
    }

    /// Remove every entry, or those whose key contains `pattern`.
    /// Returns the number of removed entries.
    pub fn invalidate(&self, pattern: Option<&str>) -> usize {
        let removed = {
            let mut storage = self.storage.lock();
            let before = storage.data.len();
            match pattern {
                Some(pattern) => storage.data.retain(|key, _| !key.contains(pattern)),
                None => storage.data.clear(),
            }
            before - storage.data.len()
        };

        self.metrics.record_invalidations(removed as u64);
        if removed > 0 {
            debug!(pattern = pattern.unwrap_or("*"), removed, "Cache entries invalidated");
        }
        removed
    }

    /// Drop a single entry. Used when a cached payload turns out corrupt.
    pub fn remove(&self, key: &str) -> bool {
        let removed = self.storage.lock().data.remove(key).is_some();
        if removed {
            self.metrics.record_invalidations(1);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.storage.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.metrics.snapshot(self.len(), self.config.max_entries)
    }
}

impl<C: Clock> std::fmt::Debug for ResponseCache<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("config", &self.config)
            .field("len", &self.len())
            .finish()
    }
}
