//! Cache statistics and metrics tracking

use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics for cache performance monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Current number of entries
    pub size: usize,

    /// Maximum allowed entries (None = unlimited)
    pub max_entries: Option<usize>,

    /// Lookups answered by a fresh entry
    pub hits: u64,

    /// Lookups that found an expired entry
    pub stale_hits: u64,

    /// Lookups that found nothing
    pub misses: u64,

    /// Total number of store operations
    pub inserts: u64,

    /// Entries renewed by a `304 Not Modified`
    pub renewals: u64,

    /// Entries evicted to respect `max_entries`
    pub evictions: u64,

    /// Entries removed by explicit invalidation
    pub invalidations: u64,
}

impl CacheStats {
    /// Calculate hit rate (fresh hits / total lookups)
    pub fn hit_rate(&self) -> f64 {
        let total = self.total_lookups();
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Total number of lookups
    pub fn total_lookups(&self) -> u64 {
        self.hits + self.stale_hits + self.misses
    }
}

/// Lock-free counters behind [`CacheStats`]
#[derive(Debug, Default)]
pub(crate) struct MetricsCollector {
    hits: AtomicU64,
    stale_hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    renewals: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
}

impl MetricsCollector {
    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stale_hit(&self) {
        self.stale_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_insert(&self) {
        self.inserts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_renewal(&self) {
        self.renewals.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_invalidations(&self, count: u64) {
        self.invalidations.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, size: usize, max_entries: Option<usize>) -> CacheStats {
        CacheStats {
            size,
            max_entries,
            hits: self.hits.load(Ordering::Relaxed),
            stale_hits: self.stale_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            renewals: self.renewals.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}
