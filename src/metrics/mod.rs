//! Cache Metrics Module
//!
//! Counters describing how a map is used and maintained: lookup hits and
//! misses, insertions, removals, purged references and segment resizes.
//! Collection is lock-free and can be switched off at runtime.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Snapshot of a map's counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheMetrics {
    /// Lookups that found a live entry
    pub hits: u64,
    /// Lookups that found nothing
    pub misses: u64,
    /// Entries added to a segment chain
    pub insertions: u64,
    /// Entries explicitly released by a remove
    pub removals: u64,
    /// Reclaimed references dropped from their chains
    pub purged: u64,
    /// Segment tables doubled
    pub resizes: u64,
}

impl CacheMetrics {
    /// Total number of lookups
    pub fn lookups(&self) -> u64 {
        self.hits + self.misses
    }

    /// Calculate hit rate as percentage
    pub fn hit_rate(&self) -> f64 {
        if self.lookups() == 0 {
            0.0
        } else {
            (self.hits as f64 / self.lookups() as f64) * 100.0
        }
    }
}

/// Internal atomic metrics collection
#[derive(Debug)]
pub struct AtomicMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    insertions: AtomicU64,
    removals: AtomicU64,
    purged: AtomicU64,
    resizes: AtomicU64,
    enabled: AtomicBool,
}

impl Default for AtomicMetrics {
    fn default() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            insertions: AtomicU64::new(0),
            removals: AtomicU64::new(0),
            purged: AtomicU64::new(0),
            resizes: AtomicU64::new(0),
            enabled: AtomicBool::new(true),
        }
    }
}

impl AtomicMetrics {
    #[inline]
    fn add(&self, counter: &AtomicU64, n: u64) {
        if self.enabled.load(Ordering::Relaxed) {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Record a lookup that found a live entry
    pub fn record_hit(&self) {
        self.add(&self.hits, 1);
    }

    /// Record a lookup that found nothing
    pub fn record_miss(&self) {
        self.add(&self.misses, 1);
    }

    /// Record a new entry
    pub fn record_insertion(&self) {
        self.add(&self.insertions, 1);
    }

    /// Record an explicit release
    pub fn record_removal(&self) {
        self.add(&self.removals, 1);
    }

    /// Record references purged by one restructure pass
    pub fn record_purge(&self, purged: u64) {
        self.add(&self.purged, purged);
    }

    /// Record a table doubling
    pub fn record_resize(&self) {
        self.add(&self.resizes, 1);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> CacheMetrics {
        CacheMetrics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            insertions: self.insertions.load(Ordering::Relaxed),
            removals: self.removals.load(Ordering::Relaxed),
            purged: self.purged.load(Ordering::Relaxed),
            resizes: self.resizes.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.insertions.store(0, Ordering::Relaxed);
        self.removals.store(0, Ordering::Relaxed);
        self.purged.store(0, Ordering::Relaxed);
        self.resizes.store(0, Ordering::Relaxed);
    }

    /// Enable or disable collection
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Whether collection is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }
}

/// Trait for data structures that support performance metrics
pub trait MetricsCollector {
    /// Get current performance metrics
    fn metrics(&self) -> CacheMetrics;

    /// Reset all metrics
    fn reset_metrics(&self);

    /// Enable or disable metrics collection
    fn set_metrics_enabled(&self, enabled: bool);

    /// Check if metrics collection is enabled
    fn is_metrics_enabled(&self) -> bool;
}
