// Live proxy counters.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub coalesced: u64,
    pub upstream_attempts: u64,
    pub upstream_failures: u64,
    pub downloaded_bytes: u64,
    pub promotions: u64,
    pub cache_write_failures: u64,
    pub active_downloads: u32,
}

impl StatsSnapshot {
    /// Fraction of artifact requests answered straight from the cache.
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total > 0 {
            self.cache_hits as f64 / total as f64
        } else {
            0.0
        }
    }
}

#[derive(Default)]
pub struct StatsCollector {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    coalesced: AtomicU64,
    upstream_attempts: AtomicU64,
    upstream_failures: AtomicU64,
    downloaded_bytes: AtomicU64,
    promotions: AtomicU64,
    cache_write_failures: AtomicU64,
    active_downloads: AtomicU32,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// A request attached to a fetch another request was already driving.
    pub fn record_coalesced(&self) {
        self.coalesced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_attempt(&self) {
        self.upstream_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.upstream_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_downloaded(&self, bytes: u64) {
        self.downloaded_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_promotion(&self) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_write_failure(&self) {
        self.cache_write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_downloads(&self) {
        self.active_downloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement_downloads(&self) {
        self.active_downloads.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            upstream_attempts: self.upstream_attempts.load(Ordering::Relaxed),
            upstream_failures: self.upstream_failures.load(Ordering::Relaxed),
            downloaded_bytes: self.downloaded_bytes.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
            cache_write_failures: self.cache_write_failures.load(Ordering::Relaxed),
            active_downloads: self.active_downloads.load(Ordering::Relaxed),
        }
    }
}
