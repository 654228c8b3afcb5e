//! Process-wide cache counters

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Something the cache store counts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CacheEvent {
    Hit,
    Miss,
    Insert,
}

/// Counters since the epoch start or the last [`CacheStats::reset`]
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    expired: AtomicU64,
}

/// Plain copy of the counters at one instant
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheCounters {
    /// Lookups answered from the cache
    pub hits: u64,
    /// Lookups that found nothing usable
    pub misses: u64,
    /// Entries written
    pub inserts: u64,
    /// Entries removed by sweeps
    pub expired: u64,
}

impl CacheCounters {
    /// `hits / (hits + misses)`, 0 before the first lookup
    pub fn hit_rate(&self) -> f64 {
        match self.hits + self.misses {
            0 => 0.0,
            lookups => self.hits as f64 / lookups as f64,
        }
    }
}

impl CacheStats {
    /// All counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&self, event: CacheEvent) {
        let counter = match event {
            CacheEvent::Hit => &self.hits,
            CacheEvent::Miss => &self.misses,
            CacheEvent::Insert => &self.inserts,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_expired(&self, count: u64) {
        self.expired.fetch_add(count, Ordering::Relaxed);
    }

    /// Copy every counter
    pub fn snapshot(&self) -> CacheCounters {
        CacheCounters {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
        }
    }

    /// Cache hits so far
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Cache misses so far
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Entries written so far
    pub fn inserts(&self) -> u64 {
        self.inserts.load(Ordering::Relaxed)
    }

    /// Entries swept so far
    pub fn expired(&self) -> u64 {
        self.expired.load(Ordering::Relaxed)
    }

    /// Continue from previously persisted counters
    pub fn restore(&self, counters: CacheCounters) {
        self.hits.store(counters.hits, Ordering::Relaxed);
        self.misses.store(counters.misses, Ordering::Relaxed);
        self.inserts.store(counters.inserts, Ordering::Relaxed);
        self.expired.store(counters.expired, Ordering::Relaxed);
    }

    /// Zero every counter
    pub fn reset(&self) {
        for counter in [&self.hits, &self.misses, &self.inserts, &self.expired] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = CacheStats::new();
        stats.record(CacheEvent::Hit);
        stats.record(CacheEvent::Hit);
        stats.record(CacheEvent::Miss);
        stats.record(CacheEvent::Insert);
        stats.record_expired(3);

        let counters = stats.snapshot();
        assert_eq!(
            counters,
            CacheCounters {
                hits: 2,
                misses: 1,
                inserts: 1,
                expired: 3,
            }
        );
        assert_eq!(counters.hit_rate(), 2.0 / 3.0);
    }

    #[test]
    fn test_restore() {
        let stats = CacheStats::new();
        let saved = CacheCounters {
            hits: 7,
            misses: 3,
            inserts: 3,
            expired: 1,
        };
        stats.restore(saved);
        stats.record(CacheEvent::Hit);

        assert_eq!(stats.hits(), 8);
        assert_eq!(stats.misses(), 3);
    }

    #[test]
    fn test_reset() {
        let stats = CacheStats::new();
        stats.record(CacheEvent::Hit);
        stats.record(CacheEvent::Miss);
        stats.reset();

        assert_eq!(stats.snapshot(), CacheCounters::default());
        assert_eq!(stats.snapshot().hit_rate(), 0.0);
    }
}
