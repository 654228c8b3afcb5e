//! Cache Store: fingerprint -> provider payload with expiry

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use meterstoredb::KvBackend;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::Result;
use crate::fingerprint::Fingerprint;
use crate::stats::{CacheCounters, CacheEvent, CacheStats};

/// Backend key namespace for cache entries
const KEY_PREFIX: &str = "cache/";

/// Backend key of the persisted lookup counters
const STATS_KEY: &str = "stats/counters";

/// Magic prefix of an encoded entry
const ENTRY_MAGIC: &[u8; 4] = b"MCE1";

const ENTRY_HEADER_LEN: usize = ENTRY_MAGIC.len() + 16;

/// Default time-to-live of a cached response
pub fn default_ttl() -> Duration {
    Duration::hours(24)
}

fn entry_key(fingerprint: &Fingerprint) -> String {
    format!("{}{}", KEY_PREFIX, fingerprint)
}

/// `at + delta`, pinned to the representable range instead of overflowing
fn offset_saturating(at: DateTime<Utc>, delta: Duration) -> DateTime<Utc> {
    at.checked_add_signed(delta).unwrap_or(if delta < Duration::zero() {
        DateTime::<Utc>::MIN_UTC
    } else {
        DateTime::<Utc>::MAX_UTC
    })
}

/// Counters as stored under [`STATS_KEY`]
#[derive(Debug, Serialize, Deserialize)]
struct PersistedStats {
    since: DateTime<Utc>,
    #[serde(flatten)]
    counters: CacheCounters,
}

/// A cached provider response
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// Request identity
    pub fingerprint: Fingerprint,
    /// Opaque provider payload
    pub payload: Vec<u8>,
    /// When the entry was written
    pub created_at: DateTime<Utc>,
    /// First instant at which the entry is no longer readable
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Readable iff `now < expires_at`
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ENTRY_HEADER_LEN + self.payload.len());
        out.extend_from_slice(ENTRY_MAGIC);
        out.extend_from_slice(&self.created_at.timestamp_millis().to_le_bytes());
        out.extend_from_slice(&self.expires_at.timestamp_millis().to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    fn decode(fingerprint: Fingerprint, raw: &[u8]) -> std::result::Result<Self, String> {
        if raw.len() < ENTRY_HEADER_LEN || &raw[..ENTRY_MAGIC.len()] != ENTRY_MAGIC {
            return Err("bad entry header".to_string());
        }

        let millis = |at: usize| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&raw[at..at + 8]);
            DateTime::from_timestamp_millis(i64::from_le_bytes(buf))
                .ok_or_else(|| "timestamp out of range".to_string())
        };
        let created_at = millis(ENTRY_MAGIC.len())?;
        let expires_at = millis(ENTRY_MAGIC.len() + 8)?;

        Ok(CacheEntry {
            fingerprint,
            payload: raw[ENTRY_HEADER_LEN..].to_vec(),
            created_at,
            expires_at,
        })
    }
}

/// Durable response cache shared by every request in the process
pub struct CacheStore {
    /// Persistence medium
    backend: Arc<dyn KvBackend>,

    clock: Arc<dyn Clock>,

    /// Hit/miss counters
    stats: Arc<CacheStats>,

    /// Minimum spacing between opportunistic sweeps; `None` disables them
    sweep_interval: Option<Duration>,

    last_sweep: Mutex<Option<DateTime<Utc>>>,

    /// Start of the current counting epoch
    since: Mutex<DateTime<Utc>>,
}

impl CacheStore {
    /// Create a cache over `backend`
    ///
    /// # Arguments
    /// * `backend` - Persistence medium; entries live under `cache/`, the
    ///   lookup counters under `stats/counters`
    /// * `clock` - Time source for expiry decisions
    ///
    /// # Returns
    /// A store whose counters continue from the ones last flushed to
    /// `backend`, or start at zero if none can be read.
    pub fn new(backend: Arc<dyn KvBackend>, clock: Arc<dyn Clock>) -> Self {
        let stats = Arc::new(CacheStats::new());
        let mut since = clock.now();
        match backend.get(STATS_KEY) {
            Ok(Some(raw)) => match serde_json::from_slice::<PersistedStats>(&raw) {
                Ok(persisted) => {
                    stats.restore(persisted.counters);
                    since = persisted.since;
                }
                Err(e) => warn!("unreadable cache counters reset to zero: {}", e),
            },
            Ok(None) => {}
            Err(e) => warn!("cache counters unavailable, starting from zero: {}", e),
        }

        Self {
            backend,
            clock,
            stats,
            sweep_interval: None,
            last_sweep: Mutex::new(None),
            since: Mutex::new(since),
        }
    }

    /// Sweep expired entries from `put` at most once per `interval`
    pub fn with_sweep_interval(mut self, interval: Option<Duration>) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Payload for `fingerprint` if present and unexpired
    ///
    /// Expired or undecodable entries read as absent; they are left in place
    /// for the next sweep. Storage failures count as a miss and are returned.
    pub fn get(&self, fingerprint: &Fingerprint) -> Result<Option<Vec<u8>>> {
        let now = self.clock.now();
        let raw = match self.backend.get(&entry_key(fingerprint)) {
            Ok(raw) => raw,
            Err(e) => {
                self.stats.record(CacheEvent::Miss);
                return Err(e.into());
            }
        };

        let entry = raw.map(|bytes| CacheEntry::decode(fingerprint.clone(), &bytes));
        match entry {
            Some(Ok(entry)) if entry.is_live(now) => {
                self.stats.record(CacheEvent::Hit);
                debug!(%fingerprint, "cache hit");
                Ok(Some(entry.payload))
            }
            Some(Ok(entry)) => {
                self.stats.record(CacheEvent::Miss);
                debug!(%fingerprint, expired_at = %entry.expires_at, "cache entry expired");
                Ok(None)
            }
            Some(Err(reason)) => {
                self.stats.record(CacheEvent::Miss);
                warn!(%fingerprint, "unreadable cache entry treated as absent: {}", reason);
                Ok(None)
            }
            None => {
                self.stats.record(CacheEvent::Miss);
                debug!(%fingerprint, "cache miss");
                Ok(None)
            }
        }
    }

    /// Insert or replace the entry, expiring `ttl` from now
    pub fn put(&self, fingerprint: &Fingerprint, payload: &[u8], ttl: Duration) -> Result<()> {
        let now = self.clock.now();
        self.maybe_sweep(now);

        let entry = CacheEntry {
            fingerprint: fingerprint.clone(),
            payload: payload.to_vec(),
            created_at: now,
            expires_at: offset_saturating(now, ttl),
        };
        self.backend.put(&entry_key(fingerprint), &entry.encode())?;
        self.stats.record(CacheEvent::Insert);
        self.persist_stats();

        debug!(%fingerprint, expires_at = %entry.expires_at, bytes = payload.len(), "cached response");
        Ok(())
    }

    fn maybe_sweep(&self, now: DateTime<Utc>) {
        let Some(interval) = self.sweep_interval else {
            return;
        };
        {
            let mut last = self.last_sweep.lock();
            if matches!(*last, Some(at) if now - at < interval) {
                return;
            }
            *last = Some(now);
        }
        if let Err(e) = self.sweep(now) {
            warn!("opportunistic cache sweep failed: {}", e);
        }
    }

    /// Remove every entry whose `expires_at <= now`
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let removed = self.remove_where(|entry| !entry.is_live(now))?;
        self.stats.record_expired(removed as u64);
        if removed > 0 {
            info!("Swept {} expired cache entries", removed);
        }
        self.persist_stats();
        Ok(removed)
    }

    /// Remove entries written more than `max_age` ago, live or not
    pub fn clear_older_than(&self, max_age: Duration) -> Result<usize> {
        let cutoff = offset_saturating(self.clock.now(), -max_age);
        let removed = self.remove_where(|entry| entry.created_at <= cutoff)?;
        info!("Cleared {} cache entries older than {}", removed, cutoff);
        Ok(removed)
    }

    /// Remove every entry
    pub fn clear(&self) -> Result<usize> {
        let removed = self.remove_where(|_| true)?;
        info!("Cleared {} cache entries", removed);
        Ok(removed)
    }

    /// Remove one entry, returning whether it existed
    pub fn remove(&self, fingerprint: &Fingerprint) -> Result<bool> {
        Ok(self.backend.delete(&entry_key(fingerprint))?)
    }

    /// All stored entries, including expired ones not yet swept
    pub fn entries(&self) -> Result<Vec<CacheEntry>> {
        let mut out = Vec::new();
        for (key, raw) in self.backend.scan_prefix(KEY_PREFIX)? {
            let Some(fingerprint) = Fingerprint::from_hex(&key[KEY_PREFIX.len()..]) else {
                continue;
            };
            if let Ok(entry) = CacheEntry::decode(fingerprint, &raw) {
                out.push(entry);
            }
        }
        Ok(out)
    }

    /// Number of stored entries, including expired ones not yet swept
    pub fn len(&self) -> Result<usize> {
        Ok(self.backend.scan_prefix(KEY_PREFIX)?.len())
    }

    /// Check if no entries are stored
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Lookup counters
    pub fn stats(&self) -> &Arc<CacheStats> {
        &self.stats
    }

    /// Start of the current counting epoch
    pub fn stats_since(&self) -> DateTime<Utc> {
        *self.since.lock()
    }

    /// Write the counters through to the backend
    pub fn flush_stats(&self) -> Result<()> {
        let persisted = PersistedStats {
            since: *self.since.lock(),
            counters: self.stats.snapshot(),
        };
        self.backend.put(STATS_KEY, &serde_json::to_vec(&persisted)?)?;
        Ok(())
    }

    fn persist_stats(&self) {
        if let Err(e) = self.flush_stats() {
            warn!("failed to persist cache counters: {}", e);
        }
    }

    /// Zero the counters and start a new epoch at `now`
    pub fn reset_stats(&self, now: DateTime<Utc>) -> Result<()> {
        {
            let mut since = self.since.lock();
            self.stats.reset();
            *since = now;
        }
        self.flush_stats()
    }

    /// Delete entries matching `doomed`; undecodable entries always go
    fn remove_where(&self, doomed: impl Fn(&CacheEntry) -> bool) -> Result<usize> {
        let mut removed = 0;
        for (key, raw) in self.backend.scan_prefix(KEY_PREFIX)? {
            let remove = match Fingerprint::from_hex(&key[KEY_PREFIX.len()..]) {
                Some(fingerprint) => CacheEntry::decode(fingerprint, &raw)
                    .map(|entry| doomed(&entry))
                    .unwrap_or(true),
                None => true,
            };
            if remove && self.backend.delete(&key)? {
                removed += 1;
            }
        }

        if removed > 0 && self.backend.needs_compaction() {
            self.backend.compact()?;
        }
        Ok(removed)
    }
}

impl Drop for CacheStore {
    fn drop(&mut self) {
        self.persist_stats();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::fingerprint::ArgSet;
    use chrono::TimeZone;
    use meterstoredb::{LogStore, MemoryStore};
    use tempfile::TempDir;

    fn fixture() -> (CacheStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap(),
        ));
        let cache = CacheStore::new(Arc::new(MemoryStore::new()), clock.clone());
        (cache, clock)
    }

    fn fp(location: &str) -> Fingerprint {
        Fingerprint::compute("search", &ArgSet::new().with("location", location))
    }

    #[test]
    fn test_put_then_get() {
        let (cache, _clock) = fixture();

        cache.put(&fp("Rome"), b"{\"total\":12}", default_ttl()).unwrap();
        assert_eq!(
            cache.get(&fp("Rome")).unwrap(),
            Some(b"{\"total\":12}".to_vec())
        );
        assert_eq!(cache.stats().hits(), 1);
        assert_eq!(cache.stats().inserts(), 1);
    }

    #[test]
    fn test_expiry() {
        let (cache, clock) = fixture();
        cache.put(&fp("Rome"), b"payload", Duration::hours(1)).unwrap();

        clock.advance(Duration::minutes(59));
        assert!(cache.get(&fp("Rome")).unwrap().is_some());

        // expires_at itself is no longer readable
        clock.advance(Duration::minutes(1));
        assert_eq!(cache.get(&fp("Rome")).unwrap(), None);
        assert_eq!(cache.stats().misses(), 1);

        // get does not purge
        assert_eq!(cache.len().unwrap(), 1);
    }

    #[test]
    fn test_overwrite_last_writer_wins() {
        let (cache, _clock) = fixture();
        cache.put(&fp("Rome"), b"first", default_ttl()).unwrap();
        cache.put(&fp("Rome"), b"second", default_ttl()).unwrap();

        assert_eq!(cache.get(&fp("Rome")).unwrap(), Some(b"second".to_vec()));
        assert_eq!(cache.len().unwrap(), 1);
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let (cache, clock) = fixture();
        cache.put(&fp("Rome"), b"short", Duration::hours(1)).unwrap();
        cache.put(&fp("Milan"), b"long", Duration::hours(48)).unwrap();

        clock.advance(Duration::hours(2));
        assert_eq!(cache.sweep(clock.now()).unwrap(), 1);
        assert_eq!(cache.len().unwrap(), 1);
        assert_eq!(cache.stats().expired(), 1);
        assert!(cache.get(&fp("Milan")).unwrap().is_some());
    }

    #[test]
    fn test_opportunistic_sweep() {
        let (cache, clock) = fixture();
        let cache = cache.with_sweep_interval(Some(Duration::hours(1)));

        cache.put(&fp("Rome"), b"short", Duration::minutes(10)).unwrap();
        clock.advance(Duration::minutes(30));
        cache.put(&fp("Milan"), b"x", default_ttl()).unwrap();
        // interval not elapsed yet, expired entry still stored
        assert_eq!(cache.len().unwrap(), 2);

        clock.advance(Duration::hours(1));
        cache.put(&fp("Turin"), b"y", default_ttl()).unwrap();
        assert_eq!(cache.len().unwrap(), 2);
        assert_eq!(cache.get(&fp("Rome")).unwrap(), None);
    }

    #[test]
    fn test_clear_and_clear_older_than() {
        let (cache, clock) = fixture();
        cache.put(&fp("Rome"), b"old", Duration::days(30)).unwrap();
        clock.advance(Duration::days(8));
        cache.put(&fp("Milan"), b"new", Duration::days(30)).unwrap();

        assert_eq!(cache.clear_older_than(Duration::days(7)).unwrap(), 1);
        assert_eq!(cache.get(&fp("Rome")).unwrap(), None);
        assert!(cache.get(&fp("Milan")).unwrap().is_some());

        assert_eq!(cache.clear().unwrap(), 1);
        assert!(cache.is_empty().unwrap());
    }

    #[test]
    fn test_corrupt_entry_reads_absent_and_is_swept() {
        let backend = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = CacheStore::new(backend.clone(), clock.clone());

        backend
            .put(&entry_key(&fp("Rome")), b"garbage")
            .unwrap();
        assert_eq!(cache.get(&fp("Rome")).unwrap(), None);
        assert_eq!(cache.sweep(clock.now()).unwrap(), 1);
        assert!(backend.is_empty());
    }

    #[test]
    fn test_survives_restart() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));

        {
            let backend = Arc::new(LogStore::open(dir.path()).unwrap());
            let cache = CacheStore::new(backend, clock.clone());
            cache.put(&fp("Rome"), b"persisted", default_ttl()).unwrap();
        }

        let backend = Arc::new(LogStore::open(dir.path()).unwrap());
        let cache = CacheStore::new(backend, clock.clone());
        assert_eq!(cache.get(&fp("Rome")).unwrap(), Some(b"persisted".to_vec()));
        assert_eq!(cache.entries().unwrap().len(), 1);
    }

    #[test]
    fn test_extreme_ttls_saturate() {
        let (cache, clock) = fixture();

        cache.put(&fp("Rome"), b"forever", Duration::MAX).unwrap();
        cache.put(&fp("Milan"), b"stale", Duration::MIN).unwrap();
        assert_eq!(cache.get(&fp("Rome")).unwrap(), Some(b"forever".to_vec()));
        assert_eq!(cache.get(&fp("Milan")).unwrap(), None);

        clock.advance(Duration::days(365 * 100));
        assert_eq!(cache.get(&fp("Rome")).unwrap(), Some(b"forever".to_vec()));
        assert_eq!(cache.sweep(clock.now()).unwrap(), 1);

        assert_eq!(cache.clear_older_than(Duration::MAX).unwrap(), 0);
        assert_eq!(cache.clear_older_than(Duration::MIN).unwrap(), 1);
    }

    #[test]
    fn test_counters_survive_restart() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap(),
        ));
        let started = clock.now();

        {
            let backend = Arc::new(LogStore::open(dir.path()).unwrap());
            let cache = CacheStore::new(backend, clock.clone());
            cache.put(&fp("Rome"), b"x", default_ttl()).unwrap();
            cache.get(&fp("Rome")).unwrap();
            cache.get(&fp("Rome")).unwrap();
            cache.get(&fp("Milan")).unwrap();
        }

        clock.advance(Duration::hours(3));
        let backend = Arc::new(LogStore::open(dir.path()).unwrap());
        let cache = CacheStore::new(backend, clock.clone());
        let counters = cache.stats().snapshot();
        assert_eq!((counters.hits, counters.misses, counters.inserts), (2, 1, 1));
        assert_eq!(cache.stats_since(), started);
        assert_eq!(cache.len().unwrap(), 1);

        cache.reset_stats(clock.now()).unwrap();
        drop(cache);
        let backend = Arc::new(LogStore::open(dir.path()).unwrap());
        let cache = CacheStore::new(backend, clock.clone());
        assert_eq!(cache.stats().snapshot(), CacheCounters::default());
        assert_eq!(cache.stats_since(), clock.now());
    }

    #[test]
    fn test_unreadable_counters_start_from_zero() {
        let backend = Arc::new(MemoryStore::new());
        backend.put(STATS_KEY, b"not json").unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));

        let cache = CacheStore::new(backend, clock.clone());
        assert_eq!(cache.stats().snapshot(), CacheCounters::default());
        assert_eq!(cache.stats_since(), clock.now());
    }
}
