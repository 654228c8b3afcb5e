//! Usage Tracker: per-period call counters with quota evaluation
//!
//! The tracker keeps the current period's record in memory behind one lock
//! and writes it through to the backend on every change. Superseded periods
//! stay in the backend untouched and are only read for history.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use meterstoredb::KvBackend;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::{MeterError, Result};
use crate::policy::{PeriodGranularity, QuotaPolicy};
use crate::pricing::{Pricing, SpendStatus};

/// Backend key namespace for usage records
const KEY_PREFIX: &str = "usage/";

/// Calls counted within one accounting period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// `YYYY-MM-DD` or `YYYY-MM`
    pub period_key: String,
    /// Quota units consumed in the period
    pub call_count: u64,
    /// First counted call
    pub first_call_at: Option<DateTime<Utc>>,
    /// Most recent counted call
    pub last_call_at: Option<DateTime<Utc>>,
    /// Units consumed per operation
    #[serde(default)]
    pub calls_by_operation: BTreeMap<String, u64>,
    /// Estimated cost of the counted calls
    #[serde(default)]
    pub total_cost: f64,
}

impl UsageRecord {
    /// A record with nothing counted yet
    pub fn empty(period_key: &str) -> Self {
        Self {
            period_key: period_key.to_string(),
            call_count: 0,
            first_call_at: None,
            last_call_at: None,
            calls_by_operation: BTreeMap::new(),
            total_cost: 0.0,
        }
    }

    fn count(&mut self, now: DateTime<Utc>, operation: &str, units: u64, cost: f64) {
        self.call_count = self.call_count.saturating_add(units);
        self.total_cost += cost;
        self.first_call_at.get_or_insert(now);
        self.last_call_at = Some(now);
        *self
            .calls_by_operation
            .entry(operation.to_string())
            .or_insert(0) += units;
    }

    /// Fold calls counted while storage was unreachable into a loaded record
    fn absorb(&mut self, other: &UsageRecord) {
        self.call_count = self.call_count.saturating_add(other.call_count);
        self.total_cost += other.total_cost;
        self.first_call_at = match (self.first_call_at, other.first_call_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.last_call_at = self.last_call_at.max(other.last_call_at);
        for (operation, units) in &other.calls_by_operation {
            *self
                .calls_by_operation
                .entry(operation.clone())
                .or_insert(0) += units;
        }
    }
}

/// Derived view of a period's record against the policy
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageStatus {
    /// Period the numbers belong to
    pub period_key: String,
    /// Accounting window
    pub period: PeriodGranularity,
    /// Units consumed
    pub used: u64,
    /// Units allowed
    pub limit: u64,
    /// Units left, never negative
    pub remaining: u64,
    /// `used / limit` as a percentage
    pub percentage: f64,
    /// Highest warning threshold reached, if any
    pub warning_level: Option<f64>,
}

impl UsageStatus {
    /// Evaluate `record` against `policy`
    pub fn from_record(record: &UsageRecord, policy: &QuotaPolicy) -> Self {
        let used = record.call_count;
        let limit = policy.limit();
        Self {
            period_key: record.period_key.clone(),
            period: policy.granularity(),
            used,
            limit,
            remaining: limit.saturating_sub(used),
            percentage: used as f64 / limit as f64 * 100.0,
            warning_level: policy.warning_level(used),
        }
    }

    /// Whether no further calls are allowed
    pub fn is_over_limit(&self) -> bool {
        self.used >= self.limit
    }

    /// Human warning for the operation layer
    pub fn warning_message(&self) -> Option<String> {
        if self.is_over_limit() {
            return Some(format!(
                "WARNING: you have reached your {} API limit ({} calls).",
                self.period.adjective(),
                self.limit
            ));
        }
        self.warning_level.map(|level| {
            format!(
                "CAUTION: you have used {:.0}%+ of your {} API limit ({}/{} calls).",
                level * 100.0,
                self.period.adjective(),
                self.used,
                self.limit
            )
        })
    }
}

/// The quota for the current period is used up
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("quota exceeded for {period_key}: {used} of {limit} calls used ({in_flight} in flight)")]
pub struct QuotaExceeded {
    /// Period that is exhausted
    pub period_key: String,
    /// Units already counted
    pub used: u64,
    /// Units reserved by calls still in flight
    pub in_flight: u64,
    /// Units allowed
    pub limit: u64,
}

struct TrackerState {
    current: Option<UsageRecord>,
    /// Whether `current` reflects what the backend holds
    synced: bool,
    in_flight: u64,
}

/// Durable quota accounting shared by every request in the process
pub struct UsageTracker {
    backend: Arc<dyn KvBackend>,
    policy: QuotaPolicy,
    pricing: Pricing,
    state: Mutex<TrackerState>,
}

impl UsageTracker {
    /// Create a tracker enforcing `policy`
    pub fn new(backend: Arc<dyn KvBackend>, policy: QuotaPolicy) -> Self {
        Self {
            backend,
            policy,
            pricing: Pricing::default(),
            state: Mutex::new(TrackerState {
                current: None,
                synced: false,
                in_flight: 0,
            }),
        }
    }

    /// Price counted calls with `pricing` instead of the default list
    pub fn with_pricing(mut self, pricing: Pricing) -> Self {
        self.pricing = pricing;
        self
    }

    /// Policy this tracker enforces
    pub fn policy(&self) -> &QuotaPolicy {
        &self.policy
    }

    /// Prices applied to counted calls
    pub fn pricing(&self) -> &Pricing {
        &self.pricing
    }

    /// Atomically count one call of `units` against the period of `now`
    ///
    /// Returns the period's new count. On a storage error the in-memory count
    /// has still been applied; only its persistence failed. While the period's
    /// stored record cannot be read the call is counted in memory only and
    /// [`MeterError::UsageNotLoaded`] is returned.
    pub fn record_call(&self, now: DateTime<Utc>, operation: &str, units: u64) -> Result<u64> {
        let mut state = self.state.lock();
        self.apply(&mut state, now, operation, units)
    }

    /// Record of the period containing `now`, without changing it
    pub fn current_usage(&self, now: DateTime<Utc>) -> UsageRecord {
        let mut state = self.state.lock();
        self.current_mut(&mut state, now).clone()
    }

    /// Usage of the period containing `now` evaluated against the policy
    pub fn status(&self, now: DateTime<Utc>) -> UsageStatus {
        UsageStatus::from_record(&self.current_usage(now), &self.policy)
    }

    /// Spend of the period containing `now` against the credit
    pub fn spend(&self, now: DateTime<Utc>) -> SpendStatus {
        self.pricing.spend(&self.current_usage(now))
    }

    /// Whether the period containing `now` has reached the limit
    pub fn over_limit(&self, now: DateTime<Utc>) -> bool {
        self.current_usage(now).call_count >= self.policy.limit()
    }

    /// Claim `units` of quota for a call about to be made
    ///
    /// Counts calls still in flight so that concurrent misses cannot push the
    /// period past its limit.
    ///
    /// # Arguments
    /// * `now` - Instant that selects the accounting period
    /// * `units` - Quota the call will consume; 0 is treated as 1
    ///
    /// # Returns
    /// A [`Reservation`] to commit once the call succeeds, or
    /// [`QuotaExceeded`] if the period has no room for `units` more.
    pub fn try_reserve(
        &self,
        now: DateTime<Utc>,
        units: u64,
    ) -> std::result::Result<Reservation<'_>, QuotaExceeded> {
        let units = units.max(1);
        let mut state = self.state.lock();
        let record = self.current_mut(&mut state, now);
        let used = record.call_count;
        let period_key = record.period_key.clone();

        let claimed = used
            .checked_add(state.in_flight)
            .and_then(|total| total.checked_add(units));
        if claimed.map_or(true, |total| total > self.policy.limit()) {
            return Err(QuotaExceeded {
                period_key,
                used,
                in_flight: state.in_flight,
                limit: self.policy.limit(),
            });
        }

        state.in_flight += units;
        Ok(Reservation {
            tracker: self,
            units,
            settled: false,
        })
    }

    /// Units currently reserved by calls in flight
    pub fn in_flight(&self) -> u64 {
        self.state.lock().in_flight
    }

    /// Every known period, oldest first
    pub fn history(&self) -> Result<Vec<UsageRecord>> {
        let mut records: BTreeMap<String, UsageRecord> = BTreeMap::new();
        for (key, raw) in self.backend.scan_prefix(KEY_PREFIX)? {
            match serde_json::from_slice::<UsageRecord>(&raw) {
                Ok(record) => {
                    records.insert(record.period_key.clone(), record);
                }
                Err(e) => warn!("skipping unreadable usage record {}: {}", key, e),
            }
        }

        let state = self.state.lock();
        if let Some(current) = &state.current {
            let key = &current.period_key;
            if state.synced {
                records.insert(key.clone(), current.clone());
            } else if current.call_count > 0 {
                records
                    .entry(key.clone())
                    .or_insert_with(|| UsageRecord::empty(key))
                    .absorb(current);
            }
        }

        Ok(records.into_values().collect())
    }

    fn release(&self, units: u64) {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(units);
    }

    fn commit_reserved(
        &self,
        now: DateTime<Utc>,
        operation: &str,
        units: u64,
    ) -> Result<u64> {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(units);
        self.apply(&mut state, now, operation, units)
    }

    fn apply(
        &self,
        state: &mut TrackerState,
        now: DateTime<Utc>,
        operation: &str,
        units: u64,
    ) -> Result<u64> {
        let cost = self.pricing.cost(operation, units);
        let record = self.current_mut(state, now);
        record.count(now, operation, units, cost);
        let count = record.call_count;
        let period_key = record.period_key.clone();
        let encoded = serde_json::to_vec(&*record)?;
        debug!(period = %period_key, count, operation, "counted provider call");

        // writing now would replace the stored count with the in-memory one
        if !state.synced {
            return Err(MeterError::UsageNotLoaded(period_key));
        }

        let key = format!("{}{}", KEY_PREFIX, period_key);
        self.backend.put(&key, &encoded)?;
        Ok(count)
    }

    /// Period key for `now`, never earlier than the newest period seen
    fn active_key(&self, state: &TrackerState, now: DateTime<Utc>) -> String {
        let key = self.policy.granularity().period_key(now);
        match &state.current {
            Some(current) if current.period_key > key => current.period_key.clone(),
            _ => key,
        }
    }

    fn current_mut<'s>(
        &self,
        state: &'s mut TrackerState,
        now: DateTime<Utc>,
    ) -> &'s mut UsageRecord {
        let key = self.active_key(state, now);
        let rolled = state
            .current
            .as_ref()
            .map_or(true, |current| current.period_key != key);

        if rolled || !state.synced {
            let loaded = self.load(&key);
            let pending = if rolled { None } else { state.current.take() };

            if rolled {
                if let Some(previous) = &state.current {
                    info!("Usage period rolled over from {} to {}", previous.period_key, key);
                }
            }

            state.current = Some(match loaded {
                Ok(mut record) => {
                    if let Some(pending) = &pending {
                        record.absorb(pending);
                    }
                    state.synced = true;
                    record
                }
                Err(e) => {
                    warn!("usage record {} unavailable, counting in memory: {}", key, e);
                    state.synced = false;
                    pending.unwrap_or_else(|| UsageRecord::empty(&key))
                }
            });
        }

        state
            .current
            .get_or_insert_with(|| UsageRecord::empty(&key))
    }

    fn load(&self, period_key: &str) -> Result<UsageRecord> {
        let key = format!("{}{}", KEY_PREFIX, period_key);
        let Some(raw) = self.backend.get(&key)? else {
            return Ok(UsageRecord::empty(period_key));
        };

        match serde_json::from_slice::<UsageRecord>(&raw) {
            Ok(record) => Ok(record),
            Err(e) => {
                warn!("unreadable usage record {} reset to zero: {}", key, e);
                Ok(UsageRecord::empty(period_key))
            }
        }
    }
}

/// Quota claimed for one in-flight provider call
///
/// Dropping it without [`Reservation::commit`] gives the units back.
#[must_use = "dropping a reservation releases it"]
pub struct Reservation<'a> {
    tracker: &'a UsageTracker,
    units: u64,
    settled: bool,
}

impl std::fmt::Debug for Reservation<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("units", &self.units)
            .field("settled", &self.settled)
            .finish_non_exhaustive()
    }
}

impl Reservation<'_> {
    /// Units held by this reservation
    pub fn units(&self) -> u64 {
        self.units
    }

    /// Turn the reservation into a counted call
    pub fn commit(mut self, now: DateTime<Utc>, operation: &str) -> Result<u64> {
        self.settled = true;
        self.tracker.commit_reserved(now, operation, self.units)
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.tracker.release(self.units);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use meterstoredb::{Error as StoreError, LogStore, MemoryStore};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    /// Backend whose reads can be switched off while writes keep working
    struct BlindBackend {
        inner: MemoryStore,
        blind: AtomicBool,
    }

    impl KvBackend for BlindBackend {
        fn get(&self, key: &str) -> meterstoredb::Result<Option<Vec<u8>>> {
            if self.blind.load(Ordering::SeqCst) {
                return Err(StoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "read failed",
                )));
            }
            self.inner.get(key)
        }

        fn put(&self, key: &str, value: &[u8]) -> meterstoredb::Result<()> {
            self.inner.put(key, value)
        }

        fn delete(&self, key: &str) -> meterstoredb::Result<bool> {
            self.inner.delete(key)
        }

        fn scan_prefix(&self, prefix: &str) -> meterstoredb::Result<Vec<(String, Vec<u8>)>> {
            self.inner.scan_prefix(prefix)
        }
    }

    fn stored_count(backend: &dyn KvBackend, period_key: &str) -> u64 {
        let raw = backend
            .get(&format!("usage/{}", period_key))
            .unwrap()
            .unwrap();
        serde_json::from_slice::<UsageRecord>(&raw).unwrap().call_count
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, day, hour, 0, 0).unwrap()
    }

    fn tracker(limit: u64) -> (UsageTracker, Arc<MemoryStore>) {
        let backend = Arc::new(MemoryStore::new());
        let tracker = UsageTracker::new(backend.clone(), QuotaPolicy::daily(limit).unwrap());
        (tracker, backend)
    }

    #[test]
    fn test_record_and_status() {
        let (tracker, _) = tracker(4);
        assert_eq!(tracker.current_usage(at(1, 9)).call_count, 0);

        assert_eq!(tracker.record_call(at(1, 9), "search", 1).unwrap(), 1);
        assert_eq!(tracker.record_call(at(1, 10), "details", 2).unwrap(), 3);

        let record = tracker.current_usage(at(1, 11));
        assert_eq!(record.period_key, "2024-06-01");
        assert_eq!(record.first_call_at, Some(at(1, 9)));
        assert_eq!(record.last_call_at, Some(at(1, 10)));
        assert_eq!(record.calls_by_operation["details"], 2);

        let status = tracker.status(at(1, 11));
        assert_eq!(status.used, 3);
        assert_eq!(status.remaining, 1);
        assert_eq!(status.percentage, 75.0);
        assert_eq!(status.warning_level, Some(0.75));
        assert!(status.warning_message().unwrap().starts_with("CAUTION"));
        assert!(!tracker.over_limit(at(1, 11)));

        tracker.record_call(at(1, 12), "search", 1).unwrap();
        assert!(tracker.over_limit(at(1, 12)));
        assert!(tracker
            .status(at(1, 12))
            .warning_message()
            .unwrap()
            .starts_with("WARNING"));
    }

    #[test]
    fn test_rollover_keeps_previous_record() {
        let (tracker, backend) = tracker(500);
        tracker.record_call(at(1, 23), "search", 1).unwrap();
        tracker.record_call(at(2, 1), "search", 1).unwrap();

        let history = tracker.history().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].period_key, "2024-06-01");
        assert_eq!(history[0].call_count, 1);
        assert_eq!(history[1].period_key, "2024-06-02");
        assert_eq!(history[1].call_count, 1);

        let before = backend.get("usage/2024-06-01").unwrap().unwrap();
        // a clock stepping back into the superseded day counts in the newest one
        tracker.record_call(at(1, 23), "search", 1).unwrap();
        assert_eq!(backend.get("usage/2024-06-01").unwrap().unwrap(), before);
        assert_eq!(tracker.current_usage(at(2, 2)).call_count, 2);
    }

    #[test]
    fn test_reservation_limits_in_flight_calls() {
        let (tracker, _) = tracker(2);
        let now = at(1, 9);

        let first = tracker.try_reserve(now, 1).unwrap();
        let second = tracker.try_reserve(now, 1).unwrap();
        let denied = tracker.try_reserve(now, 1).unwrap_err();
        assert_eq!(denied.in_flight, 2);
        assert_eq!(denied.used, 0);

        drop(second);
        assert_eq!(tracker.in_flight(), 1);

        assert_eq!(first.commit(now, "search").unwrap(), 1);
        assert_eq!(tracker.in_flight(), 0);

        let third = tracker.try_reserve(now, 1).unwrap();
        assert_eq!(third.units(), 1);
        third.commit(now, "search").unwrap();
        assert!(tracker.try_reserve(now, 1).is_err());
        assert!(tracker.over_limit(now));
    }

    #[test]
    fn test_units_larger_than_limit_are_denied() {
        let (tracker, _) = tracker(10);
        assert!(tracker.try_reserve(at(1, 9), 11).is_err());
        assert!(tracker.try_reserve(at(1, 9), 10).is_ok());
    }

    #[test]
    fn test_concurrent_increments() {
        let (tracker, _) = tracker(10_000);
        let tracker = Arc::new(tracker);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        tracker.record_call(at(1, 9), "search", 1).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(tracker.current_usage(at(1, 9)).call_count, 400);
    }

    #[test]
    fn test_survives_restart() {
        let dir = TempDir::new().unwrap();
        let policy = QuotaPolicy::monthly(1000).unwrap();

        {
            let backend = Arc::new(LogStore::open(dir.path()).unwrap());
            let tracker = UsageTracker::new(backend, policy.clone());
            tracker.record_call(at(1, 9), "search", 5).unwrap();
        }

        let backend = Arc::new(LogStore::open(dir.path()).unwrap());
        let tracker = UsageTracker::new(backend, policy);
        let record = tracker.current_usage(at(20, 9));
        assert_eq!(record.period_key, "2024-06");
        assert_eq!(record.call_count, 5);

        assert_eq!(
            tracker
                .current_usage(at(20, 9) + Duration::days(15))
                .call_count,
            0
        );
    }

    #[test]
    fn test_corrupt_record_counts_as_zero() {
        let (tracker, backend) = tracker(10);
        backend.put("usage/2024-06-01", b"{not json").unwrap();

        assert_eq!(tracker.current_usage(at(1, 9)).call_count, 0);
        assert_eq!(tracker.record_call(at(1, 9), "search", 1).unwrap(), 1);
    }

    #[test]
    fn test_zero_units_cannot_slip_past_limit() {
        let (tracker, _) = tracker(1);
        tracker.record_call(at(1, 9), "search", 1).unwrap();

        assert!(tracker.try_reserve(at(1, 9), 0).is_err());
        assert!(tracker.try_reserve(at(1, 9), u64::MAX).is_err());
        assert_eq!(tracker.in_flight(), 0);
    }

    #[test]
    fn test_zero_units_reserve_one() {
        let (tracker, _) = tracker(2);
        let reservation = tracker.try_reserve(at(1, 9), 0).unwrap();
        assert_eq!(reservation.units(), 1);
        assert_eq!(reservation.commit(at(1, 9), "search").unwrap(), 1);
    }

    #[test]
    fn test_huge_reservation_with_calls_in_flight() {
        let (tracker, _) = tracker(10);
        let _held = tracker.try_reserve(at(1, 9), 3).unwrap();

        let err = tracker.try_reserve(at(1, 9), u64::MAX - 1).unwrap_err();
        assert_eq!(err.in_flight, 3);
        assert_eq!(tracker.in_flight(), 3);
    }

    #[test]
    fn test_unreadable_record_is_not_overwritten() {
        let backend = Arc::new(BlindBackend {
            inner: MemoryStore::new(),
            blind: AtomicBool::new(false),
        });
        let first = UsageTracker::new(backend.clone(), QuotaPolicy::daily(1000).unwrap());
        for _ in 0..300 {
            first.record_call(at(1, 9), "search", 1).unwrap();
        }

        backend.blind.store(true, Ordering::SeqCst);
        let second = UsageTracker::new(backend.clone(), QuotaPolicy::daily(1000).unwrap());
        let result = second.record_call(at(1, 10), "search", 1);
        assert!(matches!(result, Err(MeterError::UsageNotLoaded(ref key)) if key == "2024-06-01"));
        assert_eq!(stored_count(&backend.inner, "2024-06-01"), 300);
        assert_eq!(second.current_usage(at(1, 10)).call_count, 1);

        backend.blind.store(false, Ordering::SeqCst);
        assert_eq!(second.record_call(at(1, 11), "search", 1).unwrap(), 302);
        assert_eq!(stored_count(&backend.inner, "2024-06-01"), 302);
    }

    #[test]
    fn test_cost_accumulates_with_calls() {
        let (tracker, backend) = tracker(100);
        tracker.record_call(at(1, 9), "places_nearby", 2).unwrap();
        tracker.record_call(at(1, 10), "geocoding", 1).unwrap();
        tracker.record_call(at(1, 11), "unpriced", 1).unwrap();

        let spend = tracker.spend(at(1, 12));
        assert!((spend.total_cost - 0.069).abs() < 1e-9);
        assert!(spend.within_credit);

        let reopened = UsageTracker::new(backend, QuotaPolicy::daily(100).unwrap())
            .with_pricing(Pricing::free());
        assert!((reopened.current_usage(at(1, 12)).total_cost - 0.069).abs() < 1e-9);
        reopened.record_call(at(1, 13), "places_nearby", 1).unwrap();
        assert!((reopened.spend(at(1, 13)).total_cost - 0.069).abs() < 1e-9);
    }

    #[test]
    fn test_record_without_cost_field_loads() {
        let (tracker, backend) = tracker(10);
        backend
            .put(
                "usage/2024-06-01",
                br#"{"period_key":"2024-06-01","call_count":4,"first_call_at":null,"last_call_at":null}"#,
            )
            .unwrap();

        let record = tracker.current_usage(at(1, 9));
        assert_eq!(record.call_count, 4);
        assert_eq!(record.total_cost, 0.0);
    }
}
