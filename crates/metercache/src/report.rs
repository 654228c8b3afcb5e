//! Stats Reporter

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cache::CacheStore;
use crate::clock::Clock;
use crate::error::Result;
use crate::pricing::SpendStatus;
use crate::usage::{UsageStatus, UsageTracker};

/// Point-in-time view of cache effectiveness and quota usage
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    /// Start of the counting epoch
    pub since: DateTime<Utc>,
    /// Lookups served from the cache
    pub hits: u64,
    /// Lookups that fell through
    pub misses: u64,
    /// `hits / (hits + misses)`, 0 with no lookups
    pub cache_hit_rate: f64,
    /// `hits * assumed_unit_cost`
    pub estimated_cost_saved: f64,
    /// Current period usage
    pub usage: UsageStatus,
    /// Current period spend against the free credit
    pub spend: SpendStatus,
    /// Quota warning, if a threshold was reached
    pub warning: Option<String>,
    /// Credit warning, if spend passed 75% of the credit
    pub credit_warning: Option<String>,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "# Cache")?;
        writeln!(f, "since:{}", self.since.to_rfc3339())?;
        writeln!(f, "cache_hits:{}", self.hits)?;
        writeln!(f, "cache_misses:{}", self.misses)?;
        writeln!(f, "cache_hit_rate:{:.2}", self.cache_hit_rate)?;
        writeln!(f, "estimated_cost_saved:{:.2}", self.estimated_cost_saved)?;
        writeln!(f)?;
        writeln!(f, "# Usage")?;
        writeln!(f, "period:{} ({})", self.usage.period_key, self.usage.period)?;
        writeln!(f, "used:{}", self.usage.used)?;
        writeln!(f, "limit:{}", self.usage.limit)?;
        writeln!(f, "remaining:{}", self.usage.remaining)?;
        writeln!(f, "percentage:{:.1}", self.usage.percentage)?;
        writeln!(f)?;
        writeln!(f, "# Spend")?;
        writeln!(f, "estimated_cost:${:.2}", self.spend.total_cost)?;
        writeln!(f, "credit_remaining:${:.2}", self.spend.credit_remaining)?;
        writeln!(f, "estimated_remaining_calls:{}", self.spend.estimated_remaining_calls)?;
        write!(f, "within_credit:{}", self.spend.within_credit)?;
        for warning in self.warning.iter().chain(&self.credit_warning) {
            write!(f, "\n\n{}", warning)?;
        }
        Ok(())
    }
}

/// Derives [`StatsSnapshot`]s from the shared counters
///
/// The counting epoch belongs to the cache store, so it survives restarts
/// together with the counters.
pub struct StatsReporter {
    cache: Arc<CacheStore>,
    tracker: Arc<UsageTracker>,
    clock: Arc<dyn Clock>,
    assumed_unit_cost: f64,
}

impl StatsReporter {
    /// Reporter over the cache's counters and the tracker's usage
    pub fn new(cache: Arc<CacheStore>, tracker: Arc<UsageTracker>, clock: Arc<dyn Clock>) -> Self {
        Self {
            cache,
            tracker,
            clock,
            assumed_unit_cost: 0.0,
        }
    }

    /// Price of one provider call, used for the savings estimate
    pub fn with_unit_cost(mut self, cost: f64) -> Self {
        self.assumed_unit_cost = cost;
        self
    }

    /// Current snapshot; has no side effects
    pub fn report(&self) -> StatsSnapshot {
        let counters = self.cache.stats().snapshot();
        let now = self.clock.now();
        let record = self.tracker.current_usage(now);
        let usage = UsageStatus::from_record(&record, self.tracker.policy());
        let spend = self.tracker.pricing().spend(&record);
        StatsSnapshot {
            since: self.cache.stats_since(),
            hits: counters.hits,
            misses: counters.misses,
            cache_hit_rate: counters.hit_rate(),
            estimated_cost_saved: counters.hits as f64 * self.assumed_unit_cost,
            warning: usage.warning_message(),
            credit_warning: spend.warning_message(),
            usage,
            spend,
        }
    }

    /// Zero the cache counters and start a new epoch
    pub fn reset_epoch(&self) -> Result<()> {
        self.cache.reset_stats(self.clock.now())
    }
}
