//! Quota policy: limit, accounting period and warning thresholds

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Invalid quota configuration
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PolicyError {
    /// A zero limit would reject every call
    #[error("quota limit must be greater than zero")]
    ZeroLimit,

    /// Thresholds are fractions of the limit
    #[error("warning threshold {0} is outside (0, 1]")]
    ThresholdOutOfRange(f64),

    /// Thresholds must be listed lowest first without repeats
    #[error("warning thresholds must be strictly ascending")]
    ThresholdsNotAscending,

    /// Unknown period name
    #[error("unknown period '{0}', expected 'day' or 'month'")]
    UnknownPeriod(String),
}

/// Quota accounting window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodGranularity {
    /// Calendar day (UTC), keyed `YYYY-MM-DD`
    #[default]
    Day,
    /// Calendar month (UTC), keyed `YYYY-MM`
    Month,
}

impl PeriodGranularity {
    /// Key of the period containing `now`
    pub fn period_key(&self, now: DateTime<Utc>) -> String {
        match self {
            PeriodGranularity::Day => now.format("%Y-%m-%d").to_string(),
            PeriodGranularity::Month => now.format("%Y-%m").to_string(),
        }
    }

    /// Adjective used in human messages
    pub fn adjective(&self) -> &'static str {
        match self {
            PeriodGranularity::Day => "daily",
            PeriodGranularity::Month => "monthly",
        }
    }
}

impl fmt::Display for PeriodGranularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeriodGranularity::Day => f.write_str("day"),
            PeriodGranularity::Month => f.write_str("month"),
        }
    }
}

impl FromStr for PeriodGranularity {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "day" | "daily" => Ok(PeriodGranularity::Day),
            "month" | "monthly" => Ok(PeriodGranularity::Month),
            other => Err(PolicyError::UnknownPeriod(other.to_string())),
        }
    }
}

/// Immutable quota settings for the process lifetime
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaPolicy {
    limit: u64,
    warn_thresholds: Vec<f64>,
    granularity: PeriodGranularity,
}

impl QuotaPolicy {
    /// Thresholds used when none are given
    pub const DEFAULT_THRESHOLDS: [f64; 2] = [0.75, 0.90];

    /// Build a validated policy
    pub fn new(
        limit: u64,
        warn_thresholds: Vec<f64>,
        granularity: PeriodGranularity,
    ) -> Result<Self, PolicyError> {
        if limit == 0 {
            return Err(PolicyError::ZeroLimit);
        }
        if let Some(bad) = warn_thresholds
            .iter()
            .find(|t| !(**t > 0.0 && **t <= 1.0))
        {
            return Err(PolicyError::ThresholdOutOfRange(*bad));
        }
        if warn_thresholds.windows(2).any(|w| w[0] >= w[1]) {
            return Err(PolicyError::ThresholdsNotAscending);
        }

        Ok(Self {
            limit,
            warn_thresholds,
            granularity,
        })
    }

    /// Per-day limit with the default thresholds
    pub fn daily(limit: u64) -> Result<Self, PolicyError> {
        Self::new(
            limit,
            Self::DEFAULT_THRESHOLDS.to_vec(),
            PeriodGranularity::Day,
        )
    }

    /// Per-month limit with the default thresholds
    pub fn monthly(limit: u64) -> Result<Self, PolicyError> {
        Self::new(
            limit,
            Self::DEFAULT_THRESHOLDS.to_vec(),
            PeriodGranularity::Month,
        )
    }

    /// Maximum calls per period
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Ascending warning fractions
    pub fn warn_thresholds(&self) -> &[f64] {
        &self.warn_thresholds
    }

    /// Accounting window
    pub fn granularity(&self) -> PeriodGranularity {
        self.granularity
    }

    /// Highest threshold that `used` has reached or passed
    pub fn warning_level(&self, used: u64) -> Option<f64> {
        let fraction = used as f64 / self.limit as f64;
        self.warn_thresholds
            .iter()
            .rev()
            .find(|t| fraction >= **t)
            .copied()
    }
}
