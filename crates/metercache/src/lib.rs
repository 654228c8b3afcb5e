//! # metercache
//!
//! Response cache and quota metering for calls to rate-limited lookup providers.
//!
//! ## Architecture
//! - **CacheStore**: fingerprint to payload entries with TTL, persisted in a
//!   `meterstoredb` log
//! - **UsageTracker**: per-day or per-month call counters with warning
//!   thresholds and a hard limit
//! - **MeteredClient**: wraps a provider closure with cache lookup, quota
//!   reservation and accounting
//! - **StatsReporter**: hit rate, savings estimate, spend against the free
//!   credit and quota warnings
//!
//! A [`MeterContext`] wires one instance of each for the process.

#![warn(missing_docs)]

mod cache;
mod client;
mod clock;
mod config;
mod context;
mod credential;
mod error;
mod fingerprint;
mod policy;
mod pricing;
mod report;
mod stats;
mod usage;

pub use cache::{default_ttl, CacheEntry, CacheStore};
pub use client::{CallOutcome, CallRequest, MeteredClient, Source};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, CredentialConfig, MeterConfig, QuotaConfig};
pub use context::{MeterContext, CACHE_DIR, USAGE_DIR};
pub use credential::{
    ChainCredential, Credential, CredentialError, CredentialSource, EnvCredential, FileCredential,
};
pub use error::{CallError, MeterError, Result};
pub use fingerprint::{ArgSet, ArgValue, Fingerprint};
pub use policy::{PeriodGranularity, PolicyError, QuotaPolicy};
pub use pricing::{Pricing, SpendStatus};
pub use report::{StatsReporter, StatsSnapshot};
pub use stats::{CacheCounters, CacheStats};
pub use usage::{QuotaExceeded, Reservation, UsageRecord, UsageStatus, UsageTracker};
