//! Call Wrapper: cache lookup, quota guard and accounting around a provider
//!
//! Every request goes through the same sequence. A cache hit returns without
//! touching the quota. A miss reserves quota first, so a rejected request never
//! reaches the provider, then awaits the provider and finally caches the payload
//! and counts the call back to back. If the returned future is dropped while
//! the provider is running, the reservation is released and nothing is cached
//! or counted.

use std::future::Future;
use std::sync::Arc;

use chrono::Duration;
use tracing::{debug, warn};

use crate::cache::{default_ttl, CacheStore};
use crate::clock::Clock;
use crate::error::CallError;
use crate::fingerprint::{ArgSet, Fingerprint};
use crate::usage::{UsageStatus, UsageTracker};

/// Where a payload came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Served from the cache; no quota consumed
    Cache,
    /// Fetched from the provider and counted
    Provider,
}

/// A logical request to a provider operation
#[derive(Debug, Clone)]
pub struct CallRequest {
    /// Operation identifier, e.g. `search` or `details`
    pub operation: String,
    /// Arguments that identify the request
    pub args: ArgSet,
    /// Cache lifetime; the client default when `None`
    pub ttl: Option<Duration>,
    /// Quota units one provider call costs
    pub units: u64,
}

impl CallRequest {
    /// Request costing one unit with the default lifetime
    pub fn new(operation: impl Into<String>, args: ArgSet) -> Self {
        Self {
            operation: operation.into(),
            args,
            ttl: None,
            units: 1,
        }
    }

    /// Override the cache lifetime
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Override the quota cost; every call costs at least one unit
    pub fn with_units(mut self, units: u64) -> Self {
        self.units = units.max(1);
        self
    }

    /// Cache identity of this request
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::compute(&self.operation, &self.args)
    }
}

/// A served payload with the quota state after serving it
#[derive(Debug, Clone)]
pub struct CallOutcome {
    /// Cache or provider
    pub source: Source,
    /// Provider payload, opaque to the wrapper
    pub payload: Vec<u8>,
    /// Usage of the current period once this call is accounted
    pub usage_after_call: UsageStatus,
    /// Identity the payload is cached under
    pub fingerprint: Fingerprint,
}

impl CallOutcome {
    /// Whether the payload came from the cache
    pub fn is_cached(&self) -> bool {
        self.source == Source::Cache
    }

    /// Quota warning to surface next to the payload, if any
    pub fn warning(&self) -> Option<String> {
        self.usage_after_call.warning_message()
    }
}

/// Metering front for one provider, shared by all concurrent requests
pub struct MeteredClient {
    cache: Arc<CacheStore>,
    tracker: Arc<UsageTracker>,
    clock: Arc<dyn Clock>,
    default_ttl: Duration,
}

impl MeteredClient {
    /// Wrap a cache and tracker
    pub fn new(cache: Arc<CacheStore>, tracker: Arc<UsageTracker>, clock: Arc<dyn Clock>) -> Self {
        Self {
            cache,
            tracker,
            clock,
            default_ttl: default_ttl(),
        }
    }

    /// Lifetime for requests that do not carry their own
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Shared cache
    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    /// Shared tracker
    pub fn tracker(&self) -> &Arc<UsageTracker> {
        &self.tracker
    }

    /// Serve `request` from the cache or through `provider`
    ///
    /// `provider` is only invoked on a cache miss with quota available.
    /// Its failures are returned untouched and are neither cached nor counted.
    /// Storage failures never fail the call: a failed lookup is a miss and a
    /// failed write is logged.
    ///
    /// # Arguments
    /// * `request` - Operation, arguments, quota units and optional TTL
    /// * `provider` - Performs the real call; awaited at most once
    ///
    /// # Returns
    /// The payload with its [`Source`] and the period usage after the call,
    /// [`CallError::QuotaExceeded`] if the quota left no room, or
    /// [`CallError::Provider`] carrying the provider's own error.
    pub async fn call<F, Fut, E>(
        &self,
        request: &CallRequest,
        provider: F,
    ) -> Result<CallOutcome, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>, E>>,
    {
        let fingerprint = request.fingerprint();

        match self.cache.get(&fingerprint) {
            Ok(Some(payload)) => {
                debug!(operation = %request.operation, %fingerprint, "served from cache");
                return Ok(CallOutcome {
                    source: Source::Cache,
                    payload,
                    usage_after_call: self.tracker.status(self.clock.now()),
                    fingerprint,
                });
            }
            Ok(None) => {}
            Err(e) => warn!("cache lookup for {} failed, treating as miss: {}", fingerprint, e),
        }

        let reservation = self.tracker.try_reserve(self.clock.now(), request.units)?;

        let payload = provider().await.map_err(CallError::Provider)?;

        let ttl = request.ttl.unwrap_or(self.default_ttl);
        if let Err(e) = self.cache.put(&fingerprint, &payload, ttl) {
            warn!("failed to cache {} response {}: {}", request.operation, fingerprint, e);
        }
        let now = self.clock.now();
        if let Err(e) = reservation.commit(now, &request.operation) {
            warn!("failed to persist usage for {}: {}", request.operation, e);
        }

        debug!(operation = %request.operation, %fingerprint, "fetched from provider");
        Ok(CallOutcome {
            source: Source::Provider,
            payload,
            usage_after_call: self.tracker.status(now),
            fingerprint,
        })
    }
}
