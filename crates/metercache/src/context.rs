//! Process-wide wiring of the stores, client and reporter

use std::sync::Arc;

use meterstoredb::{KvBackend, LogStore};
use tracing::info;

use crate::cache::CacheStore;
use crate::client::MeteredClient;
use crate::clock::Clock;
use crate::config::MeterConfig;
use crate::credential::{ChainCredential, Credential, CredentialError, CredentialSource};
use crate::error::Result;
use crate::report::{StatsReporter, StatsSnapshot};
use crate::usage::UsageTracker;

/// Subdirectory of `data_dir` holding cache entries
pub const CACHE_DIR: &str = "cache";

/// Subdirectory of `data_dir` holding usage records
pub const USAGE_DIR: &str = "usage";

/// One shared cache, tracker, client and reporter for the process
pub struct MeterContext {
    config: MeterConfig,
    cache: Arc<CacheStore>,
    tracker: Arc<UsageTracker>,
    client: Arc<MeteredClient>,
    reporter: Arc<StatsReporter>,
    credential: Arc<dyn CredentialSource>,
}

impl MeterContext {
    /// Open the durable stores under `config.data_dir`
    pub fn open(config: MeterConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let cache_store = LogStore::open(config.data_dir.join(CACHE_DIR))?;
        let usage_store = LogStore::open(config.data_dir.join(USAGE_DIR))?;
        info!(
            "Opened meter stores in {} ({} cached entries)",
            config.data_dir.display(),
            cache_store.len()
        );

        Self::with_backends(config, Arc::new(cache_store), Arc::new(usage_store), clock)
    }

    /// Wire a context over caller-provided backends
    pub fn with_backends(
        config: MeterConfig,
        cache_backend: Arc<dyn KvBackend>,
        usage_backend: Arc<dyn KvBackend>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let policy = config.validate()?;

        let cache = Arc::new(
            CacheStore::new(cache_backend, clock.clone())
                .with_sweep_interval(config.sweep_interval()),
        );
        let tracker = Arc::new(
            UsageTracker::new(usage_backend, policy).with_pricing(config.pricing.clone()),
        );
        let client = Arc::new(
            MeteredClient::new(cache.clone(), tracker.clone(), clock.clone())
                .with_default_ttl(config.cache_ttl()),
        );
        let reporter = Arc::new(
            StatsReporter::new(cache.clone(), tracker.clone(), clock)
                .with_unit_cost(config.assumed_unit_cost),
        );
        let credential = Arc::new(ChainCredential::from_config(&config.credential));

        Ok(Self {
            config,
            cache,
            tracker,
            client,
            reporter,
            credential,
        })
    }

    /// Configuration the context was built from
    pub fn config(&self) -> &MeterConfig {
        &self.config
    }

    /// Shared cache store
    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    /// Shared usage tracker
    pub fn tracker(&self) -> &Arc<UsageTracker> {
        &self.tracker
    }

    /// Shared call wrapper
    pub fn client(&self) -> &Arc<MeteredClient> {
        &self.client
    }

    /// Shared stats reporter
    pub fn reporter(&self) -> &Arc<StatsReporter> {
        &self.reporter
    }

    /// Current stats snapshot
    pub fn usage_stats(&self) -> StatsSnapshot {
        self.reporter.report()
    }

    /// Look up the provider credential
    pub fn credential(&self) -> std::result::Result<Credential, CredentialError> {
        self.credential.credential()
    }

    /// Where the credential is looked up, for diagnostics
    pub fn credential_sources(&self) -> String {
        self.credential.describe()
    }
}
