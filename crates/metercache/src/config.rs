//! Configuration loaded from a JSON file

use std::path::{Path, PathBuf};

use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::policy::{PeriodGranularity, PolicyError, QuotaPolicy};
use crate::pricing::Pricing;

/// Configuration could not be loaded or is invalid
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("failed to read config {path}: {source}")]
    Read {
        /// Offending file
        path: PathBuf,
        /// Underlying I/O failure
        source: std::io::Error,
    },

    /// The file is not valid JSON for [`MeterConfig`]
    #[error("failed to parse config {path}: {source}")]
    Parse {
        /// Offending file
        path: PathBuf,
        /// Underlying parse failure
        source: serde_json::Error,
    },

    /// The quota section is not a valid policy
    #[error("invalid quota policy: {0}")]
    Policy(#[from] PolicyError),

    /// A duration does not fit the supported time range
    #[error("{field} = {value} is out of range")]
    OutOfRange {
        /// Offending field
        field: &'static str,
        /// Configured value
        value: u64,
    },
}

/// Quota section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Calls allowed per period
    pub limit: u64,
    /// `day` or `month`
    pub period: PeriodGranularity,
    /// Ascending fractions of the limit that trigger warnings
    pub warn_thresholds: Vec<f64>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            limit: 500,
            period: PeriodGranularity::Day,
            warn_thresholds: QuotaPolicy::DEFAULT_THRESHOLDS.to_vec(),
        }
    }
}

/// Where the provider credential is looked up, in order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialConfig {
    /// Environment variable holding the key
    pub env_var: Option<String>,
    /// File whose trimmed contents are the key
    pub file: Option<PathBuf>,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            env_var: Some("PROVIDER_API_KEY".to_string()),
            file: None,
        }
    }
}

/// Process configuration; every field has a default
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeterConfig {
    /// Directory holding the `cache` and `usage` stores
    pub data_dir: PathBuf,
    /// Default cache lifetime in seconds
    pub cache_ttl_secs: u64,
    /// Spacing of opportunistic sweeps in seconds; 0 disables them
    pub sweep_interval_secs: u64,
    /// Price of one provider call for savings estimates
    pub assumed_unit_cost: f64,
    /// Quota policy
    pub quota: QuotaConfig,
    /// Credential lookup
    pub credential: CredentialConfig,
    /// Provider prices and free credit
    pub pricing: Pricing,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            cache_ttl_secs: 24 * 60 * 60,
            sweep_interval_secs: 60 * 60,
            assumed_unit_cost: 0.0,
            quota: QuotaConfig::default(),
            credential: CredentialConfig::default(),
            pricing: Pricing::default(),
        }
    }
}

impl MeterConfig {
    /// Read and validate a JSON config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: MeterConfig =
            serde_json::from_slice(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;

        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Load `path` if given, otherwise use the defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Validated quota policy
    pub fn policy(&self) -> Result<QuotaPolicy, PolicyError> {
        QuotaPolicy::new(
            self.quota.limit,
            self.quota.warn_thresholds.clone(),
            self.quota.period,
        )
    }

    /// Check every section, returning the quota policy
    pub fn validate(&self) -> Result<QuotaPolicy, ConfigError> {
        let policy = self.policy()?;
        checked_secs("cache_ttl_secs", self.cache_ttl_secs)?;
        checked_secs("sweep_interval_secs", self.sweep_interval_secs)?;
        Ok(policy)
    }

    /// Default cache lifetime; out-of-range values mean "never expires"
    pub fn cache_ttl(&self) -> Duration {
        checked_secs("cache_ttl_secs", self.cache_ttl_secs).unwrap_or(Duration::MAX)
    }

    /// Opportunistic sweep spacing, `None` when disabled
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| {
            checked_secs("sweep_interval_secs", self.sweep_interval_secs).unwrap_or(Duration::MAX)
        })
    }
}

fn checked_secs(field: &'static str, value: u64) -> Result<Duration, ConfigError> {
    i64::try_from(value)
        .ok()
        .and_then(Duration::try_seconds)
        .ok_or(ConfigError::OutOfRange { field, value })
}
