//! Provider credential lookup
//!
//! The credential is opaque: it is handed to the provider capability and never
//! parsed, logged or cached.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;
use tracing::debug;

use crate::config::CredentialConfig;

/// No usable credential was found
#[derive(Debug, Error)]
pub enum CredentialError {
    /// Every configured source came up empty
    #[error("no provider credential found (tried {tried})")]
    Missing {
        /// Sources that were consulted
        tried: String,
    },

    /// A credential file exists but could not be read
    #[error("failed to read credential file {path}: {source}")]
    Unreadable {
        /// Offending file
        path: PathBuf,
        /// Underlying I/O failure
        source: std::io::Error,
    },
}

/// Opaque provider secret
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Wrap a secret
    pub fn new(secret: impl Into<String>) -> Self {
        Credential(secret.into())
    }

    /// The secret itself, for the provider capability only
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Somewhere a credential may come from
pub trait CredentialSource: Send + Sync {
    /// Look the credential up
    fn credential(&self) -> Result<Credential, CredentialError>;

    /// Short description for error messages
    fn describe(&self) -> String;
}

/// Credential from an environment variable
#[derive(Debug, Clone)]
pub struct EnvCredential {
    var: String,
}

impl EnvCredential {
    /// Read `var`
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl CredentialSource for EnvCredential {
    fn credential(&self) -> Result<Credential, CredentialError> {
        match std::env::var(&self.var) {
            Ok(value) if !value.trim().is_empty() => Ok(Credential::new(value.trim())),
            _ => Err(CredentialError::Missing {
                tried: self.describe(),
            }),
        }
    }

    fn describe(&self) -> String {
        format!("${}", self.var)
    }
}

/// Credential stored as the trimmed contents of a file
#[derive(Debug, Clone)]
pub struct FileCredential {
    path: PathBuf,
}

impl FileCredential {
    /// Read `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CredentialSource for FileCredential {
    fn credential(&self) -> Result<Credential, CredentialError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CredentialError::Missing {
                    tried: self.describe(),
                })
            }
            Err(source) => {
                return Err(CredentialError::Unreadable {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let secret = raw.trim();
        if secret.is_empty() {
            return Err(CredentialError::Missing {
                tried: self.describe(),
            });
        }
        Ok(Credential::new(secret))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Sources tried in order; the first success wins
pub struct ChainCredential {
    sources: Vec<Box<dyn CredentialSource>>,
}

impl ChainCredential {
    /// Chain `sources`
    pub fn new(sources: Vec<Box<dyn CredentialSource>>) -> Self {
        Self { sources }
    }

    /// Environment variable first, then the file
    pub fn from_config(config: &CredentialConfig) -> Self {
        let mut sources: Vec<Box<dyn CredentialSource>> = Vec::new();
        if let Some(var) = &config.env_var {
            sources.push(Box::new(EnvCredential::new(var.clone())));
        }
        if let Some(path) = &config.file {
            sources.push(Box::new(FileCredential::new(path.clone())));
        }
        Self::new(sources)
    }
}

impl CredentialSource for ChainCredential {
    fn credential(&self) -> Result<Credential, CredentialError> {
        for source in &self.sources {
            match source.credential() {
                Ok(credential) => return Ok(credential),
                Err(CredentialError::Missing { .. }) => {
                    debug!("no credential in {}", source.describe());
                }
                Err(e) => return Err(e),
            }
        }
        Err(CredentialError::Missing {
            tried: self.describe(),
        })
    }

    fn describe(&self) -> String {
        if self.sources.is_empty() {
            return "no sources".to_string();
        }
        self.sources
            .iter()
            .map(|s| s.describe())
            .collect::<Vec<_>>()
            .join(", ")
    }
}
