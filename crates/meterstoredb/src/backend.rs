//! Backend trait shared by the durable log and the in-memory store

use std::collections::HashMap;

use ahash::RandomState;
use parking_lot::RwLock;

use crate::error::{Error, Result};

/// Maximum key size (1 KiB)
pub const MAX_KEY_SIZE: usize = 1024;

/// Maximum value size (16 MiB)
pub const MAX_VALUE_SIZE: usize = 16 * 1024 * 1024;

/// Key/value medium used by the cache store and the usage tracker.
///
/// Implementations must be safe to share across threads. A `put` followed by
/// a `get` of the same key from any thread observes the written value, and
/// concurrent writers to one key resolve as last writer wins.
pub trait KvBackend: Send + Sync {
    /// Read the value stored under `key`
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Insert or replace the value stored under `key`
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Remove `key`, returning whether it was present
    fn delete(&self, key: &str) -> Result<bool>;

    /// All entries whose key starts with `prefix`, ordered by key
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Whether the medium would benefit from `compact`
    fn needs_compaction(&self) -> bool {
        false
    }

    /// Reclaim space held by superseded values
    fn compact(&self) -> Result<()> {
        Ok(())
    }
}

pub(crate) fn validate(key: &str, value_len: usize) -> Result<()> {
    if key.is_empty() || key.len() > MAX_KEY_SIZE || key.contains('\n') {
        return Err(Error::InvalidKey(key.to_string()));
    }
    if value_len > MAX_VALUE_SIZE {
        return Err(Error::ValueTooLarge(value_len));
    }
    Ok(())
}

/// Non-durable backend kept entirely in memory
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Vec<u8>, RandomState>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KvBackend for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        validate(key, value.len())?;
        self.entries.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.write().remove(key).is_some())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut out: Vec<_> = self
            .entries
            .read()
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}
