//! Storage engine implementation
//!
//! File layout:
//! - `store.log`: header followed by append-only put/delete records
//!
//! The whole live key set is held in memory; the log is replayed on open.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use ahash::RandomState;
use memmap2::Mmap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::backend::{validate, KvBackend};
use crate::error::{Error, Result};
use crate::parser::{
    create_header, encode_delete, encode_put, parse_header, parse_record, Record, HEADER_LEN,
};

/// Name of the log file inside the store directory
pub const LOG_FILE: &str = "store.log";

/// Dead bytes tolerated before compaction is suggested (64 KiB)
const COMPACTION_FLOOR: u64 = 64 * 1024;

type Index = HashMap<String, Vec<u8>, RandomState>;

struct LogState {
    file: File,
    log_len: u64,
    dead_bytes: u64,
}

impl LogState {
    /// Cut the file back to the last acknowledged record
    fn discard_unacknowledged(&mut self) -> std::io::Result<()> {
        self.file.set_len(self.log_len)
    }
}

struct Replay {
    index: Index,
    valid_len: u64,
    dead_bytes: u64,
    reset: bool,
}

/// LogStore is the durable key/value handle
pub struct LogStore {
    /// Path to the store directory
    path: PathBuf,

    log_path: PathBuf,

    /// Writer side: file handle and size accounting
    state: Mutex<LogState>,

    /// In-memory index: key -> current value
    index: RwLock<Index>,

    /// Is the store closed?
    closed: RwLock<bool>,
}

fn put_record_len(key_len: usize, value_len: usize) -> u64 {
    (format!("P {} {}\n", key_len, value_len).len() + key_len + value_len + 1) as u64
}

fn replay(file: &File) -> Result<Replay> {
    let mut index = Index::default();
    if file.metadata()?.len() == 0 {
        return Ok(Replay {
            index,
            valid_len: 0,
            dead_bytes: 0,
            reset: true,
        });
    }

    // SAFETY: the mapping is read-only, lives only for this function, and the
    // log is not written until replay has finished.
    let map = unsafe { Mmap::map(file)? };

    if let Err(e) = parse_header(&map) {
        warn!("Discarding unreadable store log: {}", e);
        return Ok(Replay {
            index,
            valid_len: 0,
            dead_bytes: 0,
            reset: true,
        });
    }

    let mut input = &map[HEADER_LEN..];
    let mut dead_bytes = 0u64;

    while !input.is_empty() {
        let (rest, record) = match parse_record(input) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(
                    "Truncating corrupt store log tail at offset {}: {:?}",
                    map.len() - input.len(),
                    e
                );
                break;
            }
        };
        let consumed = (input.len() - rest.len()) as u64;

        let raw_key = match &record {
            Record::Put { key, .. } | Record::Delete { key } => *key,
        };
        let key = match std::str::from_utf8(raw_key) {
            Ok(k) => k.to_string(),
            Err(_) => {
                warn!(
                    "Truncating store log at non UTF-8 key, offset {}",
                    map.len() - input.len()
                );
                break;
            }
        };

        match record {
            Record::Put { value, .. } => {
                let key_len = key.len();
                if let Some(old) = index.insert(key, value.to_vec()) {
                    dead_bytes += put_record_len(key_len, old.len());
                }
            }
            Record::Delete { .. } => {
                dead_bytes += consumed;
                if let Some(old) = index.remove(&key) {
                    dead_bytes += put_record_len(key.len(), old.len());
                }
            }
        }

        input = rest;
    }

    Ok(Replay {
        index,
        valid_len: (map.len() - input.len()) as u64,
        dead_bytes,
        reset: false,
    })
}

impl LogStore {
    /// Open or create a store at the given directory
    ///
    /// A missing, empty or unreadable log is treated as an empty store. A
    /// corrupt tail (for example a torn write) is truncated back to the last
    /// complete record.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        let log_path = path.join(LOG_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&log_path)?;

        let replay = replay(&file)?;

        if replay.reset {
            file.set_len(0)?;
            file.write_all(&create_header())?;
        } else if replay.valid_len < file.metadata()?.len() {
            file.set_len(replay.valid_len)?;
        }

        let log_len = file.metadata()?.len();
        debug!(
            "Opened store {:?}: {} keys, {} bytes",
            log_path,
            replay.index.len(),
            log_len
        );

        Ok(LogStore {
            path: path.to_path_buf(),
            log_path,
            state: Mutex::new(LogState {
                file,
                log_len,
                dead_bytes: replay.dead_bytes,
            }),
            index: RwLock::new(replay.index),
            closed: RwLock::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if *self.closed.read() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Store directory
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `value` under `key`, replacing any previous value
    pub fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.ensure_open()?;
        validate(key, value.len())?;

        let record = encode_put(key.as_bytes(), value);

        let mut state = self.state.lock();
        self.append(&mut state, &record)?;

        let mut index = self.index.write();
        if let Some(old) = index.insert(key.to_string(), value.to_vec()) {
            state.dead_bytes += put_record_len(key.len(), old.len());
        }

        Ok(())
    }

    /// Read the value stored under `key`
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        Ok(self.index.read().get(key).cloned())
    }

    /// Delete `key`, returning whether it was present
    pub fn delete(&self, key: &str) -> Result<bool> {
        self.ensure_open()?;

        let mut state = self.state.lock();
        let old_len = match self.index.read().get(key) {
            Some(old) => old.len(),
            None => return Ok(false),
        };

        let record = encode_delete(key.as_bytes());
        self.append(&mut state, &record)?;
        state.dead_bytes += record.len() as u64 + put_record_len(key.len(), old_len);

        self.index.write().remove(key);
        Ok(true)
    }

    /// Append one encoded record
    ///
    /// A failed write may leave part of the record behind. It is cut off again
    /// so later records are not stranded behind it on replay; if that fails
    /// too, the store closes itself.
    fn append(&self, state: &mut LogState, record: &[u8]) -> Result<()> {
        if let Err(e) = state.file.write_all(record) {
            match state.discard_unacknowledged() {
                Ok(()) => warn!("Write to {:?} failed, torn record discarded: {}", self.log_path, e),
                Err(truncate) => {
                    warn!(
                        "Write to {:?} failed and the log could not be repaired ({}), closing store: {}",
                        self.log_path, truncate, e
                    );
                    *self.closed.write() = true;
                }
            }
            return Err(e.into());
        }
        state.log_len += record.len() as u64;
        Ok(())
    }

    /// All entries whose key starts with `prefix`, ordered by key
    pub fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        self.ensure_open()?;
        let mut out: Vec<_> = self
            .index
            .read()
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    /// Get the number of live keys
    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }

    /// Current size of the log file in bytes
    pub fn log_len(&self) -> u64 {
        self.state.lock().log_len
    }

    /// Whether superseded records outweigh live ones
    pub fn needs_compaction(&self) -> bool {
        let state = self.state.lock();
        let live = state.log_len - HEADER_LEN as u64 - state.dead_bytes;
        state.dead_bytes > COMPACTION_FLOOR && state.dead_bytes > live
    }

    /// Rewrite the log with only the live records
    pub fn compact(&self) -> Result<()> {
        self.ensure_open()?;

        let mut state = self.state.lock();
        let index = self.index.read();

        let tmp_path = self.log_path.with_extension("log.compact");
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            writer.write_all(&create_header())?;
            for (key, value) in index.iter() {
                writer.write_all(&encode_put(key.as_bytes(), value))?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.log_path)?;

        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&self.log_path)?;
        let before = state.log_len;
        state.log_len = file.metadata()?.len();
        state.file = file;
        state.dead_bytes = 0;

        info!(
            "Compacted store {:?}: {} -> {} bytes",
            self.log_path, before, state.log_len
        );
        Ok(())
    }

    /// Flush written records to disk
    pub fn sync(&self) -> Result<()> {
        self.ensure_open()?;
        self.state.lock().file.sync_all()?;
        Ok(())
    }

    /// Close the store and fsync all changes
    pub fn close(&self) -> Result<()> {
        if *self.closed.read() {
            return Ok(());
        }

        self.state.lock().file.sync_all()?;
        *self.closed.write() = true;

        Ok(())
    }
}

impl KvBackend for LogStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        LogStore::get(self, key)
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        LogStore::put(self, key, value)
    }

    fn delete(&self, key: &str) -> Result<bool> {
        LogStore::delete(self, key)
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        LogStore::scan_prefix(self, prefix)
    }

    fn needs_compaction(&self) -> bool {
        LogStore::needs_compaction(self)
    }

    fn compact(&self) -> Result<()> {
        LogStore::compact(self)
    }
}

impl Drop for LogStore {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
