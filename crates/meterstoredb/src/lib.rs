//! # meterstoredb
//!
//! Durable key/value medium for Meter.
//!
//! ## Design
//! - Append-only log of put/delete records, replayed into memory on open
//! - Single writer lock, unlimited concurrent readers
//! - Corrupt or missing logs open as empty stores instead of failing
//! - Manual compaction once superseded records dominate the file

#![warn(missing_docs)]

mod backend;
mod error;
mod parser;
mod storage;

pub use backend::{KvBackend, MemoryStore, MAX_KEY_SIZE, MAX_VALUE_SIZE};
pub use error::{Error, Result};
pub use storage::{LogStore, LOG_FILE};
