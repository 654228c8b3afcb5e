//! Log format parser using nom
//!
//! File format:
//! ```text
//! METERKV\n
//! [version: u32 little-endian]
//! ...records...
//! ```
//!
//! Record format:
//! ```text
//! P <key_len> <value_len>\n<key><value>\n
//! D <key_len>\n<key>\n
//! ```

use nom::{
    branch::alt,
    bytes::complete::{tag, take},
    character::complete::{char, digit1},
    combinator::map_res,
    sequence::{delimited, pair, separated_pair, terminated},
    IResult,
};

use crate::error::{Error, Result};

/// Magic header for log files
pub const LOG_MAGIC: &[u8] = b"METERKV\n";

/// Current log format version
pub const LOG_VERSION: u32 = 1;

/// Total header length in bytes
pub const HEADER_LEN: usize = LOG_MAGIC.len() + 4;

/// A single replayable log record
#[derive(Debug, Clone, PartialEq)]
pub enum Record<'a> {
    /// Key was written with a value
    Put {
        /// Raw key bytes
        key: &'a [u8],
        /// Raw value bytes
        value: &'a [u8],
    },
    /// Key was deleted
    Delete {
        /// Raw key bytes
        key: &'a [u8],
    },
}

/// Parse the log file header, returning the format version
pub fn parse_header(input: &[u8]) -> Result<u32> {
    if input.len() < HEADER_LEN {
        return Err(Error::Parse("Input too short for header".to_string()));
    }

    if &input[0..LOG_MAGIC.len()] != LOG_MAGIC {
        return Err(Error::Parse("Invalid log magic header".to_string()));
    }

    let mut version = [0u8; 4];
    version.copy_from_slice(&input[LOG_MAGIC.len()..HEADER_LEN]);
    let version = u32::from_le_bytes(version);

    if version != LOG_VERSION {
        return Err(Error::Parse(format!("Unsupported log version {}", version)));
    }

    Ok(version)
}

/// Create a log file header
pub fn create_header() -> Vec<u8> {
    let mut header = Vec::with_capacity(HEADER_LEN);
    header.extend_from_slice(LOG_MAGIC);
    header.extend_from_slice(&LOG_VERSION.to_le_bytes());
    header
}

fn length(input: &[u8]) -> IResult<&[u8], usize> {
    map_res(map_res(digit1, std::str::from_utf8), |s: &str| {
        s.parse::<usize>()
    })(input)
}

fn put_record(input: &[u8]) -> IResult<&[u8], Record<'_>> {
    let (input, (key_len, value_len)) = delimited(
        tag("P "),
        separated_pair(length, char(' '), length),
        char('\n'),
    )(input)?;
    let (input, (key, value)) =
        terminated(pair(take(key_len), take(value_len)), char('\n'))(input)?;
    Ok((input, Record::Put { key, value }))
}

fn delete_record(input: &[u8]) -> IResult<&[u8], Record<'_>> {
    let (input, key_len) = delimited(tag("D "), length, char('\n'))(input)?;
    let (input, key) = terminated(take(key_len), char('\n'))(input)?;
    Ok((input, Record::Delete { key }))
}

/// Parse one record from the front of `input`
pub fn parse_record(input: &[u8]) -> IResult<&[u8], Record<'_>> {
    alt((put_record, delete_record))(input)
}

/// Encode a put record
pub fn encode_put(key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut out = format!("P {} {}\n", key.len(), value.len()).into_bytes();
    out.reserve(key.len() + value.len() + 1);
    out.extend_from_slice(key);
    out.extend_from_slice(value);
    out.push(b'\n');
    out
}

/// Encode a delete record
pub fn encode_delete(key: &[u8]) -> Vec<u8> {
    let mut out = format!("D {}\n", key.len()).into_bytes();
    out.extend_from_slice(key);
    out.push(b'\n');
    out
}
