//! `name=value` request arguments on the command line

use anyhow::{bail, Result};
use metercache::ArgValue;

/// Split `name=value` and type the value the way a provider call would
///
/// `true`/`false` become booleans, numbers become numbers, a value containing
/// commas becomes a list, everything else is text.
pub fn parse_pair(pair: &str) -> Result<(&str, ArgValue)> {
    let Some((name, value)) = pair.split_once('=') else {
        bail!("expected name=value, got '{}'", pair);
    };
    if name.trim().is_empty() {
        bail!("argument name is empty in '{}'", pair);
    }

    let value = if value.contains(',') {
        ArgValue::List(value.split(',').map(parse_scalar).collect())
    } else {
        parse_scalar(value)
    };
    Ok((name, value))
}

fn parse_scalar(raw: &str) -> ArgValue {
    let trimmed = raw.trim();
    match trimmed {
        "true" => return ArgValue::Bool(true),
        "false" => return ArgValue::Bool(false),
        _ => {}
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return ArgValue::Int(i);
    }
    match trimmed.parse::<f64>() {
        Ok(f) if f.is_finite() => ArgValue::Float(f),
        _ => ArgValue::Text(raw.to_string()),
    }
}
