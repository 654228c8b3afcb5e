//! Request fingerprints
//!
//! A fingerprint is the hex SHA-256 of the operation id and the canonical
//! JSON form of its normalized arguments. Normalization rules:
//!
//! - argument names are trimmed
//! - absent (`None`) arguments are skipped, so absent and omitted collide
//! - text is trimmed and inner whitespace runs collapse to one space; case
//!   is kept
//! - floats holding an integral value become integers (`-0.0` becomes `0`);
//!   NaN and infinities become their text form
//! - lists keep their order, elements are normalized recursively
//! - arguments are ordered by name

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Largest magnitude at which every integral f64 is exactly an i64
const EXACT_INT_LIMIT: f64 = 9_007_199_254_740_992.0;

/// A single normalized argument value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ArgValue {
    /// Boolean flag
    Bool(bool),
    /// Whole number
    Int(i64),
    /// Non-integral number
    Float(f64),
    /// Free text
    Text(String),
    /// Ordered list
    List(Vec<ArgValue>),
}

impl ArgValue {
    fn normalize(self) -> Self {
        match self {
            ArgValue::Text(s) => ArgValue::Text(s.split_whitespace().collect::<Vec<_>>().join(" ")),
            ArgValue::Float(f) if !f.is_finite() => ArgValue::Text(f.to_string()),
            ArgValue::Float(f) if f.fract() == 0.0 && f.abs() <= EXACT_INT_LIMIT => {
                ArgValue::Int(f as i64)
            }
            ArgValue::List(items) => {
                ArgValue::List(items.into_iter().map(ArgValue::normalize).collect())
            }
            other => other,
        }
    }

    fn to_json(&self) -> Value {
        match self {
            ArgValue::Bool(b) => Value::from(*b),
            ArgValue::Int(i) => Value::from(*i),
            ArgValue::Float(f) => Value::from(*f),
            ArgValue::Text(s) => Value::from(s.as_str()),
            ArgValue::List(items) => Value::Array(items.iter().map(ArgValue::to_json).collect()),
        }
    }
}

impl From<bool> for ArgValue {
    fn from(v: bool) -> Self {
        ArgValue::Bool(v)
    }
}

impl From<i64> for ArgValue {
    fn from(v: i64) -> Self {
        ArgValue::Int(v)
    }
}

impl From<i32> for ArgValue {
    fn from(v: i32) -> Self {
        ArgValue::Int(v.into())
    }
}

impl From<u32> for ArgValue {
    fn from(v: u32) -> Self {
        ArgValue::Int(v.into())
    }
}

impl From<f64> for ArgValue {
    fn from(v: f64) -> Self {
        ArgValue::Float(v)
    }
}

impl From<&str> for ArgValue {
    fn from(v: &str) -> Self {
        ArgValue::Text(v.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(v: String) -> Self {
        ArgValue::Text(v)
    }
}

impl<T: Into<ArgValue>> From<Vec<T>> for ArgValue {
    fn from(v: Vec<T>) -> Self {
        ArgValue::List(v.into_iter().map(Into::into).collect())
    }
}

/// Normalized, name-ordered argument set of one request
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ArgSet {
    args: BTreeMap<String, ArgValue>,
}

impl ArgSet {
    /// Create an empty argument set
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an argument, normalizing name and value
    pub fn insert(&mut self, name: &str, value: impl Into<ArgValue>) {
        self.args
            .insert(name.trim().to_string(), value.into().normalize());
    }

    /// Builder form of [`ArgSet::insert`]
    pub fn with(mut self, name: &str, value: impl Into<ArgValue>) -> Self {
        self.insert(name, value);
        self
    }

    /// Insert only when a value is present
    pub fn with_opt<V: Into<ArgValue>>(mut self, name: &str, value: Option<V>) -> Self {
        if let Some(value) = value {
            self.insert(name, value);
        }
        self
    }

    /// Look up a normalized argument
    pub fn get(&self, name: &str) -> Option<&ArgValue> {
        self.args.get(name.trim())
    }

    /// Number of arguments
    pub fn len(&self) -> usize {
        self.args.len()
    }

    /// Check if there are no arguments
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Canonical JSON text hashed into the fingerprint
    pub fn canonical(&self) -> String {
        let map: Map<String, Value> = self
            .args
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        Value::Object(map).to_string()
    }
}

/// Stable identity of a logically unique request
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hash an operation id together with its arguments
    pub fn compute(operation: &str, args: &ArgSet) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(operation.trim().as_bytes());
        hasher.update([0u8]);
        hasher.update(args.canonical().as_bytes());
        Fingerprint(hex::encode(hasher.finalize()))
    }

    /// Accept a previously rendered fingerprint (64 lowercase hex chars)
    pub fn from_hex(hex: &str) -> Option<Self> {
        let valid = hex.len() == 64
            && hex
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| Fingerprint(hex.to_string()))
    }

    /// Hex rendering
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whitespace_is_normalized_away() {
        let a = ArgSet::new().with("location", "Rome");
        let b = ArgSet::new().with("location", "  Rome \t");
        assert_eq!(
            Fingerprint::compute("search", &a),
            Fingerprint::compute("search", &b)
        );

        let c = ArgSet::new().with("location", "New   York");
        let d = ArgSet::new().with(" location ", "New York");
        assert_eq!(
            Fingerprint::compute("search", &c),
            Fingerprint::compute("search", &d)
        );
    }

    #[test]
    fn test_argument_order_is_irrelevant() {
        let a = ArgSet::new().with("term", "pizza").with("radius", 1500);
        let b = ArgSet::new().with("radius", 1500).with("term", "pizza");
        assert_eq!(a.canonical(), b.canonical());
        assert_eq!(
            Fingerprint::compute("search", &a),
            Fingerprint::compute("search", &b)
        );
    }

    #[test]
    fn test_integral_floats_match_ints() {
        let a = ArgSet::new().with("radius", 1500.0);
        let b = ArgSet::new().with("radius", 1500);
        assert_eq!(a, b);

        let neg_zero = ArgSet::new().with("offset", -0.0);
        assert_eq!(neg_zero.get("offset"), Some(&ArgValue::Int(0)));

        let frac = ArgSet::new().with("lat", 41.9028);
        assert_eq!(frac.get("lat"), Some(&ArgValue::Float(41.9028)));
    }

    #[test]
    fn test_absent_arguments_are_skipped() {
        let a = ArgSet::new()
            .with("location", "Rome")
            .with_opt::<&str>("price", None);
        let b = ArgSet::new().with("location", "Rome");
        assert_eq!(a, b);
    }

    #[test]
    fn test_distinct_requests_differ() {
        let rome = ArgSet::new().with("location", "Rome");
        let milan = ArgSet::new().with("location", "Milan");
        assert_ne!(
            Fingerprint::compute("search", &rome),
            Fingerprint::compute("search", &milan)
        );
        assert_ne!(
            Fingerprint::compute("search", &rome),
            Fingerprint::compute("details", &rome)
        );

        let text = ArgSet::new().with("limit", "10");
        let int = ArgSet::new().with("limit", 10);
        assert_ne!(
            Fingerprint::compute("search", &text),
            Fingerprint::compute("search", &int)
        );
    }

    #[test]
    fn test_case_is_preserved() {
        let a = ArgSet::new().with("business_id", "AbC");
        let b = ArgSet::new().with("business_id", "abc");
        assert_ne!(
            Fingerprint::compute("details", &a),
            Fingerprint::compute("details", &b)
        );
    }

    #[test]
    fn test_lists_keep_order_and_normalize_elements() {
        let a = ArgSet::new().with("origins", vec!["Rome ", "Milan"]);
        let b = ArgSet::new().with("origins", vec!["Rome", " Milan"]);
        let c = ArgSet::new().with("origins", vec!["Milan", "Rome"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_non_finite_floats_are_text() {
        let a = ArgSet::new().with("x", f64::NAN);
        assert_eq!(a.get("x"), Some(&ArgValue::Text("NaN".to_string())));
    }

    #[test]
    fn test_fingerprint_hex_roundtrip() {
        let fp = Fingerprint::compute("search", &ArgSet::new());
        assert_eq!(fp.as_str().len(), 64);
        assert_eq!(Fingerprint::from_hex(fp.as_str()), Some(fp.clone()));
        assert_eq!(Fingerprint::from_hex("not-hex"), None);
    }
}
