//! Request fingerprints
//!
//! A fingerprint addresses one cache entry:
//!
//! ```text
//! Fingerprint = SHA256("fp2" \0 analysis_type \0 canonical_json(params) \0 active_run_id)
//! ```
//!
//! # Canonicalization
//!
//! - Keys are trimmed, lower-cased and sorted (`BTreeMap`); two raw keys that
//!   fold to the same key are rejected
//! - Integer literals are normalized exactly (`+3` and `3` agree); tokens with
//!   leading zeros such as `0451` are codes and stay as written
//! - Decimal and exponent literals are rounded to fixed precision with trailing
//!   zeros removed (`0.50`, `5e-1` and `0.5` agree)
//! - Booleans are lower-cased, other strings trimmed
//! - JSON arrays become comma-joined canonical elements
//!
//! so `?eps=0.5&min_samples=3` and `?min_samples=3.0&eps=0.50` produce the same key.
//! Because the active run id is part of the input, activating another run makes every
//! fingerprint computed against the old run unreachable.

use crate::error::AnalysisError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Fingerprint format version - bump when the hashed layout changes.
pub const FINGERPRINT_VERSION: &str = "fp2";

/// Maximum digits after the decimal point for decimal parameter values.
const DECIMAL_PRECISION: usize = 6;

/// Keys that only shape the response, never the underlying computation.
pub const PRESENTATION_KEYS: [&str; 4] = ["top_k", "limit", "offset", "entity_prefix"];

/// Keys whose values are matched textually and must not be reformatted.
const VERBATIM_KEYS: [&str; 1] = ["entity_prefix"];

/// Request parameters in canonical form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CanonicalParams(BTreeMap<String, String>);

impl CanonicalParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// From a decoded query string. `InvalidParameters` when two keys differ only by case
    /// or surrounding whitespace.
    pub fn from_query(query: &HashMap<String, String>) -> Result<Self, AnalysisError> {
        let mut params = Self::new();
        for (k, v) in query {
            let key = canonical_key(k);
            if key.is_empty() {
                continue;
            }
            let value = if VERBATIM_KEYS.contains(&key.as_str()) {
                v.trim().to_string()
            } else {
                canonical_scalar(v)
            };
            params.insert_unique(k, key, value)?;
        }
        Ok(params)
    }

    /// From a JSON object. Non-object values yield no parameters.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, AnalysisError> {
        let mut params = Self::new();
        if let Some(map) = value.as_object() {
            for (k, v) in map {
                let key = canonical_key(k);
                if key.is_empty() {
                    continue;
                }
                let canonical = if VERBATIM_KEYS.contains(&key.as_str()) {
                    verbatim_json_value(v)
                } else {
                    canonical_json_value(v)
                };
                if let Some(canonical) = canonical {
                    params.insert_unique(k, key, canonical)?;
                }
            }
        }
        Ok(params)
    }

    fn insert_unique(&mut self, raw: &str, key: String, value: String) -> Result<(), AnalysisError> {
        if self.0.contains_key(&key) {
            return Err(AnalysisError::InvalidParameters(format!(
                "parameter '{}' is given more than once (as '{}')",
                key, raw
            )));
        }
        self.0.insert(key, value);
        Ok(())
    }

    /// Insert one raw key/value pair, replacing any earlier value. Empty keys are ignored.
    pub fn insert(&mut self, key: &str, value: &str) {
        let key = canonical_key(key);
        if key.is_empty() {
            return;
        }
        let value = if VERBATIM_KEYS.contains(&key.as_str()) {
            value.trim().to_string()
        } else {
            canonical_scalar(value)
        };
        self.0.insert(key, value);
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }

    pub fn into_map(self) -> BTreeMap<String, String> {
        self.0
    }

    /// The subset that determines what gets computed (everything but presentation keys).
    pub fn computation(&self) -> CanonicalParams {
        CanonicalParams(
            self.0
                .iter()
                .filter(|(k, _)| !PRESENTATION_KEYS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Deterministic serialized form.
    pub fn canonical_string(&self) -> String {
        // BTreeMap<String, String> serialization cannot fail.
        serde_json::to_string(&self.0).unwrap_or_default()
    }

    /// Stable hash of the computation parameters, used to find an existing run
    /// computed from the same inputs.
    pub fn params_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(FINGERPRINT_VERSION.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.computation().canonical_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

fn canonical_key(key: &str) -> String {
    key.trim().to_ascii_lowercase()
}

fn canonical_scalar(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some(integer) = canonical_integer(trimmed) {
        return integer;
    }
    if let Some(decimal) = canonical_decimal(trimmed) {
        return decimal;
    }
    if trimmed.eq_ignore_ascii_case("true") || trimmed.eq_ignore_ascii_case("false") {
        return trimmed.to_ascii_lowercase();
    }
    trimmed.to_string()
}

/// `[+-]digits`, normalized through `i128`. Leading-zero tokens and values outside
/// `i128` are returned unchanged.
fn canonical_integer(token: &str) -> Option<String> {
    let digits = token.strip_prefix(['+', '-']).unwrap_or(token);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return Some(token.to_string());
    }
    match token.parse::<i128>() {
        Ok(n) => Some(n.to_string()),
        Err(_) => Some(token.to_string()),
    }
}

/// Decimal or exponent literal, e.g. `0.50`, `-1.`, `5e-1`.
fn canonical_decimal(token: &str) -> Option<String> {
    let numeric_chars = token
        .bytes()
        .all(|b| b.is_ascii_digit() || matches!(b, b'.' | b'e' | b'E' | b'+' | b'-'));
    if !numeric_chars || !token.bytes().any(|b| b.is_ascii_digit()) {
        return None;
    }
    let n = token.parse::<f64>().ok().filter(|n| n.is_finite())?;
    Some(format_decimal(n))
}

fn canonical_json_value(value: &serde_json::Value) -> Option<String> {
    use serde_json::Value;
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i.to_string())
            } else if let Some(u) = n.as_u64() {
                Some(u.to_string())
            } else {
                n.as_f64().map(format_decimal)
            }
        }
        Value::String(s) => Some(canonical_scalar(s)),
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(canonical_json_value)
                .collect::<Vec<_>>()
                .join(","),
        ),
        Value::Object(_) => Some(value.to_string()),
    }
}

fn verbatim_json_value(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.trim().to_string()),
        other => Some(other.to_string()),
    }
}

fn format_decimal(n: f64) -> String {
    let fixed = format!("{:.*}", DECIMAL_PRECISION, n);
    let trimmed = fixed.trim_end_matches('0').trim_end_matches('.');
    // -0.0000001 rounds to "-0"
    if trimmed == "-0" {
        return "0".to_string();
    }
    trimmed.to_string()
}

/// Opaque cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn compute(analysis_type: &str, params: &CanonicalParams, active_run_id: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(FINGERPRINT_VERSION.as_bytes());
        hasher.update([0u8]);
        hasher.update(analysis_type.as_bytes());
        hasher.update([0u8]);
        hasher.update(params.canonical_string().as_bytes());
        hasher.update([0u8]);
        hasher.update(active_run_id.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Fingerprint {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}
