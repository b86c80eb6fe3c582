//! Data fingerprinting: detects whether a bundle carries new information.
//!
//! The digest is taken over a canonical form of the bundle:
//! - object keys sorted, at every depth
//! - volatile keys (fetch/capture timestamps, request ids) removed
//! - lists treated as sets (sorted by canonical form)
//! - confidence/score values quantized to the category's noise step
//! - counts bucketed by powers of two, so a new message-count bucket changes the
//!   digest but a single extra message does not

use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};

use crate::insights::policy::CategoryPolicy;
use crate::insights::providers::DataBundle;

/// Reserved fingerprint for empty or insufficient bundles.
pub const EMPTY_FINGERPRINT: &str = "empty";

const FINGERPRINT_VERSION: &str = "v1";

const VOLATILE_KEYS: &[&str] = &[
    "fetched_at",
    "captured_at",
    "generated_at",
    "updated_at",
    "timestamp",
    "as_of",
    "request_id",
];

/// Computes the deterministic digest of `bundle`. Never fails.
pub fn compute_fingerprint(bundle: &DataBundle, policy: &CategoryPolicy) -> String {
    if bundle.is_empty() {
        return EMPTY_FINGERPRINT.to_string();
    }

    let mut root = bundle.fields.clone();
    root.insert(
        "data_point_count".to_string(),
        Value::from(bundle.data_point_count),
    );

    let canonical = canonicalize(&Value::Object(root), None, policy.confidence_noise);
    // Serializing a Value cannot fail.
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();

    let digest = Sha256::digest(&bytes);
    format!("{FINGERPRINT_VERSION}:{digest:x}")
}

/// True when `fingerprint` came from real data (not the empty sentinel).
pub fn is_meaningful(fingerprint: &str) -> bool {
    fingerprint != EMPTY_FINGERPRINT
}

fn canonicalize(value: &Value, key: Option<&str>, noise: f64) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map
                .keys()
                .filter(|k| !VOLATILE_KEYS.contains(&k.as_str()))
                .collect();
            keys.sort();

            // Insert in sorted order so the output is sorted whether or not
            // serde_json preserves insertion order.
            let mut out = Map::new();
            for k in keys {
                out.insert(k.clone(), canonicalize(&map[k.as_str()], Some(k), noise));
            }
            Value::Object(out)
        }
        Value::Array(items) => {
            let mut canonical: Vec<(String, Value)> = items
                .iter()
                .map(|item| {
                    let value = canonicalize(item, key, noise);
                    (value.to_string(), value)
                })
                .collect();
            canonical.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Array(canonical.into_iter().map(|(_, v)| v).collect())
        }
        Value::Number(n) => canonical_number(n, key, noise),
        other => other.clone(),
    }
}

fn canonical_number(n: &Number, key: Option<&str>, noise: f64) -> Value {
    let Some(key) = key else {
        return Value::Number(n.clone());
    };
    let key = key.to_ascii_lowercase();

    if key.contains("confidence") || key.contains("score") {
        if let Some(x) = n.as_f64() {
            let bucket = (x / noise).round() as i64;
            return Value::String(format!("q{bucket}"));
        }
    }

    if key.ends_with("count") {
        if let Some(x) = n.as_f64() {
            return Value::String(format!("b{}", count_bucket(x)));
        }
    }

    Value::Number(n.clone())
}

/// 0 → 0, 1 → 1, 2..3 → 2, 4..7 → 3, 8..15 → 4, ...
fn count_bucket(x: f64) -> u32 {
    if x < 1.0 {
        return 0;
    }
    let n = x as u64;
    u64::BITS - n.leading_zeros()
}
