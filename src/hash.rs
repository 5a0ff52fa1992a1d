//! Deterministic SHA-256 content hashing for manifests.
//!
//! The journal keys a transaction's manifest by a `metadata_hash` that must
//! be reproducible regardless of mapping-key order or insignificant
//! whitespace in the source document (SPEC_FULL.md §3 invariant, §8
//! property test). We serialize the manifest to `serde_json::Value`, sort
//! every object's keys recursively, then hash the compact (whitespace-free)
//! JSON encoding.

use std::fmt;

use ring::digest;
use serde::Serialize;
use serde_json::Value;

/// A SHA-256 digest rendered as a lowercase hex string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash(String);

impl ContentHash {
    /// Compute the digest of raw bytes.
    pub fn compute(content: &[u8]) -> Self {
        let digest = digest::digest(&digest::SHA256, content);
        Self(hex::encode(digest.as_ref()))
    }

    /// Compute the digest of a serializable value after canonicalising it:
    /// object keys are sorted recursively and the result is serialized
    /// without extraneous whitespace.
    pub fn compute_canonical<T: Serialize>(value: &T) -> Self {
        let mut json = serde_json::to_value(value).unwrap_or(Value::Null);
        canonicalize(&mut json);
        let bytes = serde_json::to_vec(&json).unwrap_or_default();
        Self::compute(&bytes)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<ContentHash> for String {
    fn from(h: ContentHash) -> Self {
        h.0
    }
}

/// Recursively sort object keys so that hashing is insensitive to the
/// source document's mapping-key order.
fn canonicalize(value: &mut Value) {
    match value {
        Value::Array(items) => {
            for item in items.iter_mut() {
                canonicalize(item);
            }
        }
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = std::mem::take(map).into_iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            let mut sorted = serde_json::Map::with_capacity(entries.len());
            for (key, mut value) in entries {
                canonicalize(&mut value);
                sorted.insert(key, value);
            }
            *map = sorted;
        }
        _ => {}
    }
}
