//! Canonical JSON rendering and content hashing.
//!
//! Every content hash in the system (checkpoint state hashes, handoff
//! package hashes, acceptance proof ids, derived task/run/thread ids) is a
//! sha256 over this canonical form: object keys sorted, compact separators,
//! ASCII-safe. `serde_json::Value` maps are BTreeMap-backed, so rendering a
//! `Value` already yields sorted keys.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Render any serializable value in canonical form.
pub fn canonical_json<T: Serialize>(value: &T) -> String {
    let tree = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
    serde_json::to_string(&tree).unwrap_or_else(|_| "null".to_string())
}

/// Hex sha256 of a canonical JSON rendering.
pub fn canonical_hash<T: Serialize>(value: &T) -> String {
    sha256_hex(canonical_json(value).as_bytes())
}

/// Hex sha256 of raw bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
