//! Canonical JSON and reference hashing.
//!
//! Canonical JSON is the byte form every server agrees on before hashing or
//! signing: object keys sorted lexicographically, no insignificant
//! whitespace. Event identifiers and signatures are both computed over it.

use std::collections::BTreeMap;

use base64::Engine as _;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Produce canonical JSON (sorted keys, no extra whitespace).
pub fn canonical_json(value: &Value) -> String {
    sort_keys(value).to_string()
}

/// SHA-256 of `bytes`, unpadded base64url.
pub fn sha256_b64(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest)
}

/// Remove the keys that never take part in an event's reference hash.
pub fn strip_unhashed(value: &mut Value) {
    if let Some(obj) = value.as_object_mut() {
        obj.remove("event_id");
        obj.remove("signatures");
        obj.remove("unsigned");
    }
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: serde_json::Map<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), sort_keys(v)))
                .collect::<BTreeMap<_, _>>()
                .into_iter()
                .collect();
            Value::Object(sorted)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}
