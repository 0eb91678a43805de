//! Stable content fingerprints for raw payloads.

use serde_json::{Map, Value as JsonValue};
use sha2::{Digest, Sha256};

/// Keys dropped at every nesting level before hashing: wall-clock readings and
/// echoed status codes that change on every poll.
pub const VOLATILE_KEYS: [&str; 11] = [
    "dt",
    "t",
    "time",
    "timestamp",
    "ts",
    "server_time",
    "fetched_at",
    "recorded_at",
    "updated_at",
    "created_at",
    "cod",
];

pub fn is_volatile(key: &str) -> bool {
    VOLATILE_KEYS.contains(&key)
}

/// Returns a copy of `payload` with every volatile key removed, recursively.
/// Arrays are walked element-wise; scalars pass through.
pub fn strip_volatile(payload: &JsonValue) -> JsonValue {
    match payload {
        JsonValue::Object(map) => {
            let stripped: Map<String, JsonValue> = map
                .iter()
                .filter(|(key, _)| !is_volatile(key))
                .map(|(key, value)| (key.clone(), strip_volatile(value)))
                .collect();
            JsonValue::Object(stripped)
        }
        JsonValue::Array(items) => JsonValue::Array(items.iter().map(strip_volatile).collect()),
        scalar => scalar.clone(),
    }
}

/// Compact JSON with object keys in byte order, independent of how the map
/// was built.
pub fn canonical_json(value: &JsonValue) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &JsonValue, out: &mut String) {
    match value {
        JsonValue::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (idx, key) in keys.into_iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                out.push_str(&JsonValue::String(key.clone()).to_string());
                out.push(':');
                if let Some(child) = map.get(key) {
                    write_canonical(child, out);
                }
            }
            out.push('}');
        }
        JsonValue::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// 64-char hex SHA-256 of the volatile-stripped canonical form.
pub fn fingerprint(payload: &JsonValue) -> String {
    sha256_hex(canonical_json(&strip_volatile(payload)).as_bytes())
}
