//! Canonical idempotency keys for play intents.
//!
//! Two intents that mean the same thing must hash to the same 32-byte
//! digest regardless of JSON key order or whitespace. The key is computed
//! server-side only; clients contribute no secret.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Quantization window for catch-up start positions (milliseconds).
///
/// Start positions within the same 30-second window are treated as the same
/// semantic intent; a finer window would defeat deduplication for players
/// that resolve "now" slightly apart.
const CATCHUP_BUCKET_MS: u64 = 30_000;

/// Serializes a JSON value with keys sorted lexicographically at every
/// level and no insignificant whitespace.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    fn write(value: &Value, out: &mut String) {
        match value {
            Value::Object(map) => {
                out.push('{');
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&Value::String((*key).clone()).to_string());
                    out.push(':');
                    write(&map[*key], out);
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            other => out.push_str(&other.to_string()),
        }
    }

    let mut out = String::new();
    write(value, &mut out);
    out
}

/// Bucket component of the key: `"0"` for live, `t<window>` for catch-up.
///
/// The `t` prefix keeps a catch-up start at position zero distinct from a
/// live intent.
#[must_use]
pub fn bucket_for(start_ms: Option<u64>) -> String {
    match start_ms {
        None => "0".to_string(),
        Some(ms) => format!("t{}", ms / CATCHUP_BUCKET_MS),
    }
}

/// Computes the canonical intent key:
/// `SHA-256("v1:stream.start:" + serviceRef + ":" + profile_canonical + ":" + bucket)`,
/// rendered as lowercase hex.
#[must_use]
pub fn intent_key(service_ref: &str, profile: &Value, start_ms: Option<u64>) -> String {
    let canonical = canonical_json(profile);
    let bucket = bucket_for(start_ms);
    let mut hasher = Sha256::new();
    hasher.update(b"v1:stream.start:");
    hasher.update(service_ref.as_bytes());
    hasher.update(b":");
    hasher.update(canonical.as_bytes());
    hasher.update(b":");
    hasher.update(bucket.as_bytes());
    hex::encode(hasher.finalize())
}
