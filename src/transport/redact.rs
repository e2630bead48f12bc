//! Log redaction for request parameters and bodies.
//!
//! Large leaves such as base64 stdin payloads are replaced with a size note
//! so request logs stay readable.

use serde_json::{Map, Value};

/// Largest leaf, in bytes, that is logged verbatim.
pub const MAX_LOGGED_FIELD_BYTES: usize = 150;

/// Returns a copy of `value` with every oversized leaf replaced by
/// `"Too large to log: N bytes"`. Objects and arrays are recursed into, so
/// small sibling fields remain visible.
#[must_use]
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| (key.clone(), redact(item)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        leaf => {
            let size = leaf_size(leaf);
            if size > MAX_LOGGED_FIELD_BYTES {
                Value::String(format!("Too large to log: {size} bytes"))
            } else {
                leaf.clone()
            }
        }
    }
}

/// Redacts URL-encoded style pairs. Repeated keys are folded into an array
/// so the log shows every value.
#[must_use]
pub fn redact_pairs(pairs: &[(String, String)]) -> Value {
    let mut map = Map::new();
    for (key, raw) in pairs {
        let item = redact(&Value::String(raw.clone()));
        match map.get_mut(key) {
            Some(Value::Array(existing)) => existing.push(item),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, item]);
            }
            None => {
                map.insert(key.clone(), item);
            }
        }
    }
    Value::Object(map)
}

fn leaf_size(leaf: &Value) -> usize {
    match leaf {
        Value::String(text) => text.len(),
        other => other.to_string().len(),
    }
}
