//! JSON projection of schema-less protobuf messages.
//!
//! Field `N` becomes key `fN`. Varints project to numbers; length-delimited
//! fields to nested objects when they parse as a non-empty message, otherwise
//! to a UTF-8 string or a `{base64, length}` stub; fixed-width fields to
//! `{bytesHex, length}`. Recursion stops at depth 4.

use crate::codec;
use crate::protowire::{parse_message_limited, WireValue};
use base64::Engine;
use serde_json::{json, Map, Value};

pub const MAX_PROJECTION_DEPTH: usize = 4;

#[derive(Debug, Clone, Copy)]
pub struct ProjectionLimits {
    pub max_fields: usize,
    pub max_bytes: usize,
}

impl Default for ProjectionLimits {
    fn default() -> Self {
        Self {
            max_fields: 512,
            max_bytes: 1 << 20,
        }
    }
}

/// Project a message into its `fN`-keyed JSON view. Returns `None` when the
/// buffer is oversize, malformed, or exceeds the field budget — callers then
/// treat the payload as opaque.
pub fn project_message(buf: &[u8], limits: &ProjectionLimits) -> Option<Value> {
    if buf.len() > limits.max_bytes {
        return None;
    }
    let mut field_budget = limits.max_fields;
    project_at_depth(buf, 0, &mut field_budget)
}

fn project_at_depth(buf: &[u8], depth: usize, field_budget: &mut usize) -> Option<Value> {
    let fields = parse_message_limited(buf, *field_budget)?;
    if fields.is_empty() {
        return None;
    }
    if fields.len() > *field_budget {
        return None;
    }
    *field_budget -= fields.len();

    let mut map = Map::new();
    for field in fields {
        let key = format!("f{}", field.number);
        let value = match field.value {
            WireValue::Varint(v) => json!(v),
            WireValue::LengthDelimited(bytes) => project_length_delimited(&bytes, depth, field_budget),
            WireValue::Fixed64(bytes) => json!({
                "bytesHex": hex::encode(bytes),
                "length": 8,
            }),
            WireValue::Fixed32(bytes) => json!({
                "bytesHex": hex::encode(bytes),
                "length": 4,
            }),
        };
        // Repeated fields collapse to the last occurrence.
        map.insert(key, value);
    }
    Some(Value::Object(map))
}

fn project_length_delimited(bytes: &[u8], depth: usize, field_budget: &mut usize) -> Value {
    if depth + 1 < MAX_PROJECTION_DEPTH && !bytes.is_empty() {
        if let Some(nested) = project_at_depth(bytes, depth + 1, field_budget) {
            return nested;
        }
    }
    if codec::printable_ratio(bytes) >= codec::PROJECTION_TEXT_RATIO {
        if let Ok(text) = std::str::from_utf8(bytes) {
            return Value::String(text.to_string());
        }
    }
    json!({
        "base64": base64::engine::general_purpose::STANDARD.encode(bytes),
        "length": bytes.len(),
    })
}
