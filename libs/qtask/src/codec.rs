//! Wire encoding and reply parsing for stream entries.
//!
//! Payloads are flattened into the field/value list an `XADD` expects;
//! replies from `XREADGROUP` and `XAUTOCLAIM` are parsed from raw
//! `redis::Value` trees. The high-level reply types in the driver put
//! fields into a `HashMap`, which destroys field order and hides
//! odd-length field lists, so the runtime keeps the flat list (still as
//! raw values) until the consumer pairs it up.

use redis::Value;
use serde_json::Value as Json;

/// Sentinel field written when an empty object is published, so the
/// entry still carries at least one field and stays addressable.
pub const PLACEHOLDER_FIELD: &str = "_placeholder";
/// Sentinel value paired with [`PLACEHOLDER_FIELD`].
pub const PLACEHOLDER_VALUE: &str = "empty_object";
/// Field name used when a payload cannot be flattened field-by-field.
pub const MESSAGE_FIELD: &str = "message";

/// A raw stream entry: server-assigned id plus the flat field list in
/// server order. The list length is even for well-formed entries.
#[derive(Debug, Clone)]
pub struct RawEntry {
    pub id: String,
    pub fields: Vec<Value>,
}

/// Flatten a JSON payload into the ordered field/value list to append.
///
/// - flat object of scalars → one field per key, insertion order kept
/// - empty object → the placeholder sentinel pair
/// - object with null or nested values → single `message` field with
///   the compact JSON rendering
/// - string → single `message` field with the raw string
/// - anything else → single `message` field with the compact JSON
pub fn encode_payload(payload: &Json) -> Vec<(String, String)> {
    match payload {
        Json::String(s) => vec![(MESSAGE_FIELD.to_string(), s.clone())],
        Json::Object(map) => {
            if map.is_empty() {
                return vec![(PLACEHOLDER_FIELD.to_string(), PLACEHOLDER_VALUE.to_string())];
            }
            let mut pairs = Vec::with_capacity(map.len());
            for (key, value) in map {
                match scalar_to_string(value) {
                    Some(text) => pairs.push((key.clone(), text)),
                    // Non-scalar or null value: the whole object goes
                    // through as JSON instead.
                    None => {
                        return vec![(MESSAGE_FIELD.to_string(), payload.to_string())];
                    }
                }
            }
            pairs
        }
        other => vec![(MESSAGE_FIELD.to_string(), other.to_string())],
    }
}

fn scalar_to_string(value: &Json) -> Option<String> {
    match value {
        Json::String(s) => Some(s.clone()),
        Json::Number(n) => Some(n.to_string()),
        Json::Bool(b) => Some(b.to_string()),
        Json::Null | Json::Array(_) | Json::Object(_) => None,
    }
}

/// Parse an `XREADGROUP` reply into raw entries.
///
/// Reply shape: `[[stream_name, [[id, [f, v, ...]], ...]], ...]`.
/// `Nil` means the block timeout elapsed with nothing new.
pub fn parse_read_reply(reply: &Value) -> Vec<RawEntry> {
    let mut entries = Vec::new();
    match reply {
        Value::Nil => {}
        Value::Array(streams) => {
            for stream in streams {
                if let Value::Array(parts) = stream {
                    if let Some(stream_entries) = parts.get(1) {
                        collect_entries(stream_entries, &mut entries);
                    }
                }
            }
        }
        // RESP3 answers with a map of stream name to entry list.
        Value::Map(pairs) => {
            for (_, stream_entries) in pairs {
                collect_entries(stream_entries, &mut entries);
            }
        }
        _ => {}
    }
    entries
}

/// Parse an `XAUTOCLAIM` reply into `(next_cursor, claimed_entries)`.
///
/// Reply shape: `[next_id, [[id, [f, v, ...]], ...]]` with a third
/// element (deleted ids) on newer servers, which is ignored here.
pub fn parse_autoclaim_reply(reply: &Value) -> (String, Vec<RawEntry>) {
    let mut entries = Vec::new();
    let mut next_id = "0-0".to_string();

    if let Value::Array(parts) = reply {
        if let Some(cursor) = parts.first().and_then(value_to_string) {
            next_id = cursor;
        }
        if let Some(claimed) = parts.get(1) {
            collect_entries(claimed, &mut entries);
        }
    }

    (next_id, entries)
}

fn collect_entries(value: &Value, out: &mut Vec<RawEntry>) {
    if let Value::Array(items) = value {
        for item in items {
            if let Some(entry) = parse_entry(item) {
                out.push(entry);
            }
        }
    }
}

/// Parse a single `[id, [field, value, ...]]` pair. Nil-padded entries
/// (JUSTID replies, trimmed entries) are skipped.
fn parse_entry(value: &Value) -> Option<RawEntry> {
    let parts = match value {
        Value::Array(parts) => parts,
        _ => return None,
    };
    let id = value_to_string(parts.first()?)?;
    let fields = match parts.get(1) {
        Some(Value::Array(items)) => items.clone(),
        Some(Value::Map(pairs)) => {
            let mut flat = Vec::with_capacity(pairs.len() * 2);
            for (field, val) in pairs {
                flat.push(field.clone());
                flat.push(val.clone());
            }
            flat
        }
        _ => Vec::new(),
    };
    Some(RawEntry { id, fields })
}

/// Textual form of a reply value, for ids and field contents.
pub fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).to_string()),
        Value::SimpleString(s) => Some(s.clone()),
        Value::Int(n) => Some(n.to_string()),
        Value::Double(d) => Some(d.to_string()),
        _ => None,
    }
}
