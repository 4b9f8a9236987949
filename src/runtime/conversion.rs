//! Conversion helpers between [`Value`] and `serde_json` values.
//!
//! Used by JSON-style foreign function handlers. Both directions enforce the
//! depth and size limits in [`crate::runtime::value`].

use crate::runtime::value::{LimitTracker, Value, MAX_VALUE_BYTES, MAX_VALUE_DEPTH};
use indexmap::IndexMap;

/// Convert a JSON value into a [`Value`].
pub(crate) fn json_to_value(json: &serde_json::Value) -> Result<Value, String> {
    let mut tracker = LimitTracker::new(MAX_VALUE_DEPTH, MAX_VALUE_BYTES);
    json_to_value_internal(json, &mut tracker)
}

fn json_to_value_internal(
    json: &serde_json::Value,
    tracker: &mut LimitTracker,
) -> Result<Value, String> {
    tracker.enter()?;

    let result = match json {
        serde_json::Value::Null => {
            tracker.add_bytes(4)?;
            Value::Null
        }
        serde_json::Value::Bool(b) => {
            tracker.add_bytes(1)?;
            Value::Bool(*b)
        }
        serde_json::Value::Number(n) => {
            tracker.add_bytes(8)?;
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else if let Some(f) = n.as_f64() {
                Value::Float(f)
            } else {
                return Err(format!("Unrepresentable number: {}", n));
            }
        }
        serde_json::Value::String(s) => {
            tracker.add_bytes(s.len() + 16)?;
            Value::String(s.clone())
        }
        serde_json::Value::Array(items) => {
            tracker.add_bytes(16 + items.len() * std::mem::size_of::<usize>())?;
            let mut converted = Vec::with_capacity(items.len());
            for item in items {
                converted.push(json_to_value_internal(item, tracker)?);
            }
            Value::Array(converted)
        }
        serde_json::Value::Object(map) => {
            tracker.add_bytes(24)?;
            let mut converted = IndexMap::with_capacity(map.len());
            for (key, item) in map {
                tracker.add_bytes(key.len() + 8)?;
                converted.insert(key.clone(), json_to_value_internal(item, tracker)?);
            }
            Value::Object(converted)
        }
    };

    tracker.exit();
    Ok(result)
}

/// Convert a [`Value`] into JSON.
///
/// Foreign handles and non-finite floats have no JSON form and are rejected.
pub(crate) fn value_to_json(value: &Value) -> Result<serde_json::Value, String> {
    let mut tracker = LimitTracker::new(MAX_VALUE_DEPTH, MAX_VALUE_BYTES);
    value_to_json_internal(value, &mut tracker)
}

fn value_to_json_internal(
    value: &Value,
    tracker: &mut LimitTracker,
) -> Result<serde_json::Value, String> {
    tracker.enter()?;

    let result = match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::from(*i),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .ok_or_else(|| format!("Cannot convert non-finite float {} to JSON", f))?,
        Value::String(s) => {
            tracker.add_bytes(s.len())?;
            serde_json::Value::String(s.clone())
        }
        Value::Array(items) => {
            let mut converted = Vec::with_capacity(items.len());
            for item in items {
                converted.push(value_to_json_internal(item, tracker)?);
            }
            serde_json::Value::Array(converted)
        }
        Value::Object(map) => {
            let mut converted = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                tracker.add_bytes(key.len())?;
                converted.insert(key.clone(), value_to_json_internal(item, tracker)?);
            }
            serde_json::Value::Object(converted)
        }
        Value::Foreign(handle) => {
            return Err(format!(
                "Cannot convert foreign action (handle: {}) to JSON",
                handle
            ))
        }
    };

    tracker.exit();
    Ok(result)
}
