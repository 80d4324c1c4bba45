//! Result normalization
//!
//! Reduces a [`RawValue`] graph to plain structured data (mappings, sequences,
//! strings, numbers, booleans, null). Normalization is total: every variant has
//! a conversion rule, and values without a structural model fall back to their
//! textual form instead of failing the task.

use crate::value::{RawValue, ServiceObject};
use serde_json::{Map, Number, Value};

/// Structured, serializable form of an analysis result
pub type NormalizedRecord = Value;

/// `strftime` pattern for timestamps that reach the textual fallback
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Normalize an analysis result graph into structured data
pub fn normalize(value: &RawValue) -> Value {
    match value {
        RawValue::Object(object) => normalize_object(object),
        RawValue::Mapping(entries) => Value::Object(normalize_entries(entries)),
        RawValue::Sequence(items) => Value::Array(items.iter().map(normalize).collect()),
        RawValue::String(s) => Value::String(s.clone()),
        RawValue::Integer(i) => Value::Number((*i).into()),
        RawValue::Unsigned(u) => Value::Number((*u).into()),
        // NaN and infinities have no JSON number form
        RawValue::Float(f) => Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(f.to_string())),
        RawValue::Bool(b) => Value::Bool(*b),
        RawValue::Null => Value::Null,
        RawValue::Timestamp(ts) => Value::String(ts.format(TIMESTAMP_FORMAT).to_string()),
        RawValue::Opaque(opaque) => {
            tracing::trace!(type_name = opaque.type_name(), "Normalizing opaque value as text");
            Value::String(opaque.to_string())
        }
    }
}

fn normalize_object(object: &ServiceObject) -> Value {
    let mut map = Map::new();
    map.insert("type".to_string(), Value::String(object.object_type.clone()));
    map.insert("id".to_string(), Value::String(object.id.clone()));
    map.insert(
        "attributes".to_string(),
        Value::Object(normalize_entries(&object.attributes)),
    );
    if !object.context_attributes.is_empty() {
        map.insert(
            "context_attributes".to_string(),
            Value::Object(normalize_entries(&object.context_attributes)),
        );
    }
    Value::Object(map)
}

fn normalize_entries(entries: &[(String, RawValue)]) -> Map<String, Value> {
    entries
        .iter()
        .map(|(key, value)| (key.clone(), normalize(value)))
        .collect()
}
