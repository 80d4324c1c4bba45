//! Attribute repair
//!
//! Some producers serialize a record twice, leaving `attributes` as a string that
//! holds a printed mapping (`"{'stats': {...}}"`) instead of a nested mapping.
//! [`repair_attributes`] restores the nested form through the restricted literal
//! parser before statistics or label bridging read the record.

use crate::error::RecordError;
use crate::literal::parse_literal;
use serde_json::{Map, Value};

/// Encoding state of a record's `attributes` field
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AttributesField<'a> {
    /// No `attributes` key
    Absent,
    /// Already a nested mapping
    Structured(&'a Map<String, Value>),
    /// Printed into a string; needs repair
    Encoded(&'a str),
    /// Any other JSON type
    Other(&'a Value),
}

/// Classify the `attributes` field of `record`
pub fn inspect(record: &Map<String, Value>) -> AttributesField<'_> {
    match record.get("attributes") {
        None => AttributesField::Absent,
        Some(Value::Object(map)) => AttributesField::Structured(map),
        Some(Value::String(text)) => AttributesField::Encoded(text),
        Some(other) => AttributesField::Other(other),
    }
}

/// Bring `record.attributes` into mapping form
///
/// Returns `Ok(true)` when the field was rewritten, `Ok(false)` when it was
/// already structured or absent. On error `record` is left untouched.
pub fn repair_attributes(record: &mut Map<String, Value>) -> Result<bool, RecordError> {
    let repaired = match inspect(record) {
        AttributesField::Absent | AttributesField::Structured(_) => return Ok(false),
        AttributesField::Encoded(text) => match parse_literal(text)? {
            Value::Object(map) => map,
            other => {
                return Err(RecordError::MalformedAttributes(format!(
                    "attributes string holds {} instead of a mapping",
                    json_type_name(&other)
                )))
            }
        },
        AttributesField::Other(value) => {
            return Err(RecordError::MalformedAttributes(format!(
                "attributes is {} instead of a mapping",
                json_type_name(value)
            )))
        }
    };

    tracing::debug!(keys = repaired.len(), "Repaired string-encoded attributes");
    record.insert("attributes".to_string(), Value::Object(repaired));
    Ok(true)
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a sequence",
        Value::Object(_) => "a mapping",
    }
}
