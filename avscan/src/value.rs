//! Remote analysis object graph
//!
//! The analysis service hands back a loosely typed graph: service objects
//! (`type`, `id`, attributes), plain mappings, sequences, primitives, and
//! values the client carries without a structural model (timestamps, blobs).
//! [`RawValue`] is the closed set of shapes the rest of the crate accepts.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;

/// One node of a raw analysis result
#[derive(Debug, Clone)]
pub enum RawValue {
    /// Service-specific object exposing key/value pairs
    Object(ServiceObject),
    /// Plain mapping, in service order
    Mapping(Vec<(String, RawValue)>),
    /// Ordered sequence
    Sequence(Vec<RawValue>),
    String(String),
    Integer(i64),
    Unsigned(u64),
    Float(f64),
    Bool(bool),
    Null,
    /// Point in time decoded by the client (e.g. `date` attributes)
    Timestamp(DateTime<Utc>),
    /// Anything else; only its textual form survives normalization
    Opaque(Opaque),
}

/// Service-specific structured object (analysis, file, URL report, ...)
#[derive(Debug, Clone)]
pub struct ServiceObject {
    /// Object type as reported by the service (e.g. "analysis")
    pub object_type: String,
    /// Service identifier of the object
    pub id: String,
    /// Object attributes, in service order
    pub attributes: Vec<(String, RawValue)>,
    /// Request-specific attributes, omitted from output when empty
    pub context_attributes: Vec<(String, RawValue)>,
}

impl ServiceObject {
    pub fn new(object_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            object_type: object_type.into(),
            id: id.into(),
            attributes: Vec::new(),
            context_attributes: Vec::new(),
        }
    }

    /// Builder-style attribute append
    pub fn with_attribute(mut self, key: impl Into<String>, value: RawValue) -> Self {
        self.attributes.push((key.into(), value));
        self
    }

    /// Look up an attribute by name
    pub fn attribute(&self, key: &str) -> Option<&RawValue> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }
}

/// Value of a type the client does not model
///
/// Holds the type name for diagnostics and a displayable representation.
#[derive(Clone)]
pub struct Opaque {
    type_name: &'static str,
    repr: Arc<dyn fmt::Display + Send + Sync>,
}

impl Opaque {
    pub fn new(type_name: &'static str, value: impl fmt::Display + Send + Sync + 'static) -> Self {
        Self {
            type_name,
            repr: Arc::new(value),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl fmt::Display for Opaque {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.repr.fmt(f)
    }
}

impl fmt::Debug for Opaque {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Opaque<{}>({})", self.type_name, self.repr)
    }
}

impl From<serde_json::Value> for RawValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;

        match value {
            Value::Null => RawValue::Null,
            Value::Bool(b) => RawValue::Bool(b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    RawValue::Integer(i)
                } else if let Some(u) = n.as_u64() {
                    RawValue::Unsigned(u)
                } else {
                    RawValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => RawValue::String(s),
            Value::Array(items) => RawValue::Sequence(items.into_iter().map(RawValue::from).collect()),
            Value::Object(map) => {
                RawValue::Mapping(map.into_iter().map(|(k, v)| (k, RawValue::from(v))).collect())
            }
        }
    }
}

impl From<&str> for RawValue {
    fn from(value: &str) -> Self {
        RawValue::String(value.to_string())
    }
}

impl From<Option<&str>> for RawValue {
    fn from(value: Option<&str>) -> Self {
        value.map(RawValue::from).unwrap_or(RawValue::Null)
    }
}
