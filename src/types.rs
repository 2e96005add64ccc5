//! Value model stored by the engine.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{ArborError, Result};

/// On-disk value type tags. The tag is stored in the low nibble of a record
/// header byte and in every child entry, so the discriminants are part of the
/// file format.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ValueType {
    /// Key/value collection.
    Object = 1,
    /// Positional collection.
    Array = 2,
    /// IEEE-754 double.
    Number = 3,
    /// True/false.
    Boolean = 4,
    /// UTF-8 text.
    String = 5,
    /// 64-bit signed integer stored without float rounding.
    BigInt = 6,
    /// Instant with millisecond precision.
    DateTime = 7,
    /// Raw byte blob.
    Binary = 8,
    /// Reference to another path in the same database.
    Reference = 9,
}

impl ValueType {
    /// Decodes a type tag read from disk.
    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(Self::Object),
            2 => Ok(Self::Array),
            3 => Ok(Self::Number),
            4 => Ok(Self::Boolean),
            5 => Ok(Self::String),
            6 => Ok(Self::BigInt),
            7 => Ok(Self::DateTime),
            8 => Ok(Self::Binary),
            9 => Ok(Self::Reference),
            other => Err(ArborError::Corruption(format!(
                "unknown value type tag: 0x{other:02X}"
            ))),
        }
    }

    /// The on-disk tag for this type.
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Whether values of this type hold children rather than bytes.
    pub fn is_structured(self) -> bool {
        matches!(self, Self::Object | Self::Array)
    }
}

/// A reference to another node path, stored as its own value type so
/// consumers can distinguish it from a plain string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathReference {
    /// Target path of the reference.
    pub path: String,
}

impl PathReference {
    /// Creates a reference to `path`.
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

/// A JSON-like document value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Key/value collection.
    Object(BTreeMap<String, Value>),
    /// Positional collection.
    Array(Vec<Value>),
    /// IEEE-754 double.
    Number(f64),
    /// True/false.
    Boolean(bool),
    /// UTF-8 text.
    String(String),
    /// 64-bit integer kept exact.
    BigInt(i64),
    /// Instant, millisecond precision, stored as epoch milliseconds.
    DateTime(i64),
    /// Raw bytes.
    Binary(Vec<u8>),
    /// Reference to another path.
    Reference(PathReference),
}

impl Value {
    /// The storage type of this value.
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Object(_) => ValueType::Object,
            Value::Array(_) => ValueType::Array,
            Value::Number(_) => ValueType::Number,
            Value::Boolean(_) => ValueType::Boolean,
            Value::String(_) => ValueType::String,
            Value::BigInt(_) => ValueType::BigInt,
            Value::DateTime(_) => ValueType::DateTime,
            Value::Binary(_) => ValueType::Binary,
            Value::Reference(_) => ValueType::Reference,
        }
    }

    /// Builds a [`Value::DateTime`] from an [`OffsetDateTime`], truncating to
    /// millisecond precision.
    pub fn from_datetime(dt: OffsetDateTime) -> Self {
        Value::DateTime((dt.unix_timestamp_nanos() / 1_000_000) as i64)
    }

    /// Interprets a [`Value::DateTime`] as an [`OffsetDateTime`].
    pub fn as_datetime(&self) -> Option<OffsetDateTime> {
        match self {
            Value::DateTime(millis) => {
                OffsetDateTime::from_unix_timestamp_nanos(i128::from(*millis) * 1_000_000).ok()
            }
            _ => None,
        }
    }

    /// Shorthand for an empty object.
    pub fn empty_object() -> Self {
        Value::Object(BTreeMap::new())
    }

    /// True for empty objects and empty arrays.
    pub fn is_empty_collection(&self) -> bool {
        match self {
            Value::Object(map) => map.is_empty(),
            Value::Array(items) => items.is_empty(),
            _ => false,
        }
    }

    /// Child count for structured values, 0 otherwise.
    pub fn child_count(&self) -> usize {
        match self {
            Value::Object(map) => map.len(),
            Value::Array(items) => items.len(),
            _ => 0,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => write!(f, "{json}"),
            Err(_) => write!(f, "<unserializable value>"),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Object(BTreeMap::new()),
            serde_json::Value::Bool(v) => Value::Boolean(v),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(key, value)| (key, Value::from(value)))
                    .collect(),
            ),
        }
    }
}

/// Convenience constructors used heavily in tests and tools.
impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Number(f64::from(value))
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn type_tags_round_trip() {
        for tag in 1..=9u8 {
            let vt = ValueType::from_tag(tag).expect("valid tag");
            assert_eq!(vt.tag(), tag);
        }
        assert!(ValueType::from_tag(0).is_err());
        assert!(ValueType::from_tag(10).is_err());
    }

    #[test]
    fn datetime_conversion_is_millisecond_exact() {
        let dt = datetime!(2024-02-29 12:30:45.123 UTC);
        let value = Value::from_datetime(dt);
        assert_eq!(value.as_datetime().expect("datetime"), dt);
    }

    #[test]
    fn json_conversion() {
        let json: serde_json::Value =
            serde_json::from_str(r#"{"a":1,"b":"hello","c":{"d":[1,2,3]}}"#).expect("json");
        let value = Value::from(json);
        match &value {
            Value::Object(map) => {
                assert_eq!(map.get("a"), Some(&Value::Number(1.0)));
                assert_eq!(map.get("b"), Some(&Value::String("hello".into())));
            }
            other => panic!("expected object, got {other:?}"),
        }
    }
}
