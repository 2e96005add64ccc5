//! Binary value codec: converts values to and from their tiny, inline and
//! external-record byte layouts.
//!
//! A child entry inside a structured node is `[key info][value info][payload]`
//! (array children omit the key info and are stored densely in index order).
//!
//! Value info is two bytes. The first byte packs the storage form in its top
//! two bits and the value type tag in its low nibble. The second byte holds
//! the tiny payload, the inline length minus one (6 bits), or zero for
//! record-addressed values, which are followed by a 6-byte record address.
//! All fixed-width numbers are big-endian.

use crate::error::{ArborError, Result};
use crate::path::validate_key;
use crate::storage::address::{RecordAddress, ADDRESS_LEN};
use crate::types::{PathReference, Value, ValueType};

/// Storage form of a child value.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ValueForm {
    /// Packed entirely into the value-info bytes.
    Tiny = 0,
    /// Bytes stored inline after the value info.
    Inline = 1,
    /// A 6-byte address of a dedicated node.
    Record = 2,
}

impl ValueForm {
    fn from_bits(bits: u8) -> Result<Self> {
        match bits {
            0 => Ok(Self::Tiny),
            1 => Ok(Self::Inline),
            2 => Ok(Self::Record),
            other => Err(ArborError::Corruption(format!(
                "unknown value form: {other}"
            ))),
        }
    }
}

/// Key part of a child entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKey {
    /// Key bytes stored inline.
    Inline(String),
    /// 15-bit index into the key index table.
    Interned(u16),
}

/// Value part of a child entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryValue {
    /// Value packed into the info bytes.
    Tiny {
        /// Value type.
        value_type: ValueType,
        /// Packed bits (boolean, small integer, or zero for empties).
        bits: u8,
    },
    /// Value bytes stored inline.
    Inline {
        /// Value type.
        value_type: ValueType,
        /// Serialized bytes, 1..=64 of them.
        bytes: Vec<u8>,
    },
    /// Value stored as a dedicated node.
    Record {
        /// Value type.
        value_type: ValueType,
        /// Address of the node.
        address: RecordAddress,
    },
}

impl EntryValue {
    /// The value type of this entry.
    pub fn value_type(&self) -> ValueType {
        match self {
            EntryValue::Tiny { value_type, .. }
            | EntryValue::Inline { value_type, .. }
            | EntryValue::Record { value_type, .. } => *value_type,
        }
    }

    /// Encoded byte length of the value part.
    pub fn encoded_len(&self) -> usize {
        2 + match self {
            EntryValue::Tiny { .. } => 0,
            EntryValue::Inline { bytes, .. } => bytes.len(),
            EntryValue::Record { .. } => ADDRESS_LEN,
        }
    }
}

/// Outcome of serializing a value for storage inside its parent.
#[derive(Debug, Clone, PartialEq)]
pub enum SerializedValue {
    /// Fits in the value-info bytes.
    Tiny {
        /// Value type.
        value_type: ValueType,
        /// Packed bits.
        bits: u8,
    },
    /// Fits inline.
    Inline {
        /// Value type.
        value_type: ValueType,
        /// Serialized bytes.
        bytes: Vec<u8>,
    },
    /// Needs a dedicated node; the writer allocates one and stores its
    /// address.
    NeedsNode {
        /// Value type.
        value_type: ValueType,
    },
}

/// Serializes `value` for storage inside its parent, choosing tiny, inline
/// or external-record form against the `max_inline` threshold.
pub fn serialize_child_value(value: &Value, max_inline: usize) -> Result<SerializedValue> {
    let value_type = value.value_type();
    match value {
        Value::Boolean(v) => Ok(SerializedValue::Tiny {
            value_type,
            bits: u8::from(*v),
        }),
        Value::Number(n) => {
            if let Some(bits) = tiny_number_bits(*n) {
                return Ok(SerializedValue::Tiny { value_type, bits });
            }
            inline_or_node(value_type, n.to_be_bytes().to_vec(), max_inline)
        }
        Value::BigInt(n) => {
            if (0..=15).contains(n) {
                return Ok(SerializedValue::Tiny {
                    value_type,
                    bits: *n as u8,
                });
            }
            inline_or_node(value_type, n.to_be_bytes().to_vec(), max_inline)
        }
        Value::DateTime(millis) => {
            inline_or_node(value_type, millis.to_be_bytes().to_vec(), max_inline)
        }
        Value::String(s) => {
            if s.is_empty() {
                return Ok(SerializedValue::Tiny {
                    value_type,
                    bits: 0,
                });
            }
            inline_or_node(value_type, s.as_bytes().to_vec(), max_inline)
        }
        Value::Reference(reference) => {
            if reference.path.is_empty() {
                return Ok(SerializedValue::Tiny {
                    value_type,
                    bits: 0,
                });
            }
            inline_or_node(value_type, reference.path.as_bytes().to_vec(), max_inline)
        }
        Value::Binary(bytes) => {
            if bytes.is_empty() {
                return Ok(SerializedValue::Tiny {
                    value_type,
                    bits: 0,
                });
            }
            inline_or_node(value_type, bytes.clone(), max_inline)
        }
        Value::Object(_) | Value::Array(_) => {
            if value.is_empty_collection() {
                Ok(SerializedValue::Tiny {
                    value_type,
                    bits: 0,
                })
            } else {
                Ok(SerializedValue::NeedsNode { value_type })
            }
        }
    }
}

fn inline_or_node(
    value_type: ValueType,
    bytes: Vec<u8>,
    max_inline: usize,
) -> Result<SerializedValue> {
    if bytes.len() <= max_inline && bytes.len() <= 64 {
        Ok(SerializedValue::Inline { value_type, bytes })
    } else {
        Ok(SerializedValue::NeedsNode { value_type })
    }
}

/// Bits for the tiny number form, when `n` is exactly an integer 0..=15.
fn tiny_number_bits(n: f64) -> Option<u8> {
    if !(0.0..=15.0).contains(&n) {
        return None;
    }
    let candidate = n as u8;
    if (f64::from(candidate)).to_bits() == n.to_bits() {
        Some(candidate)
    } else {
        None
    }
}

/// Reconstructs a value from its tiny bits.
pub fn tiny_value(value_type: ValueType, bits: u8) -> Result<Value> {
    match value_type {
        ValueType::Boolean => match bits {
            0 => Ok(Value::Boolean(false)),
            1 => Ok(Value::Boolean(true)),
            other => Err(ArborError::Corruption(format!(
                "invalid boolean bits: {other}"
            ))),
        },
        ValueType::Number => {
            if bits > 15 {
                return Err(ArborError::Corruption(format!(
                    "tiny number out of range: {bits}"
                )));
            }
            Ok(Value::Number(f64::from(bits)))
        }
        ValueType::BigInt => {
            if bits > 15 {
                return Err(ArborError::Corruption(format!(
                    "tiny bigint out of range: {bits}"
                )));
            }
            Ok(Value::BigInt(i64::from(bits)))
        }
        ValueType::String => Ok(Value::String(String::new())),
        ValueType::Reference => Ok(Value::Reference(PathReference::new(""))),
        ValueType::Binary => Ok(Value::Binary(Vec::new())),
        ValueType::Object => Ok(Value::empty_object()),
        ValueType::Array => Ok(Value::Array(Vec::new())),
        ValueType::DateTime => Err(ArborError::Corruption(
            "datetime has no tiny form".into(),
        )),
    }
}

/// Reconstructs a value from inline bytes. Also used for the payload of
/// dedicated nodes holding non-structured values.
pub fn deserialize_payload(value_type: ValueType, bytes: &[u8]) -> Result<Value> {
    match value_type {
        ValueType::Number => Ok(Value::Number(f64::from_be_bytes(fixed8(bytes)?))),
        ValueType::BigInt => Ok(Value::BigInt(i64::from_be_bytes(fixed8(bytes)?))),
        ValueType::DateTime => Ok(Value::DateTime(i64::from_be_bytes(fixed8(bytes)?))),
        ValueType::String => Ok(Value::String(utf8(bytes)?)),
        ValueType::Reference => Ok(Value::Reference(PathReference::new(utf8(bytes)?))),
        ValueType::Binary => Ok(Value::Binary(bytes.to_vec())),
        ValueType::Boolean => Err(ArborError::Corruption(
            "boolean values are always tiny".into(),
        )),
        ValueType::Object | ValueType::Array => Err(ArborError::Corruption(
            "structured values have no byte payload".into(),
        )),
    }
}

/// Serializes the payload of a dedicated node for a non-structured value.
pub fn record_payload(value: &Value) -> Result<Vec<u8>> {
    match value {
        Value::Number(n) => Ok(n.to_be_bytes().to_vec()),
        Value::BigInt(n) => Ok(n.to_be_bytes().to_vec()),
        Value::DateTime(millis) => Ok(millis.to_be_bytes().to_vec()),
        Value::String(s) => Ok(s.as_bytes().to_vec()),
        Value::Reference(reference) => Ok(reference.path.as_bytes().to_vec()),
        Value::Binary(bytes) => Ok(bytes.clone()),
        Value::Boolean(_) | Value::Object(_) | Value::Array(_) => Err(ArborError::Internal(
            format!("{:?} cannot be stored as a byte payload", value.value_type()),
        )),
    }
}

fn fixed8(bytes: &[u8]) -> Result<[u8; 8]> {
    bytes
        .try_into()
        .map_err(|_| ArborError::Corruption("fixed-width value has wrong length".into()))
}

fn utf8(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| ArborError::Corruption("string payload is not valid UTF-8".into()))
}

/// Encodes the key part of a child entry into `buf`.
pub fn encode_entry_key(buf: &mut Vec<u8>, key: &EntryKey) -> Result<()> {
    match key {
        EntryKey::Interned(index) => {
            if *index > 0x7FFF {
                return Err(ArborError::AllocationLimit(format!(
                    "key index {index} exceeds 15 bits"
                )));
            }
            buf.extend_from_slice(&(0x8000u16 | index).to_be_bytes());
        }
        EntryKey::Inline(name) => {
            validate_key(name)?;
            buf.push((name.len() - 1) as u8);
            buf.extend_from_slice(name.as_bytes());
        }
    }
    Ok(())
}

/// Encodes the value part of a child entry into `buf`.
pub fn encode_entry_value(buf: &mut Vec<u8>, value: &EntryValue) -> Result<()> {
    let (form, value_type) = match value {
        EntryValue::Tiny { value_type, .. } => (ValueForm::Tiny, *value_type),
        EntryValue::Inline { value_type, .. } => (ValueForm::Inline, *value_type),
        EntryValue::Record { value_type, .. } => (ValueForm::Record, *value_type),
    };
    buf.push((form as u8) << 6 | value_type.tag());
    match value {
        EntryValue::Tiny { bits, .. } => buf.push(*bits),
        EntryValue::Inline { bytes, .. } => {
            if bytes.is_empty() || bytes.len() > 64 {
                return Err(ArborError::Internal(format!(
                    "inline payload of {} bytes is out of range",
                    bytes.len()
                )));
            }
            buf.push((bytes.len() - 1) as u8);
            buf.extend_from_slice(bytes);
        }
        EntryValue::Record { address, .. } => {
            buf.push(0);
            buf.extend_from_slice(&address.to_bytes());
        }
    }
    Ok(())
}

/// Incremental decode result: `None` means the caller must supply more bytes
/// (the entry continues in the next chunk).
pub type Decoded<T> = Option<(T, usize)>;

/// Decodes the key part of a child entry starting at `bytes[0]`.
pub fn decode_entry_key(bytes: &[u8]) -> Result<Decoded<EntryKey>> {
    let Some(&first) = bytes.first() else {
        return Ok(None);
    };
    if first & 0x80 != 0 {
        if bytes.len() < 2 {
            return Ok(None);
        }
        let index = u16::from_be_bytes([first & 0x7F, bytes[1]]);
        return Ok(Some((EntryKey::Interned(index), 2)));
    }
    let len = usize::from(first) + 1;
    if bytes.len() < 1 + len {
        return Ok(None);
    }
    let name = std::str::from_utf8(&bytes[1..1 + len])
        .map_err(|_| ArborError::Corruption("key bytes are not valid UTF-8".into()))?;
    Ok(Some((EntryKey::Inline(name.to_string()), 1 + len)))
}

/// Decodes the value part of a child entry starting at `bytes[0]`.
pub fn decode_entry_value(bytes: &[u8]) -> Result<Decoded<EntryValue>> {
    if bytes.len() < 2 {
        return Ok(None);
    }
    let form = ValueForm::from_bits(bytes[0] >> 6)?;
    let value_type = ValueType::from_tag(bytes[0] & 0x0F)?;
    match form {
        ValueForm::Tiny => Ok(Some((
            EntryValue::Tiny {
                value_type,
                bits: bytes[1],
            },
            2,
        ))),
        ValueForm::Inline => {
            let len = usize::from(bytes[1] & 0x3F) + 1;
            if bytes.len() < 2 + len {
                return Ok(None);
            }
            Ok(Some((
                EntryValue::Inline {
                    value_type,
                    bytes: bytes[2..2 + len].to_vec(),
                },
                2 + len,
            )))
        }
        ValueForm::Record => {
            if bytes.len() < 2 + ADDRESS_LEN {
                return Ok(None);
            }
            let address = RecordAddress::from_bytes(&bytes[2..2 + ADDRESS_LEN])?;
            Ok(Some((
                EntryValue::Record {
                    value_type,
                    address,
                },
                2 + ADDRESS_LEN,
            )))
        }
    }
}

/// Byte form of a child key inside the B+Tree key index: object keys are
/// their UTF-8 bytes, array indices 4-byte big-endian so byte order matches
/// numeric order.
pub fn tree_key_bytes(key: &crate::path::PathKey) -> Vec<u8> {
    match key {
        crate::path::PathKey::Name(name) => name.as_bytes().to_vec(),
        crate::path::PathKey::Index(index) => (*index as u32).to_be_bytes().to_vec(),
    }
}

/// Inverse of [`tree_key_bytes`], driven by the node's collection type.
pub fn path_key_from_tree_bytes(
    collection: ValueType,
    bytes: &[u8],
) -> Result<crate::path::PathKey> {
    match collection {
        ValueType::Array => {
            let raw: [u8; 4] = bytes.try_into().map_err(|_| {
                ArborError::Corruption("array index key has wrong length".into())
            })?;
            Ok(crate::path::PathKey::Index(u32::from_be_bytes(raw) as usize))
        }
        ValueType::Object => {
            let name = std::str::from_utf8(bytes)
                .map_err(|_| ArborError::Corruption("tree key is not valid UTF-8".into()))?;
            Ok(crate::path::PathKey::Name(name.to_string()))
        }
        other => Err(ArborError::Internal(format!(
            "{other:?} nodes have no key index"
        ))),
    }
}

/// Resolves a decoded entry value into a materialized [`Value`], when it can
/// be resolved without reading another node.
pub fn resolve_entry_value(value: &EntryValue) -> Result<Option<Value>> {
    match value {
        EntryValue::Tiny { value_type, bits } => Ok(Some(tiny_value(*value_type, *bits)?)),
        EntryValue::Inline { value_type, bytes } => {
            Ok(Some(deserialize_payload(*value_type, bytes)?))
        }
        EntryValue::Record { .. } => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn round_trip_entry(value: &Value, max_inline: usize) -> Value {
        let serialized = serialize_child_value(value, max_inline).expect("serialize");
        let entry = match serialized {
            SerializedValue::Tiny { value_type, bits } => EntryValue::Tiny { value_type, bits },
            SerializedValue::Inline { value_type, bytes } => {
                EntryValue::Inline { value_type, bytes }
            }
            SerializedValue::NeedsNode { .. } => panic!("value unexpectedly needs a node"),
        };
        let mut buf = Vec::new();
        encode_entry_value(&mut buf, &entry).expect("encode");
        let (decoded, consumed) = decode_entry_value(&buf).expect("decode").expect("complete");
        assert_eq!(consumed, buf.len());
        resolve_entry_value(&decoded)
            .expect("resolve")
            .expect("resolvable")
    }

    #[test]
    fn tiny_forms_round_trip() {
        for value in [
            Value::Boolean(true),
            Value::Boolean(false),
            Value::Number(0.0),
            Value::Number(15.0),
            Value::BigInt(7),
            Value::String(String::new()),
            Value::Binary(Vec::new()),
            Value::empty_object(),
            Value::Array(Vec::new()),
        ] {
            assert_eq!(round_trip_entry(&value, 50), value);
        }
    }

    #[test]
    fn inline_forms_round_trip() {
        for value in [
            Value::Number(3.25),
            Value::Number(-0.0),
            Value::Number(16.0),
            Value::BigInt(-42),
            Value::BigInt(i64::MAX),
            Value::DateTime(1_706_000_000_000),
            Value::String("hello".into()),
            Value::Reference(PathReference::new("users/1")),
            Value::Binary(vec![0, 1, 2, 3]),
            Value::String("x".repeat(50)),
        ] {
            assert_eq!(round_trip_entry(&value, 50), value);
        }
    }

    #[test]
    fn negative_zero_is_not_tiny() {
        assert!(matches!(
            serialize_child_value(&Value::Number(-0.0), 50).expect("serialize"),
            SerializedValue::Inline { .. }
        ));
        assert_eq!(
            round_trip_entry(&Value::Number(-0.0), 50).to_string(),
            Value::Number(-0.0).to_string()
        );
    }

    #[test]
    fn oversized_values_need_nodes() {
        let value = Value::String("x".repeat(51));
        assert!(matches!(
            serialize_child_value(&value, 50).expect("serialize"),
            SerializedValue::NeedsNode {
                value_type: ValueType::String
            }
        ));
        let value = Value::Object([("a".to_string(), Value::Number(1.0))].into());
        assert!(matches!(
            serialize_child_value(&value, 50).expect("serialize"),
            SerializedValue::NeedsNode {
                value_type: ValueType::Object
            }
        ));
    }

    #[test]
    fn record_payload_round_trip_at_threshold_boundaries() {
        for len in [49usize, 50, 51, 64, 65, 1000] {
            let value = Value::String("y".repeat(len));
            let payload = record_payload(&value).expect("payload");
            assert_eq!(
                deserialize_payload(ValueType::String, &payload).expect("deserialize"),
                value
            );
        }
    }

    #[test]
    fn keys_round_trip() {
        let mut buf = Vec::new();
        encode_entry_key(&mut buf, &EntryKey::Inline("title".into())).expect("encode");
        encode_entry_key(&mut buf, &EntryKey::Interned(0x1234)).expect("encode");
        let (key, consumed) = decode_entry_key(&buf).expect("decode").expect("complete");
        assert_eq!(key, EntryKey::Inline("title".into()));
        let (key, rest) = decode_entry_key(&buf[consumed..])
            .expect("decode")
            .expect("complete");
        assert_eq!(key, EntryKey::Interned(0x1234));
        assert_eq!(consumed + rest, buf.len());
    }

    #[test]
    fn partial_buffers_signal_need_more() {
        let mut buf = Vec::new();
        encode_entry_value(
            &mut buf,
            &EntryValue::Inline {
                value_type: ValueType::String,
                bytes: b"hello world".to_vec(),
            },
        )
        .expect("encode");
        for cut in 0..buf.len() {
            assert!(
                decode_entry_value(&buf[..cut]).expect("decode").is_none(),
                "truncated at {cut} should need more bytes"
            );
        }
        assert!(decode_entry_value(&buf).expect("decode").is_some());
    }

    #[test]
    fn record_entries_carry_addresses() {
        let mut buf = Vec::new();
        encode_entry_value(
            &mut buf,
            &EntryValue::Record {
                value_type: ValueType::Object,
                address: RecordAddress::new(3, 9),
            },
        )
        .expect("encode");
        let (decoded, _) = decode_entry_value(&buf).expect("decode").expect("complete");
        assert_eq!(
            decoded,
            EntryValue::Record {
                value_type: ValueType::Object,
                address: RecordAddress::new(3, 9),
            }
        );
    }

    proptest! {
        #[test]
        fn number_round_trip(n in proptest::num::f64::NORMAL | proptest::num::f64::ZERO | proptest::num::f64::SUBNORMAL) {
            let value = Value::Number(n);
            prop_assert_eq!(round_trip_entry(&value, 50), value);
        }

        #[test]
        fn string_round_trip(s in "[ -~]{0,40}") {
            let value = Value::String(s);
            prop_assert_eq!(round_trip_entry(&value, 64), value);
        }
    }
}
