//! Self-describing binary container encoding
//!
//! Message bodies travel as a tree of primitive containers: unsigned and
//! signed integers, byte strings, text strings, lists, and maps with unique
//! keys. Every element is a single tag byte followed by a fixed-width value
//! or a length-prefixed body. Maps preserve insertion order on encode and
//! are looked up by key on decode, so key order never carries meaning.

use crate::error::{Error, Result};

const TAG_UINT: u8 = 0x01;
const TAG_INT: u8 = 0x02;
const TAG_BYTES: u8 = 0x03;
const TAG_TEXT: u8 = 0x04;
const TAG_LIST: u8 = 0x05;
const TAG_MAP: u8 = 0x06;

/// Upper bound on any declared length or element count.
const MAX_LENGTH: u64 = 1 << 20;

/// A node in the container tree.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    UInt(u64),
    Int(i64),
    Bytes(Vec<u8>),
    Text(String),
    List(Vec<Value>),
    /// Insertion-ordered pairs; keys are unique.
    Map(Vec<(Value, Value)>),
}

impl Value {
    pub fn text(text: impl Into<String>) -> Value {
        Value::Text(text.into())
    }

    pub fn bytes(bytes: impl Into<Vec<u8>>) -> Value {
        Value::Bytes(bytes.into())
    }

    /// Build a map with text keys, preserving the given order.
    pub fn map(entries: Vec<(&str, Value)>) -> Value {
        Value::Map(
            entries
                .into_iter()
                .map(|(key, value)| (Value::text(key), value))
                .collect(),
        )
    }

    /// Look up a text key in a map; None for missing keys or non-maps.
    pub fn get(&self, key: &str) -> Option<&Value> {
        let Value::Map(entries) = self else {
            return None;
        };
        entries.iter().find_map(|(k, v)| match k {
            Value::Text(text) if text == key => Some(v),
            _ => None,
        })
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }
}

/// Encode a container tree into bytes.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::UInt(value) => {
            out.push(TAG_UINT);
            out.extend_from_slice(&value.to_be_bytes());
        }
        Value::Int(value) => {
            out.push(TAG_INT);
            out.extend_from_slice(&value.to_be_bytes());
        }
        Value::Bytes(bytes) => {
            out.push(TAG_BYTES);
            out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
            out.extend_from_slice(bytes);
        }
        Value::Text(text) => {
            out.push(TAG_TEXT);
            out.extend_from_slice(&(text.len() as u32).to_be_bytes());
            out.extend_from_slice(text.as_bytes());
        }
        Value::List(items) => {
            out.push(TAG_LIST);
            out.extend_from_slice(&(items.len() as u32).to_be_bytes());
            for item in items {
                encode_into(item, out);
            }
        }
        Value::Map(entries) => {
            out.push(TAG_MAP);
            out.extend_from_slice(&(entries.len() as u32).to_be_bytes());
            for (key, value) in entries {
                encode_into(key, out);
                encode_into(value, out);
            }
        }
    }
}

/// Decode a container tree, requiring the input to be fully consumed.
pub fn decode(data: &[u8]) -> Result<Value> {
    let (value, offset) = decode_value(data, 0)?;
    if offset != data.len() {
        return Err(Error::Truncated(offset));
    }
    Ok(value)
}

fn decode_value(data: &[u8], offset: usize) -> Result<(Value, usize)> {
    let tag = *data.get(offset).ok_or(Error::Truncated(offset))?;
    let offset = offset + 1;
    match tag {
        TAG_UINT => {
            let (raw, offset) = take_fixed::<8>(data, offset)?;
            Ok((Value::UInt(u64::from_be_bytes(raw)), offset))
        }
        TAG_INT => {
            let (raw, offset) = take_fixed::<8>(data, offset)?;
            Ok((Value::Int(i64::from_be_bytes(raw)), offset))
        }
        TAG_BYTES => {
            let (length, offset) = take_length(data, offset)?;
            let end = offset + length;
            if end > data.len() {
                return Err(Error::Truncated(offset));
            }
            Ok((Value::Bytes(data[offset..end].to_vec()), end))
        }
        TAG_TEXT => {
            let (length, offset) = take_length(data, offset)?;
            let end = offset + length;
            if end > data.len() {
                return Err(Error::Truncated(offset));
            }
            let text =
                std::str::from_utf8(&data[offset..end]).map_err(|_| Error::InvalidText)?;
            Ok((Value::Text(text.to_owned()), end))
        }
        TAG_LIST => {
            let (count, mut offset) = take_length(data, offset)?;
            let mut items = Vec::with_capacity(count.min(64));
            for _ in 0..count {
                let (item, next) = decode_value(data, offset)?;
                items.push(item);
                offset = next;
            }
            Ok((Value::List(items), offset))
        }
        TAG_MAP => {
            let (count, mut offset) = take_length(data, offset)?;
            let mut entries: Vec<(Value, Value)> = Vec::with_capacity(count.min(64));
            for _ in 0..count {
                let (key, next) = decode_value(data, offset)?;
                let (value, next) = decode_value(data, next)?;
                if entries.iter().any(|(existing, _)| *existing == key) {
                    return Err(Error::DuplicateKey);
                }
                entries.push((key, value));
                offset = next;
            }
            Ok((Value::Map(entries), offset))
        }
        tag => Err(Error::UnknownTag(tag, offset - 1)),
    }
}

fn take_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<([u8; N], usize)> {
    let end = offset + N;
    if end > data.len() {
        return Err(Error::Truncated(offset));
    }
    let mut raw = [0u8; N];
    raw.copy_from_slice(&data[offset..end]);
    Ok((raw, end))
}

fn take_length(data: &[u8], offset: usize) -> Result<(usize, usize)> {
    let (raw, offset) = take_fixed::<4>(data, offset)?;
    let length = u32::from_be_bytes(raw) as u64;
    if length > MAX_LENGTH {
        return Err(Error::OversizeLength(length));
    }
    Ok((length as usize, offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_scalars() {
        for value in [
            Value::UInt(0),
            Value::UInt(u64::MAX),
            Value::Int(-42),
            Value::bytes(vec![0u8, 255, 7]),
            Value::text("héllo"),
        ] {
            assert_eq!(decode(&encode(&value)).unwrap(), value);
        }
    }

    #[test]
    fn test_round_trip_nested() {
        let value = Value::map(vec![
            ("signed_by", Value::bytes(vec![1; 32])),
            (
                "distribution",
                Value::map(vec![
                    ("global_time", Value::UInt(42)),
                    ("sequence_number", Value::UInt(1)),
                ]),
            ),
            (
                "payload",
                Value::List(vec![Value::UInt(1), Value::text("a")]),
            ),
        ]);
        assert_eq!(decode(&encode(&value)).unwrap(), value);
    }

    #[test]
    fn test_map_lookup_ignores_order() {
        let value = Value::map(vec![
            ("b", Value::UInt(2)),
            ("a", Value::UInt(1)),
        ]);
        assert_eq!(value.get("a").and_then(Value::as_u64), Some(1));
        assert_eq!(value.get("b").and_then(Value::as_u64), Some(2));
        assert_eq!(value.get("c"), None);
    }

    #[test]
    fn test_truncated_input() {
        let mut data = encode(&Value::bytes(vec![9; 16]));
        data.truncate(data.len() - 1);
        assert!(matches!(decode(&data), Err(Error::Truncated(_))));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut data = encode(&Value::UInt(1));
        data.push(0);
        assert!(matches!(decode(&data), Err(Error::Truncated(_))));
    }

    #[test]
    fn test_unknown_tag() {
        assert!(matches!(decode(&[0x7f]), Err(Error::UnknownTag(0x7f, 0))));
    }

    #[test]
    fn test_duplicate_map_key() {
        let dup = Value::Map(vec![
            (Value::text("k"), Value::UInt(1)),
            (Value::text("k"), Value::UInt(2)),
        ]);
        assert_eq!(decode(&encode(&dup)), Err(Error::DuplicateKey));
    }

    #[test]
    fn test_oversize_length() {
        let mut data = vec![TAG_BYTES];
        data.extend_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(decode(&data), Err(Error::OversizeLength(_))));
    }
}
