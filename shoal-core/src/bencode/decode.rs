//! Bencode decoding with strict and sloppy modes

use serde::Deserialize;
use serde_bencode::value::Value as RawValue;

use super::{BencodeError, Value};

/// Decodes exactly one value; trailing bytes are an error.
///
/// # Errors
///
/// - `BencodeError::TrailingData` - If bytes remain after the value
/// - `BencodeError::Malformed` - If the input is not bencode
pub fn decode(input: &[u8]) -> Result<Value, BencodeError> {
    let (value, used) = decode_prefix(input)?;
    if used != input.len() {
        return Err(BencodeError::TrailingData {
            remaining: input.len() - used,
        });
    }
    Ok(value)
}

/// Decodes a leading value and ignores whatever follows it.
///
/// Tracker replies are frequently sloppy, so this is the only decoder
/// the tracker layer uses.
///
/// # Errors
///
/// - `BencodeError::Malformed` - If no well-formed value starts at offset zero
pub fn decode_sloppy(input: &[u8]) -> Result<Value, BencodeError> {
    decode_prefix(input).map(|(value, _)| value)
}

/// Decodes a value from the front of `input` and returns the number of
/// bytes it occupied.
///
/// # Errors
///
/// - `BencodeError::Malformed` - If no well-formed value starts at offset zero
pub fn decode_prefix(input: &[u8]) -> Result<(Value, usize), BencodeError> {
    let mut rest = input;
    let raw = {
        // The deserializer reads byte by byte and never past the value's
        // closing token, so `rest` is left at the first unread byte.
        let mut deserializer = serde_bencode::de::Deserializer::new(&mut rest);
        RawValue::deserialize(&mut deserializer).map_err(|e| BencodeError::Malformed {
            reason: e.to_string(),
        })?
    };
    Ok((Value::from(raw), input.len() - rest.len()))
}

impl From<RawValue> for Value {
    fn from(raw: RawValue) -> Self {
        match raw {
            RawValue::Int(number) => Value::Integer(number),
            RawValue::Bytes(bytes) => Value::Bytes(bytes),
            RawValue::List(items) => Value::List(items.into_iter().map(Value::from).collect()),
            RawValue::Dict(entries) => Value::Dict(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, Value::from(value)))
                    .collect(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_scalars() {
        assert_eq!(decode(b"i42e").unwrap(), Value::Integer(42));
        assert_eq!(decode(b"i-7e").unwrap(), Value::Integer(-7));
        assert_eq!(decode(b"i0e").unwrap(), Value::Integer(0));
        assert_eq!(decode(b"4:spam").unwrap(), Value::bytes(b"spam"));
        assert_eq!(decode(b"0:").unwrap(), Value::bytes(b""));
    }

    #[test]
    fn test_decode_nested() {
        assert!(matches!(
            decode(b"d4:listl3:onei2ee4:nameu:shoale"),
            Err(BencodeError::Malformed { .. })
        ));

        let value = decode(b"d4:listl3:onei2ee4:name5:shoale").unwrap();
        assert_eq!(
            value.get(b"list").and_then(Value::as_list).map(<[Value]>::len),
            Some(2)
        );
        assert_eq!(value.get(b"name").and_then(Value::as_str), Some("shoal"));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(decode(b""), Err(BencodeError::Malformed { .. })));
        assert!(matches!(decode(b"x"), Err(BencodeError::Malformed { .. })));
        assert!(matches!(decode(b"i1x2e"), Err(BencodeError::Malformed { .. })));
        assert!(matches!(decode(b"10:short"), Err(BencodeError::Malformed { .. })));
    }

    #[test]
    fn test_trailing_data_strict_vs_sloppy() {
        assert_eq!(
            decode(b"i1egarbage"),
            Err(BencodeError::TrailingData { remaining: 7 })
        );
        assert_eq!(decode_sloppy(b"i1egarbage").unwrap(), Value::Integer(1));
    }

    #[test]
    fn test_unsorted_keys_are_reordered() {
        let value = decode_sloppy(b"d1:bi1e1:ai2ee").unwrap();
        assert_eq!(value.get(b"a").and_then(Value::as_int), Some(2));
        assert_eq!(value.to_bytes(), b"d1:ai2e1:bi1ee");
    }

    #[test]
    fn test_decode_prefix_reports_consumed() {
        let (value, used) = decode_prefix(b"l1:ae<rest>").unwrap();
        assert_eq!(value, Value::List(vec![Value::bytes(b"a")]));
        assert_eq!(used, 5);

        let (value, used) = decode_prefix(b"d1:ai1eeXX").unwrap();
        assert_eq!(value.get(b"a").and_then(Value::as_int), Some(1));
        assert_eq!(used, 8);
    }

    #[test]
    fn test_truncated_containers() {
        assert!(matches!(decode(b"l1:a"), Err(BencodeError::Malformed { .. })));
        assert!(matches!(decode(b"d1:a"), Err(BencodeError::Malformed { .. })));
    }
}
