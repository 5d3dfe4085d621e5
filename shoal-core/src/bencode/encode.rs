//! Canonical bencode encoding

use super::Value;

/// Encodes `value` canonically: sorted dictionary keys, no whitespace.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

/// Appends the canonical encoding of `value` to `out`.
pub fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Integer(number) => {
            out.push(b'i');
            out.extend_from_slice(number.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Bytes(bytes) => write_bytes(bytes, out),
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(dict) => {
            out.push(b'd');
            // BTreeMap iteration order is the canonical key order.
            for (key, item) in dict {
                write_bytes(key, out);
                encode_into(item, out);
            }
            out.push(b'e');
        }
    }
}

fn write_bytes(bytes: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_scalars() {
        assert_eq!(encode(&Value::Integer(-42)), b"i-42e");
        assert_eq!(encode(&Value::bytes(b"spam")), b"4:spam");
        assert_eq!(encode(&Value::bytes(b"")), b"0:");
    }

    #[test]
    fn test_encode_containers() {
        let value = Value::List(vec![Value::Integer(1), Value::from("ab")]);
        assert_eq!(encode(&value), b"li1e2:abe");

        let value = Value::dict([("b", Value::Integer(2)), ("a", Value::List(vec![]))]);
        assert_eq!(encode(&value), b"d1:ale1:bi2ee");
    }

    #[test]
    fn test_encode_into_appends() {
        let mut out = vec![0xea];
        encode_into(&Value::from("x"), &mut out);
        assert_eq!(out, b"\xea1:x");
    }
}
