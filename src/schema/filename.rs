//! Byte-safe file name encoding.
//!
//! File names are stored as plain UTF-8 strings when possible.  Names that
//! are not valid UTF-8 are stored under `fileNameBytes` (and symlink
//! targets under `symlinkTargetBytes`) as a JSON array interleaving UTF-8
//! string fragments with integer byte values; decoders concatenate the
//! pieces.  Names containing `/` or `\` are never valid.

use crate::error::{Error, Result};
use serde_json::Value;

/// Reports whether a decoded name is acceptable as a single path element.
pub fn is_valid_name(name: &str) -> bool {
    is_valid_name_bytes(name.as_bytes())
}

/// Byte-level form of [`is_valid_name`], for names that are not UTF-8.
pub fn is_valid_name_bytes(name: &[u8]) -> bool {
    !name.is_empty() && !name.contains(&b'/') && !name.contains(&b'\\')
}

/// Encodes raw name bytes as the mixed string/byte JSON array.
pub fn mixed_array_from_bytes(raw: &[u8]) -> Vec<Value> {
    let mut out = Vec::new();
    let mut rest = raw;
    while !rest.is_empty() {
        match std::str::from_utf8(rest) {
            Ok(s) => {
                out.push(Value::String(s.to_string()));
                break;
            }
            Err(err) => {
                let valid = err.valid_up_to();
                if valid > 0 {
                    out.push(Value::String(
                        String::from_utf8_lossy(&rest[..valid]).into_owned(),
                    ));
                }
                out.push(Value::from(u64::from(rest[valid])));
                rest = &rest[valid + 1..];
            }
        }
    }
    out
}

/// Decodes a mixed string/byte JSON array back into raw bytes.
pub fn bytes_from_mixed_array(parts: &[Value]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for part in parts {
        match part {
            Value::String(s) => out.extend_from_slice(s.as_bytes()),
            Value::Number(n) => {
                let byte = n
                    .as_u64()
                    .filter(|v| *v <= u64::from(u8::MAX))
                    .ok_or_else(|| {
                        Error::InvalidArgument(format!("byte value {n} out of range"))
                    })?;
                out.push(byte as u8);
            }
            other => {
                return Err(Error::InvalidArgument(format!(
                    "unexpected element {other} in mixed byte array"
                )))
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::{bytes_from_mixed_array, is_valid_name, mixed_array_from_bytes};
    use serde_json::{json, Value};

    #[test]
    fn plain_utf8_is_one_string() {
        let parts = mixed_array_from_bytes(b"example.txt");
        assert_eq!(parts, vec![Value::String("example.txt".into())]);
    }

    #[test]
    fn latin1_byte_becomes_integer() {
        // "Am\xe9lie.jpg": 0xe9 is not valid UTF-8.
        let raw = b"Am\xe9lie.jpg";
        let parts = mixed_array_from_bytes(raw);
        assert_eq!(parts, vec![json!("Am"), json!(233), json!("lie.jpg")]);
        let decoded = bytes_from_mixed_array(&parts).unwrap();
        assert_eq!(decoded, raw);
        assert_eq!(decoded.len(), 10);
    }

    #[test]
    fn consecutive_invalid_bytes_round_trip() {
        let raw = b"\xff\xfeab\xff";
        let parts = mixed_array_from_bytes(raw);
        assert_eq!(bytes_from_mixed_array(&parts).unwrap(), raw);
    }

    #[test]
    fn decode_rejects_out_of_range() {
        assert!(bytes_from_mixed_array(&[json!(256)]).is_err());
        assert!(bytes_from_mixed_array(&[json!(-1)]).is_err());
        assert!(bytes_from_mixed_array(&[json!({"a": 1})]).is_err());
    }

    #[test]
    fn name_validity() {
        assert!(is_valid_name("photo.jpg"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("a/b"));
        assert!(!is_valid_name("a\\b"));
    }
}
