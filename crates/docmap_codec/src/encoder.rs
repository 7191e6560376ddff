//! Canonical binary (CBOR) encoder.

use crate::error::{CodecError, CodecResult};
use crate::value::{cmp_keys, Value};

/// Tag wrapping an integer count of milliseconds since the Unix epoch.
pub const TAG_DATE_MILLIS: u64 = 55_801;
/// Tag wrapping the 12 raw bytes of an [`ObjectId`](crate::ObjectId).
pub const TAG_OBJECT_ID: u64 = 55_802;

/// Encode a value to canonical CBOR bytes.
///
/// Output is deterministic:
/// - Map keys are sorted by their encoded form (length-first, then bytewise)
/// - Integers use the shortest possible encoding
/// - Floats are always written as doubles
/// - No indefinite-length encoding
///
/// Identical documents therefore produce identical bytes, which the
/// identity map relies on when it keys documents by their encoded id.
///
/// # Errors
///
/// Returns an error if the value contains a NaN float.
pub fn to_canonical_cbor(value: &Value) -> CodecResult<Vec<u8>> {
    let mut encoder = CanonicalEncoder::new();
    encoder.encode(value)?;
    Ok(encoder.into_bytes())
}

/// A canonical CBOR encoder.
pub struct CanonicalEncoder {
    buffer: Vec<u8>,
}

impl CanonicalEncoder {
    /// Create a new encoder.
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Create a new encoder with the specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// Encode a value.
    pub fn encode(&mut self, value: &Value) -> CodecResult<()> {
        match value {
            Value::Null => self.buffer.push(0xf6),
            Value::Bool(b) => self.buffer.push(if *b { 0xf5 } else { 0xf4 }),
            Value::Integer(n) => self.encode_integer(*n),
            Value::Float(f) => self.encode_float(*f)?,
            Value::Bytes(b) => self.encode_bytes(b),
            Value::Text(s) => self.encode_text(s),
            Value::Date(ms) => {
                self.encode_unsigned(6, TAG_DATE_MILLIS);
                self.encode_integer(*ms);
            }
            Value::ObjectId(id) => {
                self.encode_unsigned(6, TAG_OBJECT_ID);
                self.encode_bytes(id.as_bytes());
            }
            Value::Array(arr) => self.encode_array(arr)?,
            Value::Map(pairs) => self.encode_map(pairs)?,
        }
        Ok(())
    }

    /// Consume this encoder and return the encoded bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Get a reference to the encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    #[allow(clippy::cast_sign_loss)]
    fn encode_integer(&mut self, n: i64) {
        if n >= 0 {
            self.encode_unsigned(0, n as u64);
        } else {
            // -1 encodes as 0, -2 as 1, ...
            let abs_minus_one = (-(n + 1)) as u64;
            self.encode_unsigned(1, abs_minus_one);
        }
    }

    fn encode_float(&mut self, f: f64) -> CodecResult<()> {
        if f.is_nan() {
            return Err(CodecError::NaNForbidden);
        }
        self.buffer.push(0xfb);
        self.buffer.extend_from_slice(&f.to_be_bytes());
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn encode_unsigned(&mut self, major_type: u8, value: u64) {
        let mt = major_type << 5;

        if value < 24 {
            self.buffer.push(mt | (value as u8));
        } else if u8::try_from(value).is_ok() {
            self.buffer.push(mt | 24);
            self.buffer.push(value as u8);
        } else if u16::try_from(value).is_ok() {
            self.buffer.push(mt | 25);
            self.buffer.extend_from_slice(&(value as u16).to_be_bytes());
        } else if u32::try_from(value).is_ok() {
            self.buffer.push(mt | 26);
            self.buffer.extend_from_slice(&(value as u32).to_be_bytes());
        } else {
            self.buffer.push(mt | 27);
            self.buffer.extend_from_slice(&value.to_be_bytes());
        }
    }

    fn encode_bytes(&mut self, bytes: &[u8]) {
        self.encode_unsigned(2, bytes.len() as u64);
        self.buffer.extend_from_slice(bytes);
    }

    fn encode_text(&mut self, text: &str) {
        self.encode_unsigned(3, text.len() as u64);
        self.buffer.extend_from_slice(text.as_bytes());
    }

    fn encode_array(&mut self, arr: &[Value]) -> CodecResult<()> {
        self.encode_unsigned(4, arr.len() as u64);
        for item in arr {
            self.encode(item)?;
        }
        Ok(())
    }

    fn encode_map(&mut self, pairs: &[(String, Value)]) -> CodecResult<()> {
        let mut sorted: Vec<&(String, Value)> = pairs.iter().collect();
        sorted.sort_by(|a, b| cmp_keys(&a.0, &b.0));
        if sorted.windows(2).any(|w| w[0].0 == w[1].0) {
            return Err(CodecError::invalid_structure("duplicate map key"));
        }

        self.encode_unsigned(5, pairs.len() as u64);
        for (key, value) in sorted {
            self.encode_text(key);
            self.encode(value)?;
        }
        Ok(())
    }
}

impl Default for CanonicalEncoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ObjectId;

    #[test]
    fn encode_simple_values() {
        assert_eq!(to_canonical_cbor(&Value::Null).unwrap(), vec![0xf6]);
        assert_eq!(to_canonical_cbor(&Value::Bool(false)).unwrap(), vec![0xf4]);
        assert_eq!(to_canonical_cbor(&Value::Bool(true)).unwrap(), vec![0xf5]);
    }

    #[test]
    fn encode_integers_shortest_form() {
        assert_eq!(to_canonical_cbor(&Value::Integer(23)).unwrap(), vec![0x17]);
        assert_eq!(
            to_canonical_cbor(&Value::Integer(255)).unwrap(),
            vec![0x18, 255]
        );
        assert_eq!(
            to_canonical_cbor(&Value::Integer(256)).unwrap(),
            vec![0x19, 0x01, 0x00]
        );
        assert_eq!(to_canonical_cbor(&Value::Integer(-1)).unwrap(), vec![0x20]);
        assert_eq!(
            to_canonical_cbor(&Value::Integer(-100)).unwrap(),
            vec![0x38, 99]
        );
    }

    #[test]
    fn encode_float_as_double() {
        let bytes = to_canonical_cbor(&Value::Float(1.5)).unwrap();
        assert_eq!(bytes[0], 0xfb);
        assert_eq!(&bytes[1..], &1.5f64.to_be_bytes());
    }

    #[test]
    fn reject_nan() {
        assert_eq!(
            to_canonical_cbor(&Value::Float(f64::NAN)),
            Err(CodecError::NaNForbidden)
        );
    }

    #[test]
    fn encode_date_is_tagged() {
        let bytes = to_canonical_cbor(&Value::Date(1)).unwrap();
        // tag 55801 = 0xd9 0xd9 0xf9, followed by integer 1
        assert_eq!(bytes, vec![0xd9, 0xd9, 0xf9, 0x01]);
    }

    #[test]
    fn encode_object_id_is_tagged_bytes() {
        let id = ObjectId::from_bytes([7; 12]);
        let bytes = to_canonical_cbor(&Value::ObjectId(id)).unwrap();
        assert_eq!(&bytes[..3], &[0xd9, 0xd9, 0xfa]);
        assert_eq!(bytes[3], 0x4c);
        assert_eq!(&bytes[4..], &[7; 12]);
    }

    #[test]
    fn encode_map_sorted() {
        let map = Value::Map(vec![
            ("bb".to_string(), Value::Integer(2)),
            ("a".to_string(), Value::Integer(1)),
        ]);
        let bytes = to_canonical_cbor(&map).unwrap();
        assert_eq!(bytes, vec![0xa2, 0x61, b'a', 0x01, 0x62, b'b', b'b', 0x02]);
    }

    #[test]
    fn reject_duplicate_keys() {
        let map = Value::Map(vec![
            ("a".to_string(), Value::Integer(1)),
            ("a".to_string(), Value::Integer(2)),
        ]);
        assert!(matches!(
            to_canonical_cbor(&map),
            Err(CodecError::InvalidStructure { .. })
        ));
    }

    #[test]
    fn deterministic_encoding() {
        let map1 = Value::Map(vec![
            ("z".to_string(), Value::Integer(1)),
            ("a".to_string(), Value::Integer(2)),
        ]);
        let map2 = Value::Map(vec![
            ("a".to_string(), Value::Integer(2)),
            ("z".to_string(), Value::Integer(1)),
        ]);

        assert_eq!(
            to_canonical_cbor(&map1).unwrap(),
            to_canonical_cbor(&map2).unwrap()
        );
    }
}
