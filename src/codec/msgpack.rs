//! MsgPack payload codec using `rmp-serde`.
//!
//! **CRITICAL**: Always use `to_vec_named`, NEVER `to_vec`!
//! The gateway reads objects as maps keyed by field name; positional arrays
//! break it.
//!
//! # Example
//!
//! ```
//! use callmesh::codec::{PayloadCodec, Value};
//!
//! let codec = PayloadCodec::new();
//! let value = Value::from_pairs([("id", Value::Int(42))]);
//! let bytes = codec.encode(&value).unwrap();
//! assert_eq!(codec.decode(&bytes).unwrap(), value);
//! ```

use std::cell::Cell;
use std::io::Cursor;

use serde::de::DeserializeSeed;

use super::value::{Value, ValueSeed};
use crate::error::{CallmeshError, Result};

/// Default maximum nesting depth for payloads.
pub const DEFAULT_MAX_DEPTH: usize = 128;

/// MessagePack codec for [`Value`] trees with a nesting limit.
#[derive(Debug, Clone, Copy)]
pub struct PayloadCodec {
    max_depth: usize,
}

impl PayloadCodec {
    /// Create a codec with the default depth limit.
    pub fn new() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    /// Create a codec with a custom depth limit.
    pub fn with_max_depth(max_depth: usize) -> Self {
        Self {
            max_depth: max_depth.max(1),
        }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Encode a value to MsgPack bytes.
    ///
    /// # Errors
    ///
    /// `PayloadTooDeep` if the value nests beyond the limit.
    pub fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        if value.depth() > self.max_depth {
            return Err(CallmeshError::PayloadTooDeep {
                limit: self.max_depth,
            });
        }
        // CRITICAL: to_vec_named, NOT to_vec!
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    ///
    /// # Errors
    ///
    /// `PayloadDecode` with the byte offset reached when the input is
    /// malformed or has trailing bytes, `PayloadTooDeep` when nesting exceeds
    /// the limit.
    pub fn decode(&self, bytes: &[u8]) -> Result<Value> {
        let too_deep = Cell::new(false);
        let mut de = rmp_serde::Deserializer::new(Cursor::new(bytes));
        let result = ValueSeed::new(self.max_depth, &too_deep).deserialize(&mut de);
        let offset = de.get_ref().position();

        match result {
            Ok(value) if offset as usize == bytes.len() => Ok(value),
            Ok(_) => Err(CallmeshError::PayloadDecode {
                offset: Some(offset),
                message: format!("{} trailing bytes", bytes.len() as u64 - offset),
            }),
            Err(_) if too_deep.get() => Err(CallmeshError::PayloadTooDeep {
                limit: self.max_depth,
            }),
            Err(e) => Err(CallmeshError::PayloadDecode {
                offset: Some(offset),
                message: e.to_string(),
            }),
        }
    }

    /// Encode any serializable value without the [`Value`] indirection.
    #[inline]
    pub fn encode_serde<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }
}

impl Default for PayloadCodec {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Map;

    fn sample() -> Value {
        Value::from_pairs([
            ("id", Value::Int(42)),
            ("ratio", Value::Float(0.5)),
            ("name", Value::from("foobar")),
            ("blob", Value::Binary(vec![0, 1, 2, 255])),
            ("tags", Value::Array(vec![Value::Bool(true), Value::Null])),
            ("nested", Value::from_pairs([("negative", Value::Int(-7))])),
        ])
    }

    #[test]
    fn test_encode_decode_tree() {
        let codec = PayloadCodec::new();
        let value = sample();
        let bytes = codec.encode(&value).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), value);
    }

    #[test]
    fn test_reencode_is_byte_identical() {
        let codec = PayloadCodec::new();
        let bytes = codec.encode(&sample()).unwrap();
        let again = codec.encode(&codec.decode(&bytes).unwrap()).unwrap();
        assert_eq!(bytes, again);
    }

    #[test]
    fn test_binary_is_not_text() {
        let codec = PayloadCodec::new();
        let bytes = codec.encode(&Value::Binary(b"abc".to_vec())).unwrap();
        // bin8 marker
        assert_eq!(bytes[0], 0xc4);
        assert_eq!(codec.decode(&bytes).unwrap(), Value::Binary(b"abc".to_vec()));

        let text = codec.encode(&Value::from("abc")).unwrap();
        assert_eq!(codec.decode(&text).unwrap(), Value::from("abc"));
    }

    #[test]
    fn test_int_and_float_not_coerced() {
        let codec = PayloadCodec::new();
        let int = codec.decode(&codec.encode(&Value::Int(3)).unwrap()).unwrap();
        let float = codec.decode(&codec.encode(&Value::Float(3.0)).unwrap()).unwrap();
        assert_eq!(int, Value::Int(3));
        assert_eq!(float, Value::Float(3.0));
    }

    #[test]
    fn test_decode_foreign_struct() {
        #[derive(serde::Serialize)]
        struct Foreign {
            id: u32,
            #[serde(with = "serde_bytes")]
            data: Vec<u8>,
        }
        let bytes = rmp_serde::to_vec_named(&Foreign {
            id: 7,
            data: vec![9, 9],
        })
        .unwrap();
        let value = PayloadCodec::new().decode(&bytes).unwrap();
        assert_eq!(value.get("id"), Some(&Value::Int(7)));
        assert_eq!(value.get("data"), Some(&Value::Binary(vec![9, 9])));
    }

    #[test]
    fn test_encode_too_deep() {
        let codec = PayloadCodec::with_max_depth(3);
        let mut value = Value::Int(1);
        for _ in 0..3 {
            value = Value::Array(vec![value]);
        }
        assert!(matches!(
            codec.encode(&value),
            Err(CallmeshError::PayloadTooDeep { limit: 3 })
        ));
    }

    #[test]
    fn test_decode_too_deep() {
        let mut value = Value::Int(1);
        for _ in 0..10 {
            let mut map = Map::new();
            map.insert("k".into(), value);
            value = Value::Map(map);
        }
        let bytes = PayloadCodec::new().encode(&value).unwrap();
        let strict = PayloadCodec::with_max_depth(5);
        assert!(matches!(
            strict.decode(&bytes),
            Err(CallmeshError::PayloadTooDeep { limit: 5 })
        ));
    }

    #[test]
    fn test_decode_truncated_reports_offset() {
        let codec = PayloadCodec::new();
        let bytes = codec.encode(&sample()).unwrap();
        let err = codec.decode(&bytes[..bytes.len() - 2]).unwrap_err();
        match err {
            CallmeshError::PayloadDecode { offset, .. } => assert!(offset.is_some()),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_decode_trailing_bytes() {
        let codec = PayloadCodec::new();
        let mut bytes = codec.encode(&Value::Int(1)).unwrap();
        bytes.push(0xc0);
        match codec.decode(&bytes).unwrap_err() {
            CallmeshError::PayloadDecode { offset, .. } => assert_eq!(offset, Some(1)),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_decode_out_of_range_u64() {
        let bytes = rmp_serde::to_vec(&u64::MAX).unwrap();
        assert!(matches!(
            PayloadCodec::new().decode(&bytes),
            Err(CallmeshError::PayloadDecode { .. })
        ));
    }
}
