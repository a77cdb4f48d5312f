//! MsgPack codec using `rmp-serde`.
//!
//! Always encode with `to_vec_named`. Envelopes are maps keyed by field name
//! (`args`, `kwargs`, `status`, `result`) so that workers written in other
//! languages can read them without knowing the Rust field order.
//!
//! # Example
//!
//! ```
//! use leafwire::codec::MsgPackCodec;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Point {
//!     x: i32,
//!     y: i32,
//! }
//!
//! let point = Point { x: 1, y: 2 };
//! let encoded = MsgPackCodec::encode(&point).unwrap();
//! let decoded: Point = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, point);
//! ```

use crate::error::Result;

/// MessagePack codec for envelopes and values.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes (struct-as-map format).
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes cannot be deserialized to type T.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use serde_json::{json, Value};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Reply {
        status: bool,
        result: Value,
    }

    #[test]
    fn test_struct_encodes_as_map() {
        let reply = Reply {
            status: true,
            result: json!(5),
        };

        let encoded = MsgPackCodec::encode(&reply).unwrap();

        // 0x82 = fixmap with 2 elements; positional encoding would be 0x92
        assert_eq!(encoded[0], 0x82, "Expected fixmap, got {:02X}", encoded[0]);

        let decoded: Reply = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, reply);
    }

    #[test]
    fn test_dynamic_value_survives_encoding() {
        let value = json!({
            "name": "math",
            "args": [1, -2, 3.5, "x", null, true],
            "nested": { "list": [[], {}] }
        });

        let encoded = MsgPackCodec::encode(&value).unwrap();
        let decoded: Value = MsgPackCodec::decode(&encoded).unwrap();

        assert_eq!(decoded, value);
    }

    #[test]
    fn test_null_encodes_as_nil() {
        let encoded = MsgPackCodec::encode(&Value::Null).unwrap();
        assert_eq!(encoded, vec![0xc0]);

        let decoded: Value = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, Value::Null);
    }

    #[test]
    fn test_decode_error_on_invalid_data() {
        // 0xc1 is never used in MsgPack
        let result: Result<Value> = MsgPackCodec::decode(&[0xc1]);
        assert!(result.is_err());
    }

    #[test]
    fn test_decode_error_on_truncated_map() {
        let encoded = MsgPackCodec::encode(&json!({ "status": true })).unwrap();
        let result: Result<Value> = MsgPackCodec::decode(&encoded[..encoded.len() - 1]);
        assert!(result.is_err());
    }
}
