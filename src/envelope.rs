//! Call and result envelopes exchanged over the broker.
//!
//! A request body is a [`CallEnvelope`] (`{"args": [...], "kwargs": {...}}`) and a
//! reply body is a [`ResultEnvelope`] (`{"status": bool, "result": value}`). Both are
//! encoded with [`MsgPackCodec`]. The two are joined only by the [`CorrelationId`]
//! carried in the message properties.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::codec::MsgPackCodec;
use crate::error::{LeafwireError, Result};

/// Opaque token joining a request to its reply.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a fresh random (UUID v4) correlation id.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the id as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for CorrelationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for CorrelationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Arguments of one remote call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallEnvelope {
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<Value>,
    /// Keyword arguments.
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl CallEnvelope {
    /// Create an envelope with no arguments.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Set a keyword argument.
    pub fn kwarg(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.to_string(), value.into());
        self
    }

    /// Build an envelope from any serializable argument value.
    ///
    /// Arrays and tuples become positional arguments, maps and structs become
    /// keyword arguments, unit/`None` means no arguments and any other value is a
    /// single positional argument.
    pub fn from_args<A: Serialize + ?Sized>(args: &A) -> Result<Self> {
        let envelope = match serde_json::to_value(args)? {
            Value::Null => Self::new(),
            Value::Array(args) => Self {
                args,
                kwargs: Map::new(),
            },
            Value::Object(kwargs) => Self {
                args: Vec::new(),
                kwargs,
            },
            other => Self::new().arg(other),
        };
        Ok(envelope)
    }

    /// Rebuild a typed argument value from this envelope.
    ///
    /// The inverse of [`CallEnvelope::from_args`]. With only positional arguments
    /// `T` is decoded from the argument array, falling back to the single argument
    /// itself (or `null` when there are none). With only keyword arguments `T` is
    /// decoded from the keyword map. With both, the keyword map is appended to the
    /// positional array.
    pub fn decode_args<T: DeserializeOwned>(&self) -> Result<T> {
        if self.kwargs.is_empty() {
            return match serde_json::from_value(Value::Array(self.args.clone())) {
                Ok(parsed) => Ok(parsed),
                Err(e) if self.args.len() <= 1 => {
                    let single = self.args.first().cloned().unwrap_or(Value::Null);
                    serde_json::from_value(single).map_err(|_| LeafwireError::Json(e))
                }
                Err(e) => Err(e.into()),
            };
        }

        if self.args.is_empty() {
            return Ok(serde_json::from_value(Value::Object(self.kwargs.clone()))?);
        }

        let mut combined = self.args.clone();
        combined.push(Value::Object(self.kwargs.clone()));
        Ok(serde_json::from_value(Value::Array(combined))?)
    }

    /// Encode to MsgPack bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        MsgPackCodec::encode(self)
    }

    /// Decode from MsgPack bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        MsgPackCodec::decode(bytes)
            .map_err(|e| LeafwireError::Protocol(format!("malformed call envelope: {}", e)))
    }
}

/// Outcome of one remote call.
///
/// `status == true` means `result` is the return value; otherwise `result` holds a
/// human-readable failure description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub status: bool,
    pub result: Value,
}

impl ResultEnvelope {
    /// Successful outcome carrying the return value.
    pub fn success(result: Value) -> Self {
        Self {
            status: true,
            result,
        }
    }

    /// Failed outcome carrying a description.
    pub fn failure(description: impl Into<String>) -> Self {
        Self {
            status: false,
            result: Value::String(description.into()),
        }
    }

    /// Encode to MsgPack bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        MsgPackCodec::encode(self)
    }

    /// Decode from MsgPack bytes.
    ///
    /// Both `status` (a bool) and `result` must be present; anything else is a
    /// protocol violation. A `nil` result is a present result.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let value: Value = MsgPackCodec::decode(bytes)
            .map_err(|e| LeafwireError::Protocol(format!("malformed result envelope: {}", e)))?;

        let Value::Object(mut fields) = value else {
            return Err(LeafwireError::Protocol(
                "result envelope is not a map".to_string(),
            ));
        };

        let status = match fields.remove("status") {
            Some(Value::Bool(status)) => status,
            Some(other) => {
                return Err(LeafwireError::Protocol(format!(
                    "result envelope status must be a bool, got {}",
                    other
                )))
            }
            None => {
                return Err(LeafwireError::Protocol(
                    "result envelope is missing 'status'".to_string(),
                ))
            }
        };

        let result = fields.remove("result").ok_or_else(|| {
            LeafwireError::Protocol("result envelope is missing 'result'".to_string())
        })?;

        Ok(Self { status, result })
    }

    /// Convert into the caller-facing result.
    ///
    /// A failure becomes [`LeafwireError::Remote`] carrying the description.
    pub fn into_result(self) -> Result<Value> {
        if self.status {
            return Ok(self.result);
        }

        let description = match self.result {
            Value::String(text) => text,
            other => other.to_string(),
        };
        Err(LeafwireError::Remote(description))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Deserialize, Serialize, Debug, PartialEq)]
    struct Resize {
        width: u32,
        height: u32,
    }

    #[test]
    fn test_correlation_ids_are_unique() {
        let ids: std::collections::HashSet<CorrelationId> =
            (0..1000).map(|_| CorrelationId::new()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_builder_arguments() {
        let call = CallEnvelope::new().arg(2).arg("x").kwarg("scale", 1.5);

        assert_eq!(call.args, vec![json!(2), json!("x")]);
        assert_eq!(call.kwargs.get("scale"), Some(&json!(1.5)));
    }

    #[test]
    fn test_from_args_tuple_is_positional() {
        let call = CallEnvelope::from_args(&(2, 3)).unwrap();
        assert_eq!(call.args, vec![json!(2), json!(3)]);
        assert!(call.kwargs.is_empty());
    }

    #[test]
    fn test_from_args_struct_is_keyword() {
        let call = CallEnvelope::from_args(&Resize {
            width: 640,
            height: 480,
        })
        .unwrap();

        assert!(call.args.is_empty());
        assert_eq!(call.kwargs.get("width"), Some(&json!(640)));
        assert_eq!(call.kwargs.get("height"), Some(&json!(480)));
    }

    #[test]
    fn test_from_args_unit_and_scalar() {
        assert_eq!(CallEnvelope::from_args(&()).unwrap(), CallEnvelope::new());
        assert_eq!(
            CallEnvelope::from_args(&7).unwrap(),
            CallEnvelope::new().arg(7)
        );
    }

    #[test]
    fn test_decode_positional_tuple() {
        let call = CallEnvelope::new().arg(1).arg(0);
        let (a, b): (i64, i64) = call.decode_args().unwrap();
        assert_eq!((a, b), (1, 0));
    }

    #[test]
    fn test_decode_single_and_empty() {
        let n: i64 = CallEnvelope::new().arg(5).decode_args().unwrap();
        assert_eq!(n, 5);

        let one: (i64,) = CallEnvelope::new().arg(5).decode_args().unwrap();
        assert_eq!(one, (5,));

        let () = CallEnvelope::new().decode_args().unwrap();
        let none: Vec<i64> = CallEnvelope::new().decode_args().unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_decode_keyword_struct() {
        let call = CallEnvelope::new()
            .kwarg("width", 640)
            .kwarg("height", 480);
        let parsed: Resize = call.decode_args().unwrap();
        assert_eq!(
            parsed,
            Resize {
                width: 640,
                height: 480
            }
        );
    }

    #[test]
    fn test_decode_mixed_appends_keywords() {
        let call = CallEnvelope::new().arg("thumb").kwarg("width", 64).kwarg("height", 64);
        let (name, size): (String, Resize) = call.decode_args().unwrap();
        assert_eq!(name, "thumb");
        assert_eq!(size.width, 64);
    }

    #[test]
    fn test_decode_args_type_mismatch() {
        let call = CallEnvelope::new().arg("two").arg("three");
        let result: Result<(i64, i64)> = call.decode_args();
        assert!(matches!(result, Err(LeafwireError::Json(_))));
    }

    #[test]
    fn test_call_envelope_missing_fields_default() {
        let bytes = MsgPackCodec::encode(&json!({ "args": [1] })).unwrap();
        let call = CallEnvelope::decode(&bytes).unwrap();
        assert_eq!(call.args, vec![json!(1)]);
        assert!(call.kwargs.is_empty());
    }

    #[test]
    fn test_call_envelope_garbage_is_protocol_error() {
        let result = CallEnvelope::decode(&[0xc1, 0x00]);
        assert!(matches!(result, Err(LeafwireError::Protocol(_))));
    }

    #[test]
    fn test_result_envelope_nil_result_is_present() {
        let bytes = ResultEnvelope::success(Value::Null).encode().unwrap();
        let decoded = ResultEnvelope::decode(&bytes).unwrap();
        assert!(decoded.status);
        assert_eq!(decoded.result, Value::Null);
    }

    #[test]
    fn test_result_envelope_missing_fields() {
        let missing_result = MsgPackCodec::encode(&json!({ "status": true })).unwrap();
        assert!(matches!(
            ResultEnvelope::decode(&missing_result),
            Err(LeafwireError::Protocol(msg)) if msg.contains("'result'")
        ));

        let missing_status = MsgPackCodec::encode(&json!({ "result": 1 })).unwrap();
        assert!(matches!(
            ResultEnvelope::decode(&missing_status),
            Err(LeafwireError::Protocol(msg)) if msg.contains("'status'")
        ));

        let wrong_status = MsgPackCodec::encode(&json!({ "status": 1, "result": 1 })).unwrap();
        assert!(ResultEnvelope::decode(&wrong_status).is_err());

        let not_a_map = MsgPackCodec::encode(&json!([true, 1])).unwrap();
        assert!(ResultEnvelope::decode(&not_a_map).is_err());
    }

    #[test]
    fn test_into_result() {
        assert_eq!(
            ResultEnvelope::success(json!(5)).into_result().unwrap(),
            json!(5)
        );

        match ResultEnvelope::failure("ZeroDivision: division by zero").into_result() {
            Err(LeafwireError::Remote(msg)) => assert!(msg.contains("division")),
            other => panic!("expected remote error, got {:?}", other),
        }
    }
}
