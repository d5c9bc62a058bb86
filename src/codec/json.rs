//! JSON codec

use bytes::Bytes;
use serde_json::Value;

use super::{Codec, CodecError};

/// `application/json` codec backed by `serde_json`
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    /// MIME type handled by this codec
    pub const CONTENT_TYPE: &'static str = "application/json";
}

impl Codec for JsonCodec {
    fn content_type(&self) -> &str {
        Self::CONTENT_TYPE
    }

    fn marshal(&self, value: &Value) -> Result<Bytes, CodecError> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn unmarshal(&self, data: &[u8]) -> Result<Value, CodecError> {
        // An empty body is a request without arguments
        if data.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(data).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_marshal() {
        let bytes = JsonCodec.marshal(&json!({"name": "Ana"})).unwrap();
        assert_eq!(&bytes[..], br#"{"name":"Ana"}"#);
    }

    #[test]
    fn test_unmarshal_empty_is_null() {
        assert_eq!(JsonCodec.unmarshal(b"").unwrap(), Value::Null);
    }

    #[test]
    fn test_unmarshal_garbage() {
        let err = JsonCodec.unmarshal(b"{not json").unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }
}
