//! Plain text codec
//!
//! Carries a UTF-8 body as a JSON string value. Useful for topics whose
//! payloads are log lines or other unstructured text.

use bytes::Bytes;
use serde_json::Value;

use super::{Codec, CodecError};

/// `text/plain` codec
#[derive(Debug, Clone, Copy, Default)]
pub struct TextCodec;

impl TextCodec {
    /// MIME type handled by this codec
    pub const CONTENT_TYPE: &'static str = "text/plain";
}

impl Codec for TextCodec {
    fn content_type(&self) -> &str {
        Self::CONTENT_TYPE
    }

    fn marshal(&self, value: &Value) -> Result<Bytes, CodecError> {
        match value {
            Value::String(s) => Ok(Bytes::copy_from_slice(s.as_bytes())),
            Value::Null => Ok(Bytes::new()),
            Value::Number(_) | Value::Bool(_) => Ok(Bytes::from(value.to_string())),
            Value::Array(_) | Value::Object(_) => Err(CodecError::Encode(
                "text/plain can only carry scalar values".to_string(),
            )),
        }
    }

    fn unmarshal(&self, data: &[u8]) -> Result<Value, CodecError> {
        std::str::from_utf8(data)
            .map(|s| Value::String(s.to_string()))
            .map_err(|e| CodecError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_text_round_trip() {
        let bytes = TextCodec.marshal(&json!("disk almost full")).unwrap();
        assert_eq!(&bytes[..], b"disk almost full");
        assert_eq!(TextCodec.unmarshal(&bytes).unwrap(), json!("disk almost full"));
    }

    #[test]
    fn test_scalars() {
        assert_eq!(&TextCodec.marshal(&json!(42)).unwrap()[..], b"42");
        assert!(TextCodec.marshal(&Value::Null).unwrap().is_empty());
    }

    #[test]
    fn test_rejects_structures() {
        assert!(TextCodec.marshal(&json!({"a": 1})).is_err());
    }

    #[test]
    fn test_rejects_invalid_utf8() {
        assert!(TextCodec.unmarshal(&[0xff, 0xfe]).is_err());
    }
}
