//! Payload codecs
//!
//! A codec turns a [`serde_json::Value`] into bytes and back. `Value` is the
//! neutral data model shared by every codec, so typed handlers only ever see
//! their own request/response types and the dispatcher never needs to know
//! which encoding a message used.
//!
//! Codecs are looked up by content type in a [`Codecs`] table carried by the
//! server options.

mod json;
mod text;

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

pub use json::JsonCodec;
pub use text::TextCodec;

/// Content type used when a message does not name one
pub const DEFAULT_CONTENT_TYPE: &str = JsonCodec::CONTENT_TYPE;

/// Codec failures
#[derive(Debug, Error)]
pub enum CodecError {
    /// No codec registered for the content type
    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),

    /// Bytes could not be decoded
    #[error("decode failed: {0}")]
    Decode(String),

    /// Value could not be encoded
    #[error("encode failed: {0}")]
    Encode(String),
}

/// Marshals values to and from bytes
pub trait Codec: Send + Sync {
    /// MIME type this codec handles
    fn content_type(&self) -> &str;

    /// Encode a value
    fn marshal(&self, value: &Value) -> Result<Bytes, CodecError>;

    /// Decode bytes into a value
    fn unmarshal(&self, data: &[u8]) -> Result<Value, CodecError>;
}

impl std::fmt::Debug for dyn Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Codec")
            .field("content_type", &self.content_type())
            .finish()
    }
}

/// Encode a typed value with any codec
pub fn encode<T: Serialize + ?Sized>(codec: &dyn Codec, value: &T) -> Result<Bytes, CodecError> {
    let value = serde_json::to_value(value).map_err(|e| CodecError::Encode(e.to_string()))?;
    codec.marshal(&value)
}

/// Decode bytes into a typed value with any codec
pub fn decode<T: DeserializeOwned>(codec: &dyn Codec, data: &[u8]) -> Result<T, CodecError> {
    let value = codec.unmarshal(data)?;
    serde_json::from_value(value).map_err(|e| CodecError::Decode(e.to_string()))
}

/// Codecs keyed by content type, with a default
#[derive(Debug, Clone)]
pub struct Codecs {
    by_type: HashMap<String, Arc<dyn Codec>>,
    default_type: String,
}

impl Codecs {
    /// An empty table whose default is `default`
    pub fn with_default(default: Arc<dyn Codec>) -> Self {
        let default_type = default.content_type().to_string();
        let mut by_type = HashMap::new();
        by_type.insert(default_type.clone(), default);

        Self {
            by_type,
            default_type,
        }
    }

    /// Add (or replace) a codec
    pub fn register(mut self, codec: Arc<dyn Codec>) -> Self {
        self.by_type.insert(codec.content_type().to_string(), codec);
        self
    }

    /// Content type of the default codec
    pub fn default_content_type(&self) -> &str {
        &self.default_type
    }

    /// The default codec
    pub fn default_codec(&self) -> Arc<dyn Codec> {
        self.by_type
            .get(&self.default_type)
            .cloned()
            .unwrap_or_else(|| Arc::new(JsonCodec))
    }

    /// Find the codec for a content type; empty or missing means default
    ///
    /// Parameters after `;` (e.g. `charset=utf-8`) are ignored.
    pub fn resolve(&self, content_type: Option<&str>) -> Result<Arc<dyn Codec>, CodecError> {
        let wanted = content_type
            .map(|ct| ct.split(';').next().unwrap_or_default().trim())
            .filter(|ct| !ct.is_empty());

        match wanted {
            None => Ok(self.default_codec()),
            Some(ct) => self
                .by_type
                .get(ct)
                .cloned()
                .ok_or_else(|| CodecError::UnsupportedContentType(ct.to_string())),
        }
    }

    /// Registered content types
    pub fn content_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.by_type.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl Default for Codecs {
    fn default() -> Self {
        Self::with_default(Arc::new(JsonCodec)).register(Arc::new(TextCodec))
    }
}
