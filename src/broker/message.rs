//! Broker message type

use std::collections::HashMap;

use bytes::Bytes;

/// Header naming the body encoding
pub const CONTENT_TYPE_HEADER: &str = "Content-Type";

/// A message carried by the broker
///
/// Cheap to clone: the body is a reference-counted `Bytes`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    /// Message headers
    pub header: HashMap<String, String>,
    /// Encoded body
    pub body: Bytes,
}

impl Message {
    /// Create a message with no headers
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            header: HashMap::new(),
            body: body.into(),
        }
    }

    /// Add a header
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.header.insert(key.into(), value.into());
        self
    }

    /// Set the content type header
    pub fn with_content_type(self, content_type: impl Into<String>) -> Self {
        self.with_header(CONTENT_TYPE_HEADER, content_type)
    }

    /// Content type header, if present
    pub fn content_type(&self) -> Option<&str> {
        self.header.get(CONTENT_TYPE_HEADER).map(String::as_str)
    }
}
