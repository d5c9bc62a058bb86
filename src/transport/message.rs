//! Request/response types carried by transports

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;

use crate::codec::DEFAULT_CONTENT_TYPE;

/// Outcome of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Handled successfully
    Ok,
    /// Malformed request or undecodable body
    BadRequest,
    /// No such handler or method
    NotFound,
    /// Deadline exceeded
    Timeout,
    /// Handler failure or panic
    InternalError,
    /// A collaborator was unreachable
    Unavailable,
}

impl Status {
    /// HTTP-style numeric code
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::BadRequest => 400,
            Status::NotFound => 404,
            Status::Timeout => 408,
            Status::InternalError => 500,
            Status::Unavailable => 503,
        }
    }

    /// Status text
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::BadRequest => "Bad Request",
            Status::NotFound => "Not Found",
            Status::Timeout => "Request Timeout",
            Status::InternalError => "Internal Server Error",
            Status::Unavailable => "Service Unavailable",
        }
    }

    /// Map a numeric code back to a status
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            200 => Some(Status::Ok),
            400 => Some(Status::BadRequest),
            404 => Some(Status::NotFound),
            408 => Some(Status::Timeout),
            500 => Some(Status::InternalError),
            503 => Some(Status::Unavailable),
            _ => None,
        }
    }

    /// Whether the call succeeded
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code(), self.as_str())
    }
}

/// Inbound call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Target service name
    pub service: String,
    /// `Handler.Method`
    pub endpoint: String,
    /// Body encoding
    pub content_type: String,
    /// Call metadata
    pub header: HashMap<String, String>,
    /// Encoded body
    pub body: Bytes,
    /// Caller's deadline, relative to arrival
    pub timeout: Option<Duration>,
}

impl Request {
    /// Create a request with the default content type
    pub fn new(
        service: impl Into<String>,
        endpoint: impl Into<String>,
        body: impl Into<Bytes>,
    ) -> Self {
        Self {
            service: service.into(),
            endpoint: endpoint.into(),
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            header: HashMap::new(),
            body: body.into(),
            timeout: None,
        }
    }

    /// Set the content type
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Add a header
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.header.insert(key.into(), value.into());
        self
    }

    /// Set a deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Split the endpoint into handler and method names
    ///
    /// The split happens at the last `.`, so dotted handler names such as
    /// `greeter.v1.Greeter.Hello` resolve to (`greeter.v1.Greeter`, `Hello`).
    /// Returns `None` if either half is empty.
    pub fn target(&self) -> Option<(&str, &str)> {
        let (handler, method) = self.endpoint.rsplit_once('.')?;
        if handler.is_empty() || method.is_empty() {
            return None;
        }
        Some((handler, method))
    }
}

/// Outbound reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Outcome
    pub status: Status,
    /// Body encoding
    pub content_type: String,
    /// Reply metadata
    pub header: HashMap<String, String>,
    /// Encoded result, or an encoded error body on failure
    pub body: Bytes,
}

impl Response {
    /// Successful response
    pub fn ok(content_type: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self::with_status(Status::Ok, content_type, body)
    }

    /// Response with an explicit status
    pub fn with_status(
        status: Status,
        content_type: impl Into<String>,
        body: impl Into<Bytes>,
    ) -> Self {
        Self {
            status,
            content_type: content_type.into(),
            header: HashMap::new(),
            body: body.into(),
        }
    }

    /// Whether the call succeeded
    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target() {
        let req = Request::new("greeter", "Greeter.Hello", Bytes::new());
        assert_eq!(req.target(), Some(("Greeter", "Hello")));

        let req = Request::new("greeter", "greeter.v1.Greeter.Hello", Bytes::new());
        assert_eq!(req.target(), Some(("greeter.v1.Greeter", "Hello")));
    }

    #[test]
    fn test_target_malformed() {
        for endpoint in ["Greeter", "Greeter.", ".Hello", ""] {
            let req = Request::new("greeter", endpoint, Bytes::new());
            assert_eq!(req.target(), None, "{endpoint}");
        }
    }

    #[test]
    fn test_status_codes() {
        for status in [
            Status::Ok,
            Status::BadRequest,
            Status::NotFound,
            Status::Timeout,
            Status::InternalError,
            Status::Unavailable,
        ] {
            assert_eq!(Status::from_code(status.code()), Some(status));
        }
        assert_eq!(Status::from_code(418), None);
        assert_eq!(Status::NotFound.to_string(), "404 Not Found");
    }
}
