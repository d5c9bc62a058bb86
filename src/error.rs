//! Error types
//!
//! Every public API returns the crate [`Error`]. Collaborator plugins report
//! failures through their own error types ([`BrokerError`], [`RegistryError`],
//! [`TransportError`], [`CodecError`]) which convert into it, and user code
//! reports failures through [`HandlerError`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::server::ServerState;
use crate::transport::Status;

pub use crate::broker::BrokerError;
pub use crate::codec::CodecError;
pub use crate::registry::RegistryError;
pub use crate::transport::TransportError;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type
#[derive(Debug, Error)]
pub enum Error {
    /// Bad or missing server options
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A topic or handler name is already taken
    #[error("registration conflict: {0}")]
    RegistrationConflict(#[from] Conflict),

    /// The entity exposes nothing that could be invoked
    #[error("invalid entity: {0}")]
    InvalidEntity(String),

    /// Operation not valid in the current server state
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// No subscriber or handler matches an inbound unit of work
    #[error("not found: {0}")]
    NotFound(String),

    /// Invoked user code failed
    #[error("handler failed: {0}")]
    Handler(#[from] HandlerError),

    /// Payload could not be encoded or decoded
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Transport plugin failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Broker plugin failure
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Registry plugin failure
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl Error {
    /// Transport status this error is reported with
    pub fn status(&self) -> Status {
        match self {
            Error::NotFound(_) => Status::NotFound,
            Error::Codec(_) => Status::BadRequest,
            Error::Handler(e) => e.status,
            Error::Broker(_) | Error::Registry(_) | Error::Transport(_) => Status::Unavailable,
            Error::Lifecycle(LifecycleError::Stopped) => Status::Unavailable,
            Error::Configuration(_)
            | Error::RegistrationConflict(_)
            | Error::InvalidEntity(_)
            | Error::Lifecycle(_) => Status::InternalError,
        }
    }

    /// Whether this is a duplicate topic or handler name
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::RegistrationConflict(_))
    }
}

/// What a registration collided with
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Conflict {
    /// Another subscriber already owns the topic
    #[error("topic '{0}' already has a subscriber")]
    Topic(String),

    /// Another handler already uses the name
    #[error("handler '{0}' is already registered")]
    HandlerName(String),
}

/// Lifecycle violations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LifecycleError {
    /// Options can no longer change, or start was called twice
    #[error("server already started")]
    AlreadyStarted,

    /// Stop was called on a server that never started
    #[error("server not started")]
    NotStarted,

    /// A stopped server cannot be reused
    #[error("server stopped")]
    Stopped,
}

impl LifecycleError {
    /// Error for an operation that is only valid before start
    pub(crate) fn before_start(state: ServerState) -> Self {
        match state {
            ServerState::Stopped => LifecycleError::Stopped,
            _ => LifecycleError::AlreadyStarted,
        }
    }
}

/// Structured failure returned by user handler code
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{status}: {detail}")]
pub struct HandlerError {
    /// Status reported to the caller
    pub status: Status,
    /// Human-readable detail
    pub detail: String,
}

impl HandlerError {
    /// Create an error with an explicit status
    pub fn new(status: Status, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    /// The request was malformed
    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(Status::BadRequest, detail)
    }

    /// The handler could not find what was asked for
    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(Status::NotFound, detail)
    }

    /// The handler ran past its deadline
    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::new(Status::Timeout, detail)
    }

    /// Anything else
    pub fn internal(detail: impl std::fmt::Display) -> Self {
        Self::new(Status::InternalError, detail.to_string())
    }
}

/// Error payload written into failed transport responses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Service that produced the error
    pub id: String,
    /// Numeric status code
    pub code: u16,
    /// Error detail
    pub detail: String,
    /// Status text
    pub status: String,
}

impl ErrorBody {
    /// Build the payload for an error raised while serving `id`
    pub fn new(id: impl Into<String>, error: &Error) -> Self {
        let status = error.status();
        let detail = match error {
            Error::Handler(e) => e.detail.clone(),
            other => other.to_string(),
        };

        Self {
            id: id.into(),
            code: status.code(),
            detail,
            status: status.as_str().to_string(),
        }
    }
}
