//! Request/response transport contract
//!
//! A transport binds a [`Listener`] that yields inbound [`Exchange`]s: a
//! [`Request`] paired with the [`Responder`] that carries the reply back to the
//! caller. Callers of a service use [`Transport::dial`] to obtain a [`Client`];
//! the runtime itself only listens.

mod message;

use async_trait::async_trait;
use thiserror::Error;

pub use message::{Request, Response, Status};

/// Error type for transport plugins
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Binding the listener failed
    #[error("listen on '{address}' failed: {reason}")]
    Listen {
        /// Requested address
        address: String,
        /// Backend reason
        reason: String,
    },

    /// Dialing a peer failed
    #[error("dial '{address}' failed: {reason}")]
    Dial {
        /// Peer address
        address: String,
        /// Backend reason
        reason: String,
    },

    /// The listener or connection is closed
    #[error("transport closed")]
    Closed,

    /// Any other I/O failure
    #[error("transport error: {0}")]
    Io(String),
}

/// Sends the reply for one request
#[async_trait]
pub trait Responder: Send {
    /// Deliver the response; consumes the responder
    async fn respond(self: Box<Self>, response: Response) -> Result<(), TransportError>;
}

/// One inbound request and the way to answer it
pub struct Exchange {
    /// The request
    pub request: Request,
    /// Where the response goes
    pub responder: Box<dyn Responder>,
}

impl Exchange {
    /// Pair a request with its responder
    pub fn new(request: Request, responder: Box<dyn Responder>) -> Self {
        Self { request, responder }
    }
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

/// Bound listener
#[async_trait]
pub trait Listener: Send + Sync {
    /// Address the listener actually bound
    fn addr(&self) -> String;

    /// Next inbound exchange; `None` once the listener is closed
    async fn accept(&self) -> Result<Option<Exchange>, TransportError>;

    /// Stop accepting
    async fn close(&self) -> Result<(), TransportError>;
}

/// Outbound connection used by callers of a service
#[async_trait]
pub trait Client: Send + Sync {
    /// Send a request and wait for the reply
    async fn call(&self, request: Request) -> Result<Response, TransportError>;

    /// Close the connection
    async fn close(&self) -> Result<(), TransportError>;
}

/// Network transport backend
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short backend name, published in node metadata
    fn name(&self) -> &str;

    /// Bind a listener
    async fn listen(&self, address: &str) -> Result<Box<dyn Listener>, TransportError>;

    /// Connect to a listener
    async fn dial(&self, address: &str) -> Result<Box<dyn Client>, TransportError>;
}
