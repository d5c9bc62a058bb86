//! Pub/sub broker contract
//!
//! A broker delivers [`Message`]s published on a topic to every subscription
//! on that topic. Subscriptions sharing a queue group split the stream between
//! them instead of each receiving a copy.
//!
//! Delivery hands the subscriber an [`Event`]; whoever processes it decides
//! whether to [`ack`](Event::ack) or [`nack`](Event::nack). The runtime plugs
//! its dispatcher in as the [`EventHandler`] of every subscription it makes.

mod message;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub use message::{Message, CONTENT_TYPE_HEADER};

/// Error type for broker plugins
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// Not connected, or the connection dropped
    #[error("broker not connected")]
    NotConnected,

    /// Connecting failed
    #[error("broker connect failed: {0}")]
    Connect(String),

    /// Subscribing to a topic failed
    #[error("subscribe to '{topic}' failed: {reason}")]
    Subscribe {
        /// Topic the subscription was for
        topic: String,
        /// Backend reason
        reason: String,
    },

    /// Publishing failed
    #[error("publish to '{topic}' failed: {reason}")]
    Publish {
        /// Destination topic
        topic: String,
        /// Backend reason
        reason: String,
    },

    /// Any other backend failure
    #[error("broker error: {0}")]
    Other(String),
}

/// Options for a subscription
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Queue group; empty means every subscription gets every message
    pub queue: String,
    /// Whether the consumer acks automatically after successful handling
    pub auto_ack: bool,
}

impl SubscribeOptions {
    /// Subscribe as part of a queue group
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Set the auto-ack policy
    pub fn auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }
}

/// One delivered message
#[async_trait]
pub trait Event: Send + Sync {
    /// Topic the message was published on
    fn topic(&self) -> &str;

    /// The message
    fn message(&self) -> &Message;

    /// Confirm processing
    async fn ack(&self) -> Result<(), BrokerError>;

    /// Reject the message (redelivery is up to the broker)
    async fn nack(&self) -> Result<(), BrokerError>;
}

impl std::fmt::Debug for dyn Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("topic", &self.topic())
            .field("message", self.message())
            .finish()
    }
}

/// Callback invoked by the broker for every delivery
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Take ownership of one delivery
    async fn handle(&self, event: Box<dyn Event>) -> Result<(), BrokerError>;
}

/// Handle to an active subscription
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Subscribed topic
    fn topic(&self) -> &str;

    /// Queue group, empty if none
    fn queue(&self) -> &str {
        ""
    }

    /// Stop receiving messages
    async fn unsubscribe(&self) -> Result<(), BrokerError>;
}

/// Pub/sub backend
#[async_trait]
pub trait Broker: Send + Sync {
    /// Short backend name, published in node metadata
    fn name(&self) -> &str;

    /// Broker address, if it has one
    fn address(&self) -> String {
        String::new()
    }

    /// Open the connection
    async fn connect(&self) -> Result<(), BrokerError>;

    /// Close the connection
    async fn disconnect(&self) -> Result<(), BrokerError>;

    /// Whether the connection is currently usable
    ///
    /// Backends that cannot tell keep the default.
    fn is_connected(&self) -> bool {
        true
    }

    /// Publish a message on a topic
    async fn publish(&self, topic: &str, message: Message) -> Result<(), BrokerError>;

    /// Subscribe `handler` to a topic
    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn EventHandler>,
        options: SubscribeOptions,
    ) -> Result<Box<dyn Subscription>, BrokerError>;
}
