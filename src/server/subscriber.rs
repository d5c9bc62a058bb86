//! Topic subscribers
//!
//! A subscriber binds a topic to a [`MessageHandler`]. Handlers receive the
//! decoded payload as a [`serde_json::Value`]; [`subscriber_fn`] wraps a typed
//! async closure so user code only ever sees its own message type.
//!
//! # Example
//!
//! ```ignore
//! use micro_rs::server::{subscriber_fn, SubscriberOptions};
//!
//! server
//!     .subscribe(
//!         "orders.created",
//!         subscriber_fn(|_ctx, order: Order| async move {
//!             tracing::info!(id = order.id, "order created");
//!             Ok(())
//!         }),
//!         SubscriberOptions::default().queue("billing"),
//!     )
//!     .await?;
//! ```

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::HandlerError;
use crate::registry::{Endpoint, Schema};

use super::context::Context;
use super::options::SubscriberOptions;

/// Processes decoded messages for a topic
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one decoded message
    async fn handle(&self, ctx: Context, payload: Value) -> Result<(), HandlerError>;

    /// Shape of the messages this handler expects
    fn message_schema(&self) -> Option<Schema> {
        None
    }
}

/// Wrapper that deserializes the payload before calling a typed closure
pub struct TypedSubscriber<F, T, Fut> {
    handler: F,
    _phantom: PhantomData<fn(T) -> Fut>,
}

/// Build a [`MessageHandler`] from `async |ctx, msg: T| -> Result<(), HandlerError>`
pub fn subscriber_fn<F, T, Fut>(handler: F) -> TypedSubscriber<F, T, Fut>
where
    F: Fn(Context, T) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    TypedSubscriber {
        handler,
        _phantom: PhantomData,
    }
}

#[async_trait]
impl<F, T, Fut> MessageHandler for TypedSubscriber<F, T, Fut>
where
    F: Fn(Context, T) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: Context, payload: Value) -> Result<(), HandlerError> {
        let message: T = serde_json::from_value(payload)
            .map_err(|e| HandlerError::bad_request(format!("invalid message: {e}")))?;
        (self.handler)(ctx, message).await
    }

    fn message_schema(&self) -> Option<Schema> {
        Some(Schema::of::<T>())
    }
}

/// Capabilities every subscriber exposes to the server
///
/// Production subscribers are [`TopicSubscriber`]s; tests can register any
/// other implementation and it goes through the same dispatch path.
pub trait Subscriber: Send + Sync {
    /// Topic this subscriber consumes
    fn topic(&self) -> &str;

    /// Handler invoked for every message
    fn handler(&self) -> Arc<dyn MessageHandler>;

    /// Endpoints published to the registry
    fn endpoints(&self) -> &[Endpoint];

    /// Options fixed at construction
    fn options(&self) -> &SubscriberOptions;
}

/// Standard subscriber binding a topic to a handler
pub struct TopicSubscriber {
    topic: String,
    handler: Arc<dyn MessageHandler>,
    endpoints: Vec<Endpoint>,
    options: SubscriberOptions,
}

impl TopicSubscriber {
    /// Bind `handler` to `topic`
    ///
    /// The endpoint is computed once here and never changes afterwards.
    pub fn new(
        topic: impl Into<String>,
        handler: impl MessageHandler + 'static,
        options: SubscriberOptions,
    ) -> Self {
        Self::from_arc(topic, Arc::new(handler), options)
    }

    /// Bind an already shared handler
    pub fn from_arc(
        topic: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
        options: SubscriberOptions,
    ) -> Self {
        let topic = topic.into();

        let mut endpoint = Endpoint::new(topic.clone())
            .meta("topic", topic.clone())
            .meta("subscriber", "true");
        if !options.queue.is_empty() {
            endpoint = endpoint.meta("queue", options.queue.clone());
        }
        if let Some(schema) = handler.message_schema() {
            endpoint = endpoint.request(schema);
        }

        Self {
            topic,
            handler,
            endpoints: vec![endpoint],
            options,
        }
    }
}

impl Subscriber for TopicSubscriber {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn handler(&self) -> Arc<dyn MessageHandler> {
        Arc::clone(&self.handler)
    }

    fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    fn options(&self) -> &SubscriberOptions {
        &self.options
    }
}
