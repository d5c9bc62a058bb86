//! Per-entity options
//!
//! Options are plain structs built from `Default` plus chained setters. Later
//! setters win. Nothing here validates; the server checks values when it uses
//! them. Once an entity is constructed its options never change.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::broker::Event;
use crate::codec::Codec;
use crate::error::Error;

/// Typed values attached to options by plugins
///
/// A plugin that needs its own knob defines a type and stores it here, so the
/// option structs never grow plugin-specific fields.
#[derive(Clone, Default)]
pub struct Extensions {
    values: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Extensions {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value, replacing any previous value of the same type
    pub fn insert<T: Any + Send + Sync>(&mut self, value: T) {
        self.values.insert(TypeId::of::<T>(), Arc::new(value));
    }

    /// Fetch a value by type
    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.values
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref::<T>())
    }

    /// Number of stored values
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl std::fmt::Debug for Extensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extensions")
            .field("len", &self.values.len())
            .finish()
    }
}

/// Called when a subscriber's handler fails
///
/// When set, the error handler decides the fate of the delivery (it may ack
/// or nack the event itself); the dispatcher no longer nacks on its behalf.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    /// React to a failed delivery
    async fn handle_error(&self, event: &dyn Event, error: &Error);
}

#[async_trait]
impl<F> ErrorHandler for F
where
    F: Fn(&dyn Event, &Error) + Send + Sync,
{
    async fn handle_error(&self, event: &dyn Event, error: &Error) {
        (self)(event, error)
    }
}

/// Subscriber options
#[derive(Clone)]
pub struct SubscriberOptions {
    /// Queue group (empty = every instance receives every message)
    pub queue: String,

    /// Ack automatically after the handler succeeds
    pub auto_ack: bool,

    /// Codec overriding content-type resolution
    pub codec: Option<Arc<dyn Codec>>,

    /// Failure callback replacing the default nack
    pub error_handler: Option<Arc<dyn ErrorHandler>>,

    /// Deliver one message at a time for this topic
    pub ordered: bool,

    /// Plugin-defined values
    pub extensions: Extensions,
}

impl Default for SubscriberOptions {
    fn default() -> Self {
        Self {
            queue: String::new(),
            auto_ack: true,
            codec: None,
            error_handler: None,
            ordered: false,
            extensions: Extensions::new(),
        }
    }
}

impl SubscriberOptions {
    /// Join a queue group
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Set the auto-ack policy
    pub fn auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    /// Decode every message with this codec
    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Install a failure callback
    pub fn error_handler(mut self, handler: impl ErrorHandler + 'static) -> Self {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Serialize deliveries on this topic
    pub fn ordered(mut self, ordered: bool) -> Self {
        self.ordered = ordered;
        self
    }

    /// Attach a plugin value
    pub fn extension<T: Any + Send + Sync>(mut self, value: T) -> Self {
        self.extensions.insert(value);
        self
    }
}

impl std::fmt::Debug for SubscriberOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberOptions")
            .field("queue", &self.queue)
            .field("auto_ack", &self.auto_ack)
            .field("codec", &self.codec)
            .field("error_handler", &self.error_handler.is_some())
            .field("ordered", &self.ordered)
            .field("extensions", &self.extensions)
            .finish()
    }
}

/// Handler options
#[derive(Debug, Clone, Default)]
pub struct HandlerOptions {
    /// Metadata added to every endpoint of the handler
    pub metadata: HashMap<String, String>,

    /// Plugin-defined values
    pub extensions: Extensions,
}

impl HandlerOptions {
    /// Add endpoint metadata
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Attach a plugin value
    pub fn extension<T: Any + Send + Sync>(mut self, value: T) -> Self {
        self.extensions.insert(value);
        self
    }
}
