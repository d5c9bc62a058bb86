//! Recording subscriber

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::HandlerError;
use crate::registry::Endpoint;
use crate::server::{Context, MessageHandler, SubscriberOptions, Subscriber};

/// Subscriber that records every payload it receives
///
/// Clones share the recording, so a test can keep one clone and register
/// the other.
#[derive(Clone)]
pub struct MockSubscriber {
    topic: String,
    endpoints: Vec<Endpoint>,
    options: SubscriberOptions,
    recorder: Arc<Recorder>,
}

#[derive(Default)]
struct Recorder {
    payloads: Mutex<Vec<Value>>,
    failure: Mutex<Option<HandlerError>>,
}

impl Recorder {
    fn payloads(&self) -> MutexGuard<'_, Vec<Value>> {
        self.payloads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn failure(&self) -> MutexGuard<'_, Option<HandlerError>> {
        self.failure.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MockSubscriber {
    /// Subscribe to `topic` with default options
    pub fn new(topic: impl Into<String>) -> Self {
        Self::with_options(topic, SubscriberOptions::default())
    }

    /// Subscribe to `topic` with the given options
    pub fn with_options(topic: impl Into<String>, options: SubscriberOptions) -> Self {
        let topic = topic.into();
        Self {
            endpoints: vec![Endpoint::new(topic.clone())
                .meta("topic", topic.clone())
                .meta("subscriber", "true")],
            topic,
            options,
            recorder: Arc::new(Recorder::default()),
        }
    }

    /// Fail every delivery with `error` (still recording the payload)
    pub fn fail_with(&self, error: HandlerError) {
        *self.recorder.failure() = Some(error);
    }

    /// Payloads received so far
    pub fn payloads(&self) -> Vec<Value> {
        self.recorder.payloads().clone()
    }

    /// Number of deliveries so far
    pub fn count(&self) -> usize {
        self.recorder.payloads().len()
    }
}

impl Subscriber for MockSubscriber {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn handler(&self) -> Arc<dyn MessageHandler> {
        Arc::clone(&self.recorder) as Arc<dyn MessageHandler>
    }

    fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    fn options(&self) -> &SubscriberOptions {
        &self.options
    }
}

#[async_trait]
impl MessageHandler for Recorder {
    async fn handle(&self, _ctx: Context, payload: Value) -> Result<(), HandlerError> {
        self.payloads().push(payload);
        match self.failure().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}
