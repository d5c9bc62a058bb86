//! Dispatch context
//!
//! Context passed to every handler invocation. It carries everything that is
//! specific to one unit of work, so the dispatcher itself stays stateless.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::broker::{BrokerError, Event};

/// Context passed to subscriber and method handlers
///
/// Cheap to clone. The cancellation token is a child of the server's lifecycle
/// token: it fires when the server stops, and handlers are expected to observe
/// it (cooperative cancellation).
#[derive(Clone)]
pub struct Context {
    /// Service the work was addressed to
    pub service: String,

    /// Topic or `Handler.Method` being served
    pub target: String,

    metadata: Arc<HashMap<String, String>>,
    token: CancellationToken,
    deadline: Option<Instant>,
    event: Option<Arc<dyn Event>>,
}

impl Context {
    /// Create a context
    pub fn new(
        service: impl Into<String>,
        target: impl Into<String>,
        metadata: HashMap<String, String>,
        token: CancellationToken,
    ) -> Self {
        Self {
            service: service.into(),
            target: target.into(),
            metadata: Arc::new(metadata),
            token,
            deadline: None,
            event: None,
        }
    }

    /// Set a deadline relative to now
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// Attach the broker event being processed
    pub fn with_event(mut self, event: Arc<dyn Event>) -> Self {
        self.event = Some(event);
        self
    }

    /// All metadata
    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// One metadata value
    pub fn get(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Deadline, if the caller set one
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Whether the server is shutting down
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when the server starts shutting down
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Cancellation token for passing to other tasks
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Broker event being processed (subscriber invocations only)
    pub fn event(&self) -> Option<&Arc<dyn Event>> {
        self.event.as_ref()
    }

    /// Ack the current event by hand
    ///
    /// Needed when the subscriber runs with `auto_ack` disabled.
    pub async fn ack(&self) -> Result<(), BrokerError> {
        match &self.event {
            Some(event) => event.ack().await,
            None => Err(BrokerError::Other("no event in context".into())),
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("service", &self.service)
            .field("target", &self.target)
            .field("metadata", &self.metadata)
            .field("cancelled", &self.token.is_cancelled())
            .field("deadline", &self.deadline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(token: CancellationToken) -> Context {
        let mut metadata = HashMap::new();
        metadata.insert("trace-id".to_string(), "abc".to_string());
        Context::new("greeter", "Greeter.Hello", metadata, token)
    }

    #[test]
    fn test_metadata() {
        let ctx = ctx(CancellationToken::new());

        assert_eq!(ctx.get("trace-id"), Some("abc"));
        assert_eq!(ctx.get("missing"), None);
        assert!(ctx.deadline().is_none());
    }

    #[tokio::test]
    async fn test_cancellation_follows_parent() {
        let parent = CancellationToken::new();
        let ctx = ctx(parent.child_token());

        assert!(!ctx.is_cancelled());
        parent.cancel();
        ctx.cancelled().await;
        assert!(ctx.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline() {
        let ctx = ctx(CancellationToken::new()).with_timeout(Duration::from_secs(2));

        assert_eq!(ctx.remaining(), Some(Duration::from_secs(2)));
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
    }

    #[tokio::test]
    async fn test_ack_without_event() {
        let ctx = ctx(CancellationToken::new());
        assert!(ctx.ack().await.is_err());
    }
}
