//! Route table
//!
//! Maps topics to subscribers and handler names to handlers. Writers build a
//! new table and swap it in; dispatch works on an `Arc` snapshot, so a lookup
//! never blocks a registration and a registration never tears a lookup.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::{Conflict, Error, Result};

use super::handler::Handler;
use super::subscriber::Subscriber;

/// Immutable snapshot of every registered route
#[derive(Default, Clone)]
pub struct RouteTable {
    subscribers: BTreeMap<String, Arc<dyn Subscriber>>,
    handlers: BTreeMap<String, Arc<dyn Handler>>,
}

impl RouteTable {
    /// Subscriber owning a topic
    pub fn subscriber(&self, topic: &str) -> Option<&Arc<dyn Subscriber>> {
        self.subscribers.get(topic)
    }

    /// Handler registered under a name
    pub fn handler(&self, name: &str) -> Option<&Arc<dyn Handler>> {
        self.handlers.get(name)
    }

    /// Subscribers ordered by topic
    pub fn subscribers(&self) -> impl Iterator<Item = &Arc<dyn Subscriber>> {
        self.subscribers.values()
    }

    /// Handlers ordered by name
    pub fn handlers(&self) -> impl Iterator<Item = &Arc<dyn Handler>> {
        self.handlers.values()
    }

    /// Number of subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Number of handlers
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

/// Shared, swappable route table
#[derive(Default)]
pub struct Routes {
    table: RwLock<Arc<RouteTable>>,
}

impl Routes {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot
    pub async fn snapshot(&self) -> Arc<RouteTable> {
        Arc::clone(&*self.table.read().await)
    }

    /// Add a subscriber
    ///
    /// Topics are exclusive: a second subscriber for the same topic is a
    /// conflict and leaves the table untouched.
    pub async fn add_subscriber(&self, subscriber: Arc<dyn Subscriber>) -> Result<()> {
        let topic = subscriber.topic().to_string();
        if topic.trim().is_empty() {
            return Err(Error::InvalidEntity("subscriber topic is empty".into()));
        }

        let mut table = self.table.write().await;
        if table.subscribers.contains_key(&topic) {
            return Err(Conflict::Topic(topic).into());
        }

        let mut next = RouteTable::clone(&table);
        next.subscribers.insert(topic.clone(), subscriber);
        *table = Arc::new(next);

        tracing::debug!(topic = %topic, "Subscriber route added");
        Ok(())
    }

    /// Add a handler
    pub async fn add_handler(&self, handler: Arc<dyn Handler>) -> Result<()> {
        let name = handler.name().to_string();
        if name.trim().is_empty() {
            return Err(Error::InvalidEntity("handler name is empty".into()));
        }
        if handler.endpoints().is_empty() {
            return Err(Error::InvalidEntity(format!(
                "handler '{}' exposes no methods",
                name
            )));
        }

        let mut table = self.table.write().await;
        if table.handlers.contains_key(&name) {
            return Err(Conflict::HandlerName(name).into());
        }

        let mut next = RouteTable::clone(&table);
        next.handlers.insert(name.clone(), handler);
        *table = Arc::new(next);

        tracing::debug!(handler = %name, "Handler route added");
        Ok(())
    }

    /// Remove the subscriber for a topic, returning it if present
    pub async fn remove_subscriber(&self, topic: &str) -> Option<Arc<dyn Subscriber>> {
        let mut table = self.table.write().await;
        if !table.subscribers.contains_key(topic) {
            return None;
        }

        let mut next = RouteTable::clone(&table);
        let removed = next.subscribers.remove(topic);
        *table = Arc::new(next);
        removed
    }

    /// Remove a handler by name, returning it if present
    pub async fn remove_handler(&self, name: &str) -> Option<Arc<dyn Handler>> {
        let mut table = self.table.write().await;
        if !table.handlers.contains_key(name) {
            return None;
        }

        let mut next = RouteTable::clone(&table);
        let removed = next.handlers.remove(name);
        *table = Arc::new(next);
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use crate::server::handler::RpcHandler;
    use crate::server::options::SubscriberOptions;
    use crate::server::subscriber::{subscriber_fn, TopicSubscriber};
    use serde_json::Value;
    use tokio_test::{assert_err, assert_ok};

    fn sub(topic: &str) -> Arc<dyn Subscriber> {
        Arc::new(TopicSubscriber::new(
            topic,
            subscriber_fn(|_ctx, _msg: Value| async { Ok(()) }),
            SubscriberOptions::default(),
        ))
    }

    fn greeter(name: &str) -> Arc<dyn Handler> {
        Arc::new(
            RpcHandler::builder(name)
                .method("Hello", |_ctx, req: Value| async move {
                    Ok::<_, HandlerError>(req)
                })
                .build(),
        )
    }

    #[tokio::test]
    async fn test_add_and_lookup() {
        let routes = Routes::new();
        assert_ok!(routes.add_subscriber(sub("orders.created")).await);
        assert_ok!(routes.add_handler(greeter("Greeter")).await);

        let table = routes.snapshot().await;
        assert!(table.subscriber("orders.created").is_some());
        assert!(table.handler("Greeter").is_some());
        assert!(table.handler("greeter").is_none());
        assert_eq!(table.subscriber_count(), 1);
        assert_eq!(table.handler_count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_topic() {
        let routes = Routes::new();
        routes.add_subscriber(sub("orders.created")).await.unwrap();

        let err = routes.add_subscriber(sub("orders.created")).await.unwrap_err();
        assert!(matches!(
            err,
            Error::RegistrationConflict(Conflict::Topic(ref t)) if t == "orders.created"
        ));
        assert_eq!(routes.snapshot().await.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_handler() {
        let routes = Routes::new();
        routes.add_handler(greeter("Greeter")).await.unwrap();

        let err = assert_err!(routes.add_handler(greeter("Greeter")).await);
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_invalid_entities() {
        let routes = Routes::new();

        let err = routes.add_subscriber(sub("")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidEntity(_)));

        let empty = Arc::new(RpcHandler::builder("Empty").build());
        let err = routes.add_handler(empty).await.unwrap_err();
        assert!(matches!(err, Error::InvalidEntity(_)));
    }

    #[tokio::test]
    async fn test_snapshot_is_stable() {
        let routes = Routes::new();
        routes.add_subscriber(sub("a")).await.unwrap();

        let before = routes.snapshot().await;
        routes.add_subscriber(sub("b")).await.unwrap();
        assert!(routes.remove_subscriber("a").await.is_some());

        assert_eq!(before.subscriber_count(), 1);
        assert!(before.subscriber("a").is_some());

        let after = routes.snapshot().await;
        let topics: Vec<&str> = after.subscribers().map(|s| s.topic()).collect();
        assert_eq!(topics, vec!["b"]);
    }

    #[tokio::test]
    async fn test_remove_missing() {
        let routes = Routes::new();
        assert!(routes.remove_subscriber("nope").await.is_none());
        assert!(routes.remove_handler("Nope").await.is_none());
    }
}
