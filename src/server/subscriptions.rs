//! Active broker subscriptions
//!
//! One broker subscription per registered subscriber, keyed by topic. Every
//! subscription uses the same [`EventHandler`], the dispatcher adapter.
//!
//! Every operation holds the map lock across its broker calls, so hot
//! registration, unsubscribe and the supervisor's resync never interleave.
//! A topic is subscribed at most once.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::broker::{Broker, EventHandler, SubscribeOptions, Subscription};
use crate::error::Result;

use super::routes::{RouteTable, Routes};
use super::subscriber::Subscriber;

type Active = BTreeMap<String, Box<dyn Subscription>>;

pub(crate) struct Subscriptions {
    broker: Arc<dyn Broker>,
    handler: Arc<dyn EventHandler>,
    active: Mutex<Active>,
}

impl Subscriptions {
    pub(crate) fn new(broker: Arc<dyn Broker>, handler: Arc<dyn EventHandler>) -> Self {
        Self {
            broker,
            handler,
            active: Mutex::new(BTreeMap::new()),
        }
    }

    /// Subscribe one subscriber on the broker; a no-op if already subscribed
    pub(crate) async fn subscribe(&self, subscriber: &dyn Subscriber) -> Result<()> {
        let mut active = self.active.lock().await;
        self.subscribe_locked(&mut active, subscriber).await
    }

    async fn subscribe_locked(
        &self,
        active: &mut Active,
        subscriber: &dyn Subscriber,
    ) -> Result<()> {
        let topic = subscriber.topic();
        if active.contains_key(topic) {
            tracing::debug!(topic = %topic, "Already subscribed");
            return Ok(());
        }

        let options = SubscribeOptions::default()
            .queue(subscriber.options().queue.clone())
            .auto_ack(subscriber.options().auto_ack);
        let subscription = self
            .broker
            .subscribe(topic, Arc::clone(&self.handler), options)
            .await?;

        tracing::info!(
            topic = %topic,
            queue = %subscription.queue(),
            "Subscribed"
        );
        active.insert(topic.to_string(), subscription);
        Ok(())
    }

    /// Subscribe every subscriber in the table
    ///
    /// All or nothing: if one subscription fails, those made by this call are
    /// unsubscribed again before the error is returned.
    pub(crate) async fn subscribe_all(&self, table: &RouteTable) -> Result<()> {
        let mut active = self.active.lock().await;
        let mut made = Vec::new();

        for subscriber in table.subscribers() {
            let topic = subscriber.topic();
            if active.contains_key(topic) {
                continue;
            }
            if let Err(e) = self.subscribe_locked(&mut active, subscriber.as_ref()).await {
                tracing::error!(topic = %topic, error = %e, "Subscribe failed, rolling back");
                for topic in made {
                    if let Some(subscription) = active.remove(topic) {
                        release(topic, subscription).await;
                    }
                }
                return Err(e);
            }
            made.push(topic);
        }
        Ok(())
    }

    /// Bring the subscriptions in line with the current routes
    ///
    /// Subscribes routed topics that have no live subscription and drops
    /// subscriptions whose route is gone. The route snapshot is taken under
    /// the lock, so it is never older than a concurrent registration.
    pub(crate) async fn resync(&self, routes: &Routes) {
        let mut active = self.active.lock().await;
        let table = routes.snapshot().await;

        let orphaned: Vec<String> = active
            .keys()
            .filter(|topic| table.subscriber(topic).is_none())
            .cloned()
            .collect();
        for topic in orphaned {
            if let Some(subscription) = active.remove(&topic) {
                tracing::debug!(topic = %topic, "Dropping subscription without a route");
                release(&topic, subscription).await;
            }
        }

        for subscriber in table.subscribers() {
            if active.contains_key(subscriber.topic()) {
                continue;
            }
            if let Err(e) = self.subscribe_locked(&mut active, subscriber.as_ref()).await {
                tracing::warn!(topic = %subscriber.topic(), error = %e, "Resubscribe failed");
            }
        }
    }

    /// Unsubscribe one topic; errors are logged
    ///
    /// Returns whether the topic had a subscription.
    pub(crate) async fn unsubscribe(&self, topic: &str) -> bool {
        let mut active = self.active.lock().await;
        match active.remove(topic) {
            Some(subscription) => {
                release(topic, subscription).await;
                true
            }
            None => false,
        }
    }

    /// Unsubscribe everything; errors are logged
    pub(crate) async fn unsubscribe_all(&self) {
        let mut active = self.active.lock().await;
        for (topic, subscription) in std::mem::take(&mut *active) {
            release(&topic, subscription).await;
        }
    }

    /// Drop every handle without calling the broker
    ///
    /// Used after the connection was lost and the handles are dead.
    pub(crate) async fn forget_all(&self) {
        self.active.lock().await.clear();
    }

    pub(crate) async fn is_active(&self, topic: &str) -> bool {
        self.active.lock().await.contains_key(topic)
    }

    pub(crate) async fn len(&self) -> usize {
        self.active.lock().await.len()
    }
}

async fn release(topic: &str, subscription: Box<dyn Subscription>) {
    match subscription.unsubscribe().await {
        Ok(()) => tracing::debug!(topic = %topic, "Unsubscribed"),
        Err(e) => tracing::warn!(topic = %topic, error = %e, "Unsubscribe failed"),
    }
}
