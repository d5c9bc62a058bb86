//! In-memory broker

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::broker::{
    Broker, BrokerError, Event, EventHandler, Message, SubscribeOptions, Subscription,
};

/// Broker that delivers in-process
///
/// `publish` returns after every handler it delivered to has returned, so
/// tests can assert on acks right after publishing. Messages published on a
/// topic nobody subscribes to are kept and handed to the first subscription.
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    connected: bool,
    connect_calls: usize,
    disconnect_calls: usize,
    fail_connect: usize,
    fail_subscribe: HashSet<String>,
    next_id: u64,
    subscriptions: Vec<Entry>,
    subscribe_calls: Vec<(String, String)>,
    backlog: HashMap<String, VecDeque<Message>>,
    published: Vec<(String, Message)>,
    acks: Vec<String>,
    nacks: Vec<String>,
    round_robin: HashMap<(String, String), usize>,
}

struct Entry {
    id: u64,
    topic: String,
    queue: String,
    handler: Arc<dyn EventHandler>,
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockBroker {
    /// Create a disconnected broker
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` connect calls
    pub fn fail_connect(&self, times: usize) {
        lock(&self.state).fail_connect = times;
    }

    /// Fail every subscribe call for `topic`
    pub fn fail_subscribe_on(&self, topic: impl Into<String>) {
        lock(&self.state).fail_subscribe.insert(topic.into());
    }

    /// Simulate losing the connection; every subscription dies with it
    pub fn drop_connection(&self) {
        let mut state = lock(&self.state);
        state.connected = false;
        state.subscriptions.clear();
    }

    /// Number of connect calls so far
    pub fn connect_calls(&self) -> usize {
        lock(&self.state).connect_calls
    }

    /// Number of disconnect calls so far
    pub fn disconnect_calls(&self) -> usize {
        lock(&self.state).disconnect_calls
    }

    /// Live subscriptions
    pub fn active_subscriptions(&self) -> usize {
        lock(&self.state).subscriptions.len()
    }

    /// Every subscribe call as `(topic, queue)`, including failed ones
    pub fn subscribe_calls(&self) -> Vec<(String, String)> {
        lock(&self.state).subscribe_calls.clone()
    }

    /// Every published message
    pub fn published(&self) -> Vec<(String, Message)> {
        lock(&self.state).published.clone()
    }

    /// Topic of every acked event, in ack order
    pub fn acks(&self) -> Vec<String> {
        lock(&self.state).acks.clone()
    }

    /// Topic of every nacked event, in nack order
    pub fn nacks(&self) -> Vec<String> {
        lock(&self.state).nacks.clone()
    }

    /// Messages waiting for a first subscriber on `topic`
    pub fn backlog(&self, topic: &str) -> usize {
        lock(&self.state).backlog.get(topic).map_or(0, VecDeque::len)
    }

    fn event(&self, topic: &str, message: Message) -> Box<dyn Event> {
        Box::new(MockEvent {
            topic: topic.to_string(),
            message,
            state: Arc::clone(&self.state),
        })
    }

    /// Pick receivers: every plain subscription, one per queue group
    fn receivers(state: &mut State, topic: &str) -> Vec<Arc<dyn EventHandler>> {
        let mut plain = Vec::new();
        let mut groups: Vec<(String, Vec<Arc<dyn EventHandler>>)> = Vec::new();

        for entry in state.subscriptions.iter().filter(|e| e.topic == topic) {
            if entry.queue.is_empty() {
                plain.push(Arc::clone(&entry.handler));
            } else if let Some((_, members)) = groups.iter_mut().find(|(q, _)| *q == entry.queue) {
                members.push(Arc::clone(&entry.handler));
            } else {
                groups.push((entry.queue.clone(), vec![Arc::clone(&entry.handler)]));
            }
        }

        for (queue, members) in groups {
            let next = state
                .round_robin
                .entry((topic.to_string(), queue))
                .or_insert(0);
            plain.push(Arc::clone(&members[*next % members.len()]));
            *next += 1;
        }
        plain
    }
}

#[async_trait]
impl Broker for MockBroker {
    fn name(&self) -> &str {
        "mock"
    }

    fn address(&self) -> String {
        "mock://broker".to_string()
    }

    async fn connect(&self) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        state.connect_calls += 1;
        if state.fail_connect > 0 {
            state.fail_connect -= 1;
            return Err(BrokerError::Connect("injected failure".into()));
        }
        state.connected = true;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        state.disconnect_calls += 1;
        state.connected = false;
        state.subscriptions.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    async fn publish(&self, topic: &str, message: Message) -> Result<(), BrokerError> {
        let receivers = {
            let mut state = lock(&self.state);
            if !state.connected {
                return Err(BrokerError::NotConnected);
            }
            state.published.push((topic.to_string(), message.clone()));

            let receivers = Self::receivers(&mut state, topic);
            if receivers.is_empty() {
                state
                    .backlog
                    .entry(topic.to_string())
                    .or_default()
                    .push_back(message.clone());
            }
            receivers
        };

        for handler in receivers {
            if let Err(e) = handler.handle(self.event(topic, message.clone())).await {
                tracing::debug!(topic = %topic, error = %e, "Mock delivery failed");
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn EventHandler>,
        options: SubscribeOptions,
    ) -> Result<Box<dyn Subscription>, BrokerError> {
        let (id, backlog) = {
            let mut state = lock(&self.state);
            state
                .subscribe_calls
                .push((topic.to_string(), options.queue.clone()));

            if !state.connected {
                return Err(BrokerError::NotConnected);
            }
            if state.fail_subscribe.contains(topic) {
                return Err(BrokerError::Subscribe {
                    topic: topic.to_string(),
                    reason: "injected failure".into(),
                });
            }

            state.next_id += 1;
            let id = state.next_id;
            state.subscriptions.push(Entry {
                id,
                topic: topic.to_string(),
                queue: options.queue.clone(),
                handler: Arc::clone(&handler),
            });
            (id, state.backlog.remove(topic).unwrap_or_default())
        };

        for message in backlog {
            if let Err(e) = handler.handle(self.event(topic, message)).await {
                tracing::debug!(topic = %topic, error = %e, "Mock backlog delivery failed");
            }
        }

        Ok(Box::new(MockSubscription {
            id,
            topic: topic.to_string(),
            queue: options.queue,
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockEvent {
    topic: String,
    message: Message,
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl Event for MockEvent {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn message(&self) -> &Message {
        &self.message
    }

    async fn ack(&self) -> Result<(), BrokerError> {
        lock(&self.state).acks.push(self.topic.clone());
        Ok(())
    }

    async fn nack(&self) -> Result<(), BrokerError> {
        lock(&self.state).nacks.push(self.topic.clone());
        Ok(())
    }
}

struct MockSubscription {
    id: u64,
    topic: String,
    queue: String,
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl Subscription for MockSubscription {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn queue(&self) -> &str {
        &self.queue
    }

    async fn unsubscribe(&self) -> Result<(), BrokerError> {
        lock(&self.state).subscriptions.retain(|e| e.id != self.id);
        Ok(())
    }
}
