//! In-memory registry

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::registry::{
    ChannelWatcher, EventKind, RegisterOptions, Registry, RegistryError, RegistryEvent, Service,
    Watcher,
};

/// Watch channel capacity
const EVENT_CAPACITY: usize = 64;

/// Registry that keeps services in memory
///
/// Nodes registered with a TTL disappear from lookups once it lapses without
/// a refresh. Uses tokio's clock, so paused-time tests control expiry.
#[derive(Clone)]
pub struct MockRegistry {
    state: Arc<Mutex<State>>,
    events: broadcast::Sender<RegistryEvent>,
}

#[derive(Default)]
struct State {
    /// Keyed by (name, version)
    services: HashMap<(String, String), Service>,
    /// Keyed by node id
    expiry: HashMap<String, Instant>,
    registrations: Vec<(Service, Duration)>,
    register_attempts: usize,
    deregistrations: Vec<Service>,
    fail_register: usize,
}

impl State {
    fn live(&self, service: &Service) -> Option<Service> {
        let now = Instant::now();
        let mut live = service.clone();
        live.nodes
            .retain(|n| self.expiry.get(&n.id).map_or(true, |at| *at > now));
        (!live.nodes.is_empty()).then_some(live)
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Default for MockRegistry {
    fn default() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(State::default())),
            events,
        }
    }
}

impl MockRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` register calls
    pub fn fail_register(&self, times: usize) {
        lock(&self.state).fail_register = times;
    }

    /// Successful registrations with the TTL each one carried
    pub fn registrations(&self) -> Vec<(Service, Duration)> {
        lock(&self.state).registrations.clone()
    }

    /// Register calls, failed ones included
    pub fn register_attempts(&self) -> usize {
        lock(&self.state).register_attempts
    }

    /// Every deregistered descriptor
    pub fn deregistrations(&self) -> Vec<Service> {
        lock(&self.state).deregistrations.clone()
    }

    fn notify(&self, kind: EventKind, service: Service) {
        // No watchers is fine
        let _ = self.events.send(RegistryEvent::new(kind, service));
    }
}

#[async_trait]
impl Registry for MockRegistry {
    fn name(&self) -> &str {
        "mock"
    }

    async fn register(
        &self,
        service: &Service,
        options: &RegisterOptions,
    ) -> Result<(), RegistryError> {
        let (kind, merged) = {
            let mut state = lock(&self.state);
            state.register_attempts += 1;
            if state.fail_register > 0 {
                state.fail_register -= 1;
                return Err(RegistryError::Unavailable("injected failure".into()));
            }

            for node in &service.nodes {
                if options.ttl.is_zero() {
                    state.expiry.remove(&node.id);
                } else {
                    state.expiry.insert(node.id.clone(), Instant::now() + options.ttl);
                }
            }

            let key = (service.name.clone(), service.version.clone());
            let (kind, merged) = match state.services.get(&key) {
                Some(existing) => {
                    let mut merged = service.clone();
                    for node in &existing.nodes {
                        if merged.node(&node.id).is_none() {
                            merged.nodes.push(node.clone());
                        }
                    }
                    (EventKind::Update, merged)
                }
                None => (EventKind::Create, service.clone()),
            };

            state.services.insert(key, merged.clone());
            state.registrations.push((service.clone(), options.ttl));
            (kind, merged)
        };

        self.notify(kind, merged);
        Ok(())
    }

    async fn deregister(&self, service: &Service) -> Result<(), RegistryError> {
        {
            let mut state = lock(&self.state);
            state.deregistrations.push(service.clone());

            let key = (service.name.clone(), service.version.clone());
            if let Some(existing) = state.services.get_mut(&key) {
                existing.nodes.retain(|n| service.node(&n.id).is_none());
                if existing.nodes.is_empty() {
                    state.services.remove(&key);
                }
            }
            for node in &service.nodes {
                state.expiry.remove(&node.id);
            }
        }

        self.notify(EventKind::Delete, service.clone());
        Ok(())
    }

    async fn get_service(&self, name: &str) -> Result<Vec<Service>, RegistryError> {
        let state = lock(&self.state);
        let mut found: Vec<Service> = state
            .services
            .values()
            .filter(|s| s.name == name)
            .filter_map(|s| state.live(s))
            .collect();
        found.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(found)
    }

    async fn list_services(&self) -> Result<Vec<Service>, RegistryError> {
        let state = lock(&self.state);
        let mut all: Vec<Service> = state
            .services
            .values()
            .filter_map(|s| state.live(s))
            .collect();
        all.sort_by(|a, b| (&a.name, &a.version).cmp(&(&b.name, &b.version)));
        Ok(all)
    }

    async fn watch(&self, service: Option<&str>) -> Result<Box<dyn Watcher>, RegistryError> {
        let rx = self.events.subscribe();
        let watcher: Box<dyn Watcher> = match service {
            Some(name) => Box::new(ChannelWatcher::filtered(rx, name)),
            None => Box::new(ChannelWatcher::new(rx)),
        };
        Ok(watcher)
    }
}
