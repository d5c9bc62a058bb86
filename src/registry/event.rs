//! Registry watch events

use std::time::SystemTime;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::error::RegistryError;
use super::service::Service;

/// What happened to a service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// First registration of a node
    Create,
    /// Re-registration of a known node
    Update,
    /// Node deregistered or expired
    Delete,
}

/// Change notification emitted by a registry
#[derive(Debug, Clone)]
pub struct RegistryEvent {
    /// Kind of change
    pub kind: EventKind,
    /// Service as it looked when the change happened
    pub service: Service,
    /// When the change happened
    pub timestamp: SystemTime,
}

impl RegistryEvent {
    /// Create an event stamped now
    pub fn new(kind: EventKind, service: Service) -> Self {
        Self {
            kind,
            service,
            timestamp: SystemTime::now(),
        }
    }
}

/// Stream of registry events
#[async_trait]
pub trait Watcher: Send {
    /// Next event, or `None` once the watcher is stopped
    async fn next(&mut self) -> Result<Option<RegistryEvent>, RegistryError>;

    /// Stop watching
    fn stop(&mut self);
}

/// Watcher over a `tokio::sync::broadcast` channel
///
/// Registry plugins that fan events out through a broadcast channel can hand
/// this to callers directly. Lagging receivers skip the missed events.
pub struct ChannelWatcher {
    rx: Option<broadcast::Receiver<RegistryEvent>>,
    service: Option<String>,
}

impl ChannelWatcher {
    /// Watch every service
    pub fn new(rx: broadcast::Receiver<RegistryEvent>) -> Self {
        Self {
            rx: Some(rx),
            service: None,
        }
    }

    /// Only yield events for one service name
    pub fn filtered(rx: broadcast::Receiver<RegistryEvent>, service: impl Into<String>) -> Self {
        Self {
            rx: Some(rx),
            service: Some(service.into()),
        }
    }

    fn wanted(&self, event: &RegistryEvent) -> bool {
        self.service
            .as_deref()
            .map_or(true, |name| event.service.name == name)
    }
}

#[async_trait]
impl Watcher for ChannelWatcher {
    async fn next(&mut self) -> Result<Option<RegistryEvent>, RegistryError> {
        loop {
            let Some(rx) = self.rx.as_mut() else {
                return Ok(None);
            };

            let received = rx.recv().await;
            match received {
                Ok(event) if self.wanted(&event) => return Ok(Some(event)),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped = skipped, "Registry watcher lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.rx = None;
                    return Ok(None);
                }
            }
        }
    }

    fn stop(&mut self) {
        self.rx = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_filtered_watcher() {
        let (tx, rx) = broadcast::channel(8);
        let mut watcher = ChannelWatcher::filtered(rx, "greeter");

        tx.send(RegistryEvent::new(EventKind::Create, Service::new("billing", "1")))
            .unwrap();
        tx.send(RegistryEvent::new(EventKind::Create, Service::new("greeter", "1")))
            .unwrap();

        let event = watcher.next().await.unwrap().unwrap();
        assert_eq!(event.service.name, "greeter");
        assert_eq!(event.kind, EventKind::Create);
    }

    #[tokio::test]
    async fn test_stop_and_close() {
        let (tx, rx) = broadcast::channel(8);
        let mut watcher = ChannelWatcher::new(rx);

        drop(tx);
        assert!(watcher.next().await.unwrap().is_none());

        let (_tx, rx) = broadcast::channel(8);
        let mut watcher = ChannelWatcher::new(rx);
        watcher.stop();
        assert!(watcher.next().await.unwrap().is_none());
    }
}
