//! Service discovery contract
//!
//! The registry maps service names to the instances currently serving them.
//! The server publishes one [`Service`] descriptor on start, keeps it alive by
//! re-registering before its TTL lapses, and removes it on stop.
//!
//! ```text
//!   Server::start ──► register(service, ttl) ──┐
//!                                              │   every register_interval
//!   announce loop ──► register(service, ttl) ◄─┘   (interval < ttl)
//!   Server::stop  ──► deregister(service)
//! ```
//!
//! Concrete backends implement [`Registry`]; the runtime never depends on one.

pub mod error;
pub mod event;
pub mod service;

use std::time::Duration;

use async_trait::async_trait;

pub use error::RegistryError;
pub use event::{ChannelWatcher, EventKind, RegistryEvent, Watcher};
pub use service::{Endpoint, Node, Schema, Service};

/// Options for a single registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterOptions {
    /// How long the entry lives without being refreshed (zero = forever)
    pub ttl: Duration,
}

impl RegisterOptions {
    /// Register with the given TTL
    pub fn with_ttl(ttl: Duration) -> Self {
        Self { ttl }
    }
}

impl Default for RegisterOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::ZERO,
        }
    }
}

/// Service discovery backend
#[async_trait]
pub trait Registry: Send + Sync {
    /// Short backend name, published in node metadata
    fn name(&self) -> &str;

    /// Add or refresh the nodes of `service`
    async fn register(
        &self,
        service: &Service,
        options: &RegisterOptions,
    ) -> Result<(), RegistryError>;

    /// Remove the nodes of `service`
    async fn deregister(&self, service: &Service) -> Result<(), RegistryError>;

    /// All known versions of a service
    async fn get_service(&self, name: &str) -> Result<Vec<Service>, RegistryError>;

    /// Every registered service
    async fn list_services(&self) -> Result<Vec<Service>, RegistryError>;

    /// Watch for changes, optionally restricted to one service name
    async fn watch(&self, service: Option<&str>) -> Result<Box<dyn Watcher>, RegistryError>;
}
