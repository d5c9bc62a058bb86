//! Server configuration

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::broker::Broker;
use crate::codec::{Codec, Codecs};
use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::transport::Transport;

use super::options::Extensions;

/// Default service name
pub const DEFAULT_NAME: &str = "micro.server";

/// Default service version
pub const DEFAULT_VERSION: &str = "latest";

/// Default listen address (any interface, ephemeral port)
pub const DEFAULT_ADDRESS: &str = "0.0.0.0:0";

/// Server configuration options
#[derive(Clone)]
pub struct ServerOptions {
    /// Pub/sub backend (required at start)
    pub broker: Option<Arc<dyn Broker>>,

    /// Discovery backend (required at start)
    pub registry: Option<Arc<dyn Registry>>,

    /// Request/response backend (required at start)
    pub transport: Option<Arc<dyn Transport>>,

    /// Codecs by content type
    pub codecs: Codecs,

    /// Service name
    pub name: String,

    /// Service version
    pub version: String,

    /// Unique instance id
    pub id: String,

    /// Address to listen on
    pub address: String,

    /// Address to publish instead of the bound one (empty = bound address)
    pub advertise: String,

    /// Service metadata
    pub metadata: HashMap<String, String>,

    /// Registry entry lifetime (zero = no expiry)
    pub register_ttl: Duration,

    /// Re-registration period; must be shorter than the TTL (zero = never)
    pub register_interval: Duration,

    /// How long stop waits for in-flight dispatches
    pub shutdown_grace: Duration,

    /// Maximum concurrent dispatches (0 = unlimited)
    pub max_concurrency: usize,

    /// How often the broker connection is checked
    pub broker_check_interval: Duration,

    /// Initial delay before reconnecting to the broker
    pub initial_reconnect_delay: Duration,

    /// Maximum delay between reconnection attempts
    pub max_reconnect_delay: Duration,

    /// Plugin-defined values
    pub extensions: Extensions,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            broker: None,
            registry: None,
            transport: None,
            codecs: Codecs::default(),
            name: DEFAULT_NAME.to_string(),
            version: DEFAULT_VERSION.to_string(),
            id: uuid::Uuid::new_v4().to_string(),
            address: DEFAULT_ADDRESS.to_string(),
            advertise: String::new(),
            metadata: HashMap::new(),
            register_ttl: Duration::from_secs(90),
            register_interval: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(10),
            max_concurrency: 0, // Unlimited
            broker_check_interval: Duration::from_secs(5),
            initial_reconnect_delay: Duration::from_millis(100),
            max_reconnect_delay: Duration::from_secs(30),
            extensions: Extensions::new(),
        }
    }
}

impl ServerOptions {
    /// Set the broker
    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Set the registry
    pub fn registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set the transport
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Add a codec
    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codecs = self.codecs.register(codec);
        self
    }

    /// Replace the codec table
    pub fn codecs(mut self, codecs: Codecs) -> Self {
        self.codecs = codecs;
        self
    }

    /// Set the service name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the service version
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Set the instance id
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the listen address
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Publish this address instead of the bound one
    pub fn advertise(mut self, address: impl Into<String>) -> Self {
        self.advertise = address.into();
        self
    }

    /// Add service metadata
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Set the registration TTL
    pub fn register_ttl(mut self, ttl: Duration) -> Self {
        self.register_ttl = ttl;
        self
    }

    /// Set the re-registration interval
    pub fn register_interval(mut self, interval: Duration) -> Self {
        self.register_interval = interval;
        self
    }

    /// Set the shutdown grace period
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Bound concurrent dispatches
    pub fn max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    /// Set the broker health check period
    pub fn broker_check_interval(mut self, interval: Duration) -> Self {
        self.broker_check_interval = interval;
        self
    }

    /// Set the reconnect backoff bounds
    pub fn reconnect_delay(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_reconnect_delay = initial;
        self.max_reconnect_delay = max;
        self
    }

    /// Attach a plugin value
    pub fn extension<T: std::any::Any + Send + Sync>(mut self, value: T) -> Self {
        self.extensions.insert(value);
        self
    }

    /// Check values that can be checked without collaborators
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Configuration("service name is empty".into()));
        }
        if self.id.trim().is_empty() {
            return Err(Error::Configuration("server id is empty".into()));
        }
        if self.address.trim().is_empty() {
            return Err(Error::Configuration("listen address is empty".into()));
        }
        if !self.register_ttl.is_zero()
            && !self.register_interval.is_zero()
            && self.register_interval >= self.register_ttl
        {
            return Err(Error::Configuration(format!(
                "register interval {:?} must be shorter than ttl {:?}",
                self.register_interval, self.register_ttl
            )));
        }
        if self.initial_reconnect_delay > self.max_reconnect_delay {
            return Err(Error::Configuration(
                "initial reconnect delay exceeds the maximum".into(),
            ));
        }
        Ok(())
    }

    /// Check that every collaborator is present
    pub(crate) fn collaborators(
        &self,
    ) -> Result<(Arc<dyn Broker>, Arc<dyn Registry>, Arc<dyn Transport>)> {
        let broker = self
            .broker
            .clone()
            .ok_or_else(|| Error::Configuration("no broker configured".into()))?;
        let registry = self
            .registry
            .clone()
            .ok_or_else(|| Error::Configuration("no registry configured".into()))?;
        let transport = self
            .transport
            .clone()
            .ok_or_else(|| Error::Configuration("no transport configured".into()))?;
        Ok((broker, registry, transport))
    }
}

impl std::fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerOptions")
            .field("broker", &self.broker.as_ref().map(|b| b.name().to_string()))
            .field("registry", &self.registry.as_ref().map(|r| r.name().to_string()))
            .field("transport", &self.transport.as_ref().map(|t| t.name().to_string()))
            .field("codecs", &self.codecs.content_types())
            .field("name", &self.name)
            .field("version", &self.version)
            .field("id", &self.id)
            .field("address", &self.address)
            .field("advertise", &self.advertise)
            .field("metadata", &self.metadata)
            .field("register_ttl", &self.register_ttl)
            .field("register_interval", &self.register_interval)
            .field("shutdown_grace", &self.shutdown_grace)
            .field("max_concurrency", &self.max_concurrency)
            .finish_non_exhaustive()
    }
}
