//! Service announcement
//!
//! Builds the [`Service`] descriptor from the current route table and keeps
//! it registered: once at start, again after every hot registration or
//! listener rebind, and periodically so the entry outlives its TTL.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::registry::{Node, RegisterOptions, Registry, Service};

use super::config::ServerOptions;
use super::routes::Routes;

/// Node metadata key naming the broker backend
pub const BROKER_METADATA_KEY: &str = "broker";

/// Node metadata key naming the registry backend
pub const REGISTRY_METADATA_KEY: &str = "registry";

/// Node metadata key naming the transport backend
pub const TRANSPORT_METADATA_KEY: &str = "transport";

/// Publishes this server's descriptor to the registry
pub(crate) struct Announcer {
    registry: Arc<dyn Registry>,
    routes: Arc<Routes>,
    name: String,
    version: String,
    metadata: HashMap<String, String>,
    node: Node,
    address: watch::Receiver<String>,
    ttl: Duration,
    deregistered: AtomicBool,
}

impl Announcer {
    pub(crate) fn new(
        options: &ServerOptions,
        registry: Arc<dyn Registry>,
        routes: Arc<Routes>,
        address: watch::Receiver<String>,
        broker_name: &str,
        transport_name: &str,
    ) -> Self {
        let mut node_metadata = HashMap::new();
        node_metadata.insert(BROKER_METADATA_KEY.to_string(), broker_name.to_string());
        node_metadata.insert(REGISTRY_METADATA_KEY.to_string(), registry.name().to_string());
        node_metadata.insert(TRANSPORT_METADATA_KEY.to_string(), transport_name.to_string());

        Self {
            registry,
            routes,
            name: options.name.clone(),
            version: options.version.clone(),
            metadata: options.metadata.clone(),
            node: Node {
                id: options.id.clone(),
                address: String::new(),
                metadata: node_metadata,
            },
            address,
            ttl: options.register_ttl,
            deregistered: AtomicBool::new(false),
        }
    }

    /// Descriptor reflecting the current routes
    ///
    /// Handler endpoints come first ordered by handler name, then subscriber
    /// endpoints ordered by topic.
    pub(crate) async fn describe(&self) -> Service {
        let table = self.routes.snapshot().await;

        let mut service = Service::new(self.name.clone(), self.version.clone());
        service.metadata = self.metadata.clone();
        let mut node = self.node.clone();
        node.address = self.address.borrow().clone();
        service.nodes.push(node);
        service.endpoints = table
            .handlers()
            .flat_map(|h| h.endpoints().iter().cloned())
            .chain(table.subscribers().flat_map(|s| s.endpoints().iter().cloned()))
            .collect();
        service
    }

    /// Register (or refresh) the descriptor
    pub(crate) async fn register(&self) -> Result<()> {
        let service = self.describe().await;
        self.registry
            .register(&service, &RegisterOptions::with_ttl(self.ttl))
            .await?;

        tracing::debug!(
            service = %service.name,
            node = %self.node.id,
            endpoints = service.endpoints.len(),
            "Registered with registry"
        );
        Ok(())
    }

    /// Remove the descriptor; only the first call reaches the registry
    pub(crate) async fn deregister(&self) -> Result<()> {
        if self.deregistered.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let service = self.describe().await;
        self.registry.deregister(&service).await?;

        tracing::info!(service = %service.name, node = %self.node.id, "Deregistered from registry");
        Ok(())
    }

    /// Refresh the registration until `token` fires
    ///
    /// Registers every `interval` (never when zero) and whenever the node
    /// address changes.
    pub(crate) fn spawn_loop(
        self: &Arc<Self>,
        interval: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let announcer = Arc::clone(self);
        let mut address = self.address.clone();

        tokio::spawn(async move {
            let mut ticker = (!interval.is_zero()).then(|| {
                let mut ticker = interval_at(Instant::now() + interval, interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker
            });
            let mut follow = true;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick(&mut ticker) => {}
                    changed = address.changed(), if follow => {
                        if changed.is_err() {
                            follow = false;
                            continue;
                        }
                        let addr = address.borrow().clone();
                        tracing::info!(
                            service = %announcer.name,
                            addr = %addr,
                            "Node address changed"
                        );
                    }
                }

                if let Err(e) = announcer.register().await {
                    tracing::warn!(
                        service = %announcer.name,
                        error = %e,
                        "Re-registration failed, will retry"
                    );
                }
            }
        })
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::error::HandlerError;
    use crate::mock::MockRegistry;
    use crate::server::handler::RpcHandler;
    use crate::server::options::SubscriberOptions;
    use crate::server::subscriber::{subscriber_fn, TopicSubscriber};

    async fn routes() -> Arc<Routes> {
        let routes = Arc::new(Routes::new());
        for topic in ["orders.created", "audit"] {
            routes
                .add_subscriber(Arc::new(TopicSubscriber::new(
                    topic,
                    subscriber_fn(|_ctx, _msg: Value| async { Ok(()) }),
                    SubscriberOptions::default(),
                )))
                .await
                .unwrap();
        }
        routes
            .add_handler(Arc::new(
                RpcHandler::builder("Greeter")
                    .method("Hello", |_ctx, req: Value| async move {
                        Ok::<_, HandlerError>(req)
                    })
                    .build(),
            ))
            .await
            .unwrap();
        routes
    }

    fn announcer(registry: &Arc<MockRegistry>, routes: Arc<Routes>) -> Arc<Announcer> {
        let options = ServerOptions::default()
            .name("shop")
            .version("1.0.0")
            .id("shop-1")
            .metadata("region", "eu")
            .register_ttl(Duration::from_secs(30));
        let (_, address) = watch::channel("mock:7".to_string());
        Arc::new(Announcer::new(
            &options,
            registry.clone(),
            routes,
            address,
            "mock-broker",
            "mock-transport",
        ))
    }

    #[tokio::test]
    async fn test_describe() {
        let registry = Arc::new(MockRegistry::new());
        let service = announcer(&registry, routes().await).describe().await;

        assert_eq!(service.name, "shop");
        assert_eq!(service.version, "1.0.0");
        assert_eq!(service.metadata["region"], "eu");

        let names: Vec<&str> = service.endpoints.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["Greeter.Hello", "audit", "orders.created"]);

        let node = service.node("shop-1").unwrap();
        assert_eq!(node.address, "mock:7");
        assert_eq!(node.metadata[BROKER_METADATA_KEY], "mock-broker");
        assert_eq!(node.metadata[REGISTRY_METADATA_KEY], "mock");
        assert_eq!(node.metadata[TRANSPORT_METADATA_KEY], "mock-transport");
    }

    #[tokio::test]
    async fn test_register_passes_ttl() {
        let registry = Arc::new(MockRegistry::new());
        announcer(&registry, routes().await).register().await.unwrap();

        let calls = registry.registrations();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, Duration::from_secs(30));
        assert_eq!(registry.get_service("shop").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_deregister_once() {
        let registry = Arc::new(MockRegistry::new());
        let announcer = announcer(&registry, routes().await);

        announcer.register().await.unwrap();
        announcer.deregister().await.unwrap();
        announcer.deregister().await.unwrap();

        assert_eq!(registry.deregistrations().len(), 1);
        assert!(registry.get_service("shop").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_refreshes_and_survives_failures() {
        let registry = Arc::new(MockRegistry::new());
        let announcer = announcer(&registry, routes().await);
        let token = CancellationToken::new();

        registry.fail_register(1);
        let handle = announcer.spawn_loop(Duration::from_secs(10), token.clone());

        tokio::time::sleep(Duration::from_secs(35)).await;
        token.cancel();
        handle.await.unwrap();

        // ticks at 10s (failed), 20s and 30s
        assert_eq!(registry.registrations().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_address_change_reregisters() {
        let registry = Arc::new(MockRegistry::new());
        let options = ServerOptions::default().name("shop").id("shop-1");
        let (bound, address) = watch::channel("mock:40000".to_string());
        let announcer = Arc::new(Announcer::new(
            &options,
            registry.clone(),
            routes().await,
            address,
            "mock",
            "mock",
        ));
        let token = CancellationToken::new();
        let handle = announcer.spawn_loop(Duration::ZERO, token.clone());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(registry.registrations().is_empty());

        bound.send_replace("mock:40001".to_string());
        tokio::time::sleep(Duration::from_millis(1)).await;

        let calls = registry.registrations();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0.node("shop-1").unwrap().address, "mock:40001");

        token.cancel();
        handle.await.unwrap();
    }
}
