//! Server lifecycle
//!
//! [`Server`] owns the route table and drives the collaborators through
//! `init → start → stop`. Lifecycle transitions and hot registration are
//! serialized on one async mutex; dispatch never takes it.

use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::broker::Broker;
use crate::error::{Error, LifecycleError, Result};

use super::announce::Announcer;
use super::config::ServerOptions;
use super::dispatcher::{DispatchHandler, Dispatcher};
use super::handler::Handler;
use super::listener::{spawn_accept_loop, Binding};
use super::options::SubscriberOptions;
use super::routes::Routes;
use super::state::ServerState;
use super::stats::{DispatchStats, StatsSnapshot};
use super::subscriber::{MessageHandler, Subscriber, TopicSubscriber};
use super::subscriptions::Subscriptions;
use super::supervisor::{Backoff, Supervisor};

/// Microservice server
///
/// Cheap to clone; clones share the same server.
///
/// # Example
///
/// ```ignore
/// let server = Server::new(
///     ServerOptions::default()
///         .name("greeter")
///         .broker(broker)
///         .registry(registry)
///         .transport(transport),
/// );
///
/// server.handle(greeter).await?;
/// server.start().await?;
/// // ...
/// server.stop().await?;
/// ```
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

struct Inner {
    lifecycle: Mutex<Lifecycle>,
    routes: Arc<Routes>,
    stats: Arc<DispatchStats>,
}

struct Lifecycle {
    state: ServerState,
    options: Arc<ServerOptions>,
    running: Option<Running>,
}

/// Everything that exists only while started
struct Running {
    token: CancellationToken,
    tracker: TaskTracker,
    binding: Arc<Binding>,
    broker: Arc<dyn Broker>,
    subscriptions: Arc<Subscriptions>,
    announcer: Arc<Announcer>,
    tasks: Vec<JoinHandle<()>>,
}

impl Server {
    /// Create a server; options are validated by `init` or `start`
    pub fn new(options: ServerOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                lifecycle: Mutex::new(Lifecycle {
                    state: ServerState::Created,
                    options: Arc::new(options),
                    running: None,
                }),
                routes: Arc::new(Routes::new()),
                stats: Arc::new(DispatchStats::new()),
            }),
        }
    }

    /// Apply option changes and validate the result
    ///
    /// Only valid before start. On error the previous options are kept.
    pub async fn init<F>(&self, apply: F) -> Result<()>
    where
        F: FnOnce(ServerOptions) -> ServerOptions,
    {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        lifecycle.state.can_init()?;

        let options = apply(ServerOptions::clone(&lifecycle.options));
        options.validate()?;

        tracing::debug!(service = %options.name, id = %options.id, "Server initialized");
        lifecycle.options = Arc::new(options);
        lifecycle.state = ServerState::Initialized;
        Ok(())
    }

    /// Start serving
    ///
    /// Binds the listener, connects the broker and subscribes every
    /// subscriber, registers with the registry, then spawns the background
    /// loops. A listener or broker failure undoes what was done and leaves the
    /// server in its previous state; a registry failure is only logged.
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        lifecycle.state.can_start()?;

        let options = Arc::clone(&lifecycle.options);
        options.validate()?;
        let (broker, registry, transport) = options.collaborators()?;

        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&self.inner.routes),
            options.codecs.clone(),
            options.name.clone(),
            token.clone(),
            tracker.clone(),
            Arc::clone(&self.inner.stats),
            options.max_concurrency,
        ));

        let backoff = Backoff {
            check_interval: options.broker_check_interval,
            initial_delay: options.initial_reconnect_delay,
            max_delay: options.max_reconnect_delay,
        };

        // 1. transport
        let binding = Binding::bind(Arc::clone(&transport), &options.address).await?;
        let accept_task = spawn_accept_loop(
            Arc::clone(&binding),
            Arc::clone(&dispatcher),
            backoff,
            token.clone(),
        );

        // 2. broker
        let subscriptions = Arc::new(Subscriptions::new(
            Arc::clone(&broker),
            Arc::new(DispatchHandler::new(Arc::clone(&dispatcher))),
        ));
        if let Err(e) = self.connect_broker(broker.as_ref(), &subscriptions).await {
            token.cancel();
            if let Err(close_err) = binding.close().await {
                tracing::warn!(error = %close_err, "Failed to close listener");
            }
            let _ = accept_task.await;
            tracing::error!(service = %options.name, error = %e, "Server failed to start");
            return Err(e);
        }

        // 3. registry
        let node_address = if options.advertise.is_empty() {
            binding.watch()
        } else {
            watch::channel(options.advertise.clone()).1
        };
        let announcer = Arc::new(Announcer::new(
            &options,
            registry,
            Arc::clone(&self.inner.routes),
            node_address,
            broker.name(),
            transport.name(),
        ));
        if let Err(e) = announcer.register().await {
            tracing::warn!(service = %options.name, error = %e, "Registration failed, will retry");
        }

        // 4. background loops
        let mut tasks = vec![
            accept_task,
            announcer.spawn_loop(options.register_interval, token.clone()),
        ];
        tasks.extend(
            Supervisor::new(
                Arc::clone(&broker),
                Arc::clone(&subscriptions),
                Arc::clone(&self.inner.routes),
                backoff,
            )
            .spawn(token.clone()),
        );

        tracing::info!(
            service = %options.name,
            version = %options.version,
            id = %options.id,
            addr = %binding.addr(),
            subscriptions = subscriptions.len().await,
            "Server started"
        );

        lifecycle.running = Some(Running {
            token,
            tracker,
            binding,
            broker,
            subscriptions,
            announcer,
            tasks,
        });
        lifecycle.state = ServerState::Started;
        Ok(())
    }

    async fn connect_broker(
        &self,
        broker: &dyn Broker,
        subscriptions: &Subscriptions,
    ) -> Result<()> {
        broker.connect().await?;
        tracing::debug!(broker = %broker.name(), address = %broker.address(), "Broker connected");

        let table = self.inner.routes.snapshot().await;
        if let Err(e) = subscriptions.subscribe_all(&table).await {
            if let Err(disconnect_err) = broker.disconnect().await {
                tracing::warn!(error = %disconnect_err, "Failed to disconnect broker");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Stop serving
    ///
    /// Stopping a stopped server is a no-op. In order: cancel in-flight work,
    /// deregister, unsubscribe, close the listener, disconnect the broker, then
    /// wait up to the shutdown grace period for dispatches to finish.
    pub async fn stop(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        match lifecycle.state {
            ServerState::Stopped => return Ok(()),
            ServerState::Created | ServerState::Initialized => {
                return Err(LifecycleError::NotStarted.into())
            }
            ServerState::Started => {}
        }

        lifecycle.state = ServerState::Stopped;
        let Some(running) = lifecycle.running.take() else {
            return Ok(());
        };
        let options = Arc::clone(&lifecycle.options);

        tracing::info!(service = %options.name, "Stopping server");
        running.token.cancel();

        if let Err(e) = running.announcer.deregister().await {
            tracing::warn!(service = %options.name, error = %e, "Deregistration failed");
        }
        running.subscriptions.unsubscribe_all().await;
        if let Err(e) = running.binding.close().await {
            tracing::warn!(error = %e, "Failed to close listener");
        }
        if let Err(e) = running.broker.disconnect().await {
            tracing::warn!(error = %e, "Failed to disconnect broker");
        }

        running.tracker.close();
        if tokio::time::timeout(options.shutdown_grace, running.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                in_flight = running.tracker.len(),
                grace_ms = options.shutdown_grace.as_millis() as u64,
                "Shutdown grace elapsed with dispatches in flight"
            );
        }

        for task in running.tasks {
            task.abort();
        }

        tracing::info!(service = %options.name, "Server stopped");
        Ok(())
    }

    /// Subscribe a handler to a topic
    pub async fn subscribe(
        &self,
        topic: impl Into<String>,
        handler: impl MessageHandler + 'static,
        options: SubscriberOptions,
    ) -> Result<()> {
        self.register_subscriber(Arc::new(TopicSubscriber::new(topic, handler, options)))
            .await
    }

    /// Register any subscriber
    ///
    /// After start the topic is subscribed on the broker right away; if that
    /// fails the route is removed again and the error returned.
    pub async fn register_subscriber(&self, subscriber: Arc<dyn Subscriber>) -> Result<()> {
        let lifecycle = self.inner.lifecycle.lock().await;
        lifecycle.state.accepts_registration()?;

        self.inner.routes.add_subscriber(Arc::clone(&subscriber)).await?;
        tracing::info!(topic = %subscriber.topic(), "Subscriber registered");

        if let Some(running) = &lifecycle.running {
            if let Err(e) = running.subscriptions.subscribe(subscriber.as_ref()).await {
                self.inner.routes.remove_subscriber(subscriber.topic()).await;
                // a resync may have subscribed the topic in between
                running.subscriptions.unsubscribe(subscriber.topic()).await;
                return Err(e);
            }
            republish(&running.announcer).await;
        }
        Ok(())
    }

    /// Register a request handler
    pub async fn handle(&self, handler: impl Handler + 'static) -> Result<()> {
        let handler: Arc<dyn Handler> = Arc::new(handler);

        let lifecycle = self.inner.lifecycle.lock().await;
        lifecycle.state.accepts_registration()?;

        self.inner.routes.add_handler(Arc::clone(&handler)).await?;
        tracing::info!(
            handler = %handler.name(),
            endpoints = handler.endpoints().len(),
            "Handler registered"
        );

        if let Some(running) = &lifecycle.running {
            republish(&running.announcer).await;
        }
        Ok(())
    }

    /// Remove the subscriber for a topic
    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let lifecycle = self.inner.lifecycle.lock().await;
        lifecycle.state.accepts_registration()?;

        if self.inner.routes.remove_subscriber(topic).await.is_none() {
            return Err(Error::NotFound(format!("no subscriber for topic '{}'", topic)));
        }
        tracing::info!(topic = %topic, "Subscriber removed");

        if let Some(running) = &lifecycle.running {
            running.subscriptions.unsubscribe(topic).await;
            republish(&running.announcer).await;
        }
        Ok(())
    }

    /// Current lifecycle state
    pub async fn state(&self) -> ServerState {
        self.inner.lifecycle.lock().await.state
    }

    /// Current options
    pub async fn options(&self) -> Arc<ServerOptions> {
        Arc::clone(&self.inner.lifecycle.lock().await.options)
    }

    /// Dispatch counters
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Address the transport listener bound, while started
    pub async fn listen_address(&self) -> Option<String> {
        self.inner
            .lifecycle
            .lock()
            .await
            .running
            .as_ref()
            .map(|r| r.binding.addr())
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server").finish_non_exhaustive()
    }
}

async fn republish(announcer: &Announcer) {
    if let Err(e) = announcer.register().await {
        tracing::warn!(error = %e, "Re-registration after route change failed");
    }
}
