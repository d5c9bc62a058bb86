//! End-to-end server tests against the in-memory collaborators

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::*;
use crate::broker::{
    Broker, BrokerError, Event, EventHandler, Message, SubscribeOptions, Subscription,
};
use crate::codec::{Codecs, JsonCodec, TextCodec};
use crate::error::{Error, HandlerError, LifecycleError};
use crate::mock::{MockBroker, MockRegistry, MockSubscriber, MockTransport};
use crate::registry::Registry;
use crate::transport::{Request, Status};

struct Harness {
    broker: Arc<MockBroker>,
    registry: Arc<MockRegistry>,
    transport: Arc<MockTransport>,
    server: Server,
}

fn harness() -> Harness {
    harness_with(|options| options)
}

fn harness_with(customize: impl FnOnce(ServerOptions) -> ServerOptions) -> Harness {
    let broker = Arc::new(MockBroker::new());
    let registry = Arc::new(MockRegistry::new());
    let transport = Arc::new(MockTransport::new());

    let options = ServerOptions::default()
        .name("shop")
        .id("shop-1")
        .broker(broker.clone())
        .registry(registry.clone())
        .transport(transport.clone());

    Harness {
        broker,
        registry,
        transport,
        server: Server::new(customize(options)),
    }
}

fn json_message(value: &Value) -> Message {
    Message::new(serde_json::to_vec(value).unwrap()).with_content_type(JsonCodec::CONTENT_TYPE)
}

fn counting(counter: &Arc<AtomicUsize>) -> impl MessageHandler {
    let counter = Arc::clone(counter);
    subscriber_fn(move |_ctx, _msg: Value| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
}

#[derive(Deserialize)]
struct HelloRequest {
    name: String,
}

#[derive(Serialize)]
struct HelloResponse {
    message: String,
}

fn greeter() -> RpcHandler {
    RpcHandler::builder("Greeter")
        .method("Hello", |_ctx, req: HelloRequest| async move {
            Ok(HelloResponse {
                message: format!("Hello, {}", req.name),
            })
        })
        .method("Crash", |_ctx, _req: Value| async move {
            if true {
                panic!("greeter bug");
            }
            Ok::<Value, HandlerError>(Value::Null)
        })
        .build()
}

#[tokio::test]
async fn test_start_publishes_one_endpoint_set_per_entity() {
    let h = harness();
    h.server
        .register_subscriber(Arc::new(MockSubscriber::new("orders.created")))
        .await
        .unwrap();
    h.server
        .register_subscriber(Arc::new(MockSubscriber::new("audit")))
        .await
        .unwrap();
    h.server.handle(greeter()).await.unwrap();
    h.server
        .handle(
            RpcHandler::builder("Billing")
                .method("Charge", |_ctx, req: Value| async move {
                    Ok::<_, HandlerError>(req)
                })
                .build(),
        )
        .await
        .unwrap();

    h.server.start().await.unwrap();

    let registrations = h.registry.registrations();
    assert_eq!(registrations.len(), 1);

    let (service, ttl) = &registrations[0];
    assert_eq!(*ttl, Duration::from_secs(90));
    let names: Vec<&str> = service.endpoints.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "Billing.Charge",
            "Greeter.Crash",
            "Greeter.Hello",
            "audit",
            "orders.created"
        ]
    );

    let node = service.node("shop-1").unwrap();
    assert_eq!(Some(node.address.clone()), h.server.listen_address().await);
    assert_eq!(node.metadata[BROKER_METADATA_KEY], "mock");

    h.server.stop().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_topic_keeps_first_registration() {
    let h = harness();
    let first = MockSubscriber::new("orders.created");
    let second = MockSubscriber::new("orders.created");

    h.server.register_subscriber(Arc::new(first.clone())).await.unwrap();
    let err = h
        .server
        .register_subscriber(Arc::new(second.clone()))
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    h.server.start().await.unwrap();
    h.broker
        .publish("orders.created", json_message(&json!({"id": 1})))
        .await
        .unwrap();

    assert_eq!(first.count(), 1);
    assert_eq!(second.count(), 0);
    assert_eq!(h.broker.active_subscriptions(), 1);
}

#[tokio::test]
async fn test_duplicate_handler_name() {
    let h = harness();
    h.server.handle(greeter()).await.unwrap();

    let err = h.server.handle(greeter()).await.unwrap_err();
    assert!(matches!(err, Error::RegistrationConflict(_)));
}

#[tokio::test]
async fn test_unregistered_topic_is_reported_not_invoked() {
    let broker = Arc::new(MockBroker::new());
    broker.connect().await.unwrap();

    let routes = Arc::new(Routes::new());
    let known = MockSubscriber::new("orders.created");
    routes.add_subscriber(Arc::new(known.clone())).await.unwrap();

    let stats = Arc::new(DispatchStats::new());
    let dispatcher = Arc::new(Dispatcher::new(
        routes,
        Codecs::default(),
        "shop",
        CancellationToken::new(),
        TaskTracker::new(),
        Arc::clone(&stats),
        0,
    ));

    // a broker subscription the route table knows nothing about
    broker
        .subscribe(
            "orders.deleted",
            Arc::new(DispatchHandler::new(dispatcher)),
            SubscribeOptions::default(),
        )
        .await
        .unwrap();
    broker
        .publish("orders.deleted", json_message(&json!({"id": 1})))
        .await
        .unwrap();

    assert_eq!(known.count(), 0);
    assert_eq!(broker.nacks(), vec!["orders.deleted".to_string()]);
    assert!(broker.acks().is_empty());
    assert_eq!(stats.snapshot().events_unhandled, 1);
}

#[tokio::test]
async fn test_payload_round_trips_through_codec() {
    let h = harness();
    let orders = MockSubscriber::new("orders.created");
    let notes = MockSubscriber::new("notes");
    h.server.register_subscriber(Arc::new(orders.clone())).await.unwrap();
    h.server.register_subscriber(Arc::new(notes.clone())).await.unwrap();
    h.server.start().await.unwrap();

    let order = json!({"id": 42, "items": [{"sku": "A-1", "qty": 2}], "paid": true});
    h.broker
        .publish("orders.created", json_message(&order))
        .await
        .unwrap();
    h.broker
        .publish(
            "notes",
            Message::new(Bytes::from_static(b"hello")).with_content_type(TextCodec::CONTENT_TYPE),
        )
        .await
        .unwrap();

    assert_eq!(orders.payloads(), vec![order]);
    assert_eq!(notes.payloads(), vec![json!("hello")]);
}

#[tokio::test]
async fn test_stop_twice_deregisters_once() {
    let h = harness();
    h.server.handle(greeter()).await.unwrap();
    h.server.start().await.unwrap();

    h.server.stop().await.unwrap();
    h.server.stop().await.unwrap();

    assert_eq!(h.registry.deregistrations().len(), 1);
    assert_eq!(h.server.state().await, ServerState::Stopped);
    assert!(h.registry.get_service("shop").await.unwrap().is_empty());
    assert_eq!(h.broker.disconnect_calls(), 1);
    assert!(h.server.listen_address().await.is_none());
}

#[tokio::test]
async fn test_failed_subscribe_aborts_start() {
    let h = harness();
    for topic in ["a", "b", "c"] {
        h.server
            .register_subscriber(Arc::new(MockSubscriber::new(topic)))
            .await
            .unwrap();
    }
    h.broker.fail_subscribe_on("b");

    let err = h.server.start().await.unwrap_err();

    assert!(matches!(err, Error::Broker(_)));
    assert_eq!(h.broker.active_subscriptions(), 0);
    assert_eq!(h.server.state().await, ServerState::Created);
    assert!(h.registry.registrations().is_empty());

    let bound = h.transport.listen_calls();
    assert_eq!(bound.len(), 1);
    assert!(!h.transport.is_listening("mock:40000"));
}

#[tokio::test]
async fn test_orders_created_scenario() {
    let h = harness();
    let counter = Arc::new(AtomicUsize::new(0));
    h.server
        .subscribe(
            "orders.created",
            counting(&counter),
            SubscriberOptions::default().auto_ack(true),
        )
        .await
        .unwrap();

    // fed before start: the broker holds them until the first subscription
    h.broker.connect().await.unwrap();
    for id in 1..=3 {
        h.broker
            .publish("orders.created", json_message(&json!({ "id": id })))
            .await
            .unwrap();
    }

    h.server.start().await.unwrap();

    assert_eq!(counter.load(Ordering::SeqCst), 3);
    assert_eq!(h.broker.acks().len(), 3);
    assert!(h.broker.nacks().is_empty());
    assert_eq!(h.server.stats().events_acked, 3);
}

#[tokio::test]
async fn test_greeter_scenario() {
    let h = harness();
    h.server.handle(greeter()).await.unwrap();
    h.server.start().await.unwrap();

    let address = h.server.listen_address().await.unwrap();
    let body = serde_json::to_vec(&json!({"name": "Ana"})).unwrap();
    let response = h
        .transport
        .call(&address, Request::new("shop", "Greeter.Hello", body))
        .await
        .unwrap();

    assert_eq!(response.status, Status::Ok);
    let body: Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body, json!({"message": "Hello, Ana"}));
}

#[tokio::test]
async fn test_handler_panic_keeps_server_running() {
    let h = harness();
    h.server.handle(greeter()).await.unwrap();
    h.server.start().await.unwrap();
    let address = h.server.listen_address().await.unwrap();

    let crashed = h
        .transport
        .call(&address, Request::new("shop", "Greeter.Crash", "null"))
        .await
        .unwrap();
    assert_eq!(crashed.status, Status::InternalError);

    let ok = h
        .transport
        .call(&address, Request::new("shop", "Greeter.Hello", r#"{"name":"Bo"}"#))
        .await
        .unwrap();
    assert!(ok.is_ok());
    assert_eq!(h.server.stats().panics, 1);
}

#[tokio::test]
async fn test_lifecycle_errors() {
    let h = harness();

    assert!(matches!(
        h.server.stop().await,
        Err(Error::Lifecycle(LifecycleError::NotStarted))
    ));

    h.server.init(|o| o.version("2.0.0")).await.unwrap();
    assert_eq!(h.server.state().await, ServerState::Initialized);
    h.server.start().await.unwrap();

    assert!(matches!(
        h.server.start().await,
        Err(Error::Lifecycle(LifecycleError::AlreadyStarted))
    ));
    assert!(matches!(
        h.server.init(|o| o).await,
        Err(Error::Lifecycle(LifecycleError::AlreadyStarted))
    ));

    h.server.stop().await.unwrap();
    assert!(matches!(
        h.server.start().await,
        Err(Error::Lifecycle(LifecycleError::Stopped))
    ));
    assert!(matches!(
        h.server.handle(greeter()).await,
        Err(Error::Lifecycle(LifecycleError::Stopped))
    ));
}

#[tokio::test]
async fn test_invalid_init_keeps_options() {
    let h = harness();

    let err = h
        .server
        .init(|o| {
            o.register_ttl(Duration::from_secs(10))
                .register_interval(Duration::from_secs(20))
        })
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Configuration(_)));
    assert_eq!(h.server.state().await, ServerState::Created);
    assert_eq!(h.server.options().await.register_ttl, Duration::from_secs(90));
}

#[tokio::test]
async fn test_start_requires_collaborators() {
    let server = Server::new(ServerOptions::default());

    let err = server.start().await.unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
    assert_eq!(server.state().await, ServerState::Created);
}

#[tokio::test]
async fn test_listen_failure_aborts_before_broker() {
    let h = harness();
    h.transport.fail_listen(true);

    let err = h.server.start().await.unwrap_err();

    assert!(matches!(err, Error::Transport(_)));
    assert_eq!(h.broker.connect_calls(), 0);
    assert_eq!(h.server.state().await, ServerState::Created);
}

#[tokio::test]
async fn test_registry_failure_does_not_abort_start() {
    let h = harness();
    h.registry.fail_register(1);

    h.server.start().await.unwrap();

    assert_eq!(h.server.state().await, ServerState::Started);
    assert_eq!(h.registry.register_attempts(), 1);
}

#[tokio::test]
async fn test_hot_registration() {
    let h = harness();
    h.server.start().await.unwrap();

    let late = MockSubscriber::new("late");
    h.server.register_subscriber(Arc::new(late.clone())).await.unwrap();
    h.server.handle(greeter()).await.unwrap();

    assert_eq!(h.broker.active_subscriptions(), 1);
    let registrations = h.registry.registrations();
    assert_eq!(registrations.len(), 3);
    let latest = &registrations[2].0;
    assert!(latest.endpoint("late").is_some());
    assert!(latest.endpoint("Greeter.Hello").is_some());

    h.broker
        .publish("late", json_message(&json!(1)))
        .await
        .unwrap();
    assert_eq!(late.count(), 1);
}

#[tokio::test]
async fn test_hot_registration_rolls_back_on_broker_failure() {
    let h = harness();
    h.server.start().await.unwrap();
    h.broker.fail_subscribe_on("late");

    for _ in 0..2 {
        // the route is removed each time, so this never turns into a conflict
        let err = h
            .server
            .register_subscriber(Arc::new(MockSubscriber::new("late")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Broker(_)));
    }
    assert_eq!(h.broker.active_subscriptions(), 0);
}

#[tokio::test]
async fn test_unsubscribe() {
    let h = harness();
    let orders = MockSubscriber::new("orders.created");
    h.server.register_subscriber(Arc::new(orders.clone())).await.unwrap();
    h.server.start().await.unwrap();

    h.server.unsubscribe("orders.created").await.unwrap();
    assert_eq!(h.broker.active_subscriptions(), 0);
    assert!(matches!(
        h.server.unsubscribe("orders.created").await,
        Err(Error::NotFound(_))
    ));

    let latest = h.registry.registrations().pop().unwrap().0;
    assert!(latest.endpoint("orders.created").is_none());
}

#[tokio::test]
async fn test_manual_ack() {
    let h = harness();
    h.server
        .subscribe(
            "orders.created",
            subscriber_fn(|ctx: Context, _msg: Value| async move {
                ctx.ack().await.map_err(HandlerError::internal)
            }),
            SubscriberOptions::default().auto_ack(false),
        )
        .await
        .unwrap();
    h.server.start().await.unwrap();

    h.broker
        .publish("orders.created", json_message(&json!({})))
        .await
        .unwrap();

    assert_eq!(h.broker.acks().len(), 1);
    // the dispatcher itself did not ack
    assert_eq!(h.server.stats().events_acked, 0);
}

#[tokio::test]
async fn test_error_handler_replaces_nack() {
    let h = harness();
    let seen = Arc::new(AtomicUsize::new(0));
    let seen_in_handler = Arc::clone(&seen);

    let failing = MockSubscriber::with_options(
        "orders.created",
        SubscriberOptions::default().error_handler(move |event: &dyn Event, error: &Error| {
            assert_eq!(event.topic(), "orders.created");
            assert!(matches!(error, Error::Handler(_)));
            seen_in_handler.fetch_add(1, Ordering::SeqCst);
        }),
    );
    failing.fail_with(HandlerError::internal("db down"));
    h.server.register_subscriber(Arc::new(failing)).await.unwrap();
    h.server.start().await.unwrap();

    h.broker
        .publish("orders.created", json_message(&json!({})))
        .await
        .unwrap();

    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert!(h.broker.nacks().is_empty());
    assert!(h.broker.acks().is_empty());
}

#[tokio::test]
async fn test_failing_subscriber_is_nacked() {
    let h = harness();
    let failing = MockSubscriber::new("orders.created");
    failing.fail_with(HandlerError::internal("db down"));
    h.server.register_subscriber(Arc::new(failing)).await.unwrap();
    h.server.start().await.unwrap();

    h.broker
        .publish("orders.created", json_message(&json!({})))
        .await
        .unwrap();

    assert_eq!(h.broker.nacks().len(), 1);
    assert_eq!(h.server.stats().events_failed, 1);
}

#[tokio::test]
async fn test_stop_cancels_in_flight_work() {
    let h = harness_with(|o| o.shutdown_grace(Duration::from_secs(5)));
    let entered = Arc::new(Notify::new());
    let entered_in_handler = Arc::clone(&entered);

    h.server
        .subscribe(
            "jobs",
            subscriber_fn(move |ctx: Context, _msg: Value| {
                let entered = Arc::clone(&entered_in_handler);
                async move {
                    entered.notify_one();
                    ctx.cancelled().await;
                    Ok(())
                }
            }),
            SubscriberOptions::default(),
        )
        .await
        .unwrap();
    h.server.start().await.unwrap();

    let broker = Arc::clone(&h.broker);
    let publishing =
        tokio::spawn(async move { broker.publish("jobs", json_message(&json!({}))).await });

    entered.notified().await;
    h.server.stop().await.unwrap();

    publishing.await.unwrap().unwrap();
    assert_eq!(h.server.state().await, ServerState::Stopped);
}

#[tokio::test]
async fn test_advertise_address_is_published() {
    let h = harness_with(|o| o.advertise("10.0.0.7:8080"));
    h.server.start().await.unwrap();

    let service = &h.registry.registrations()[0].0;
    assert_eq!(service.node("shop-1").unwrap().address, "10.0.0.7:8080");
}

#[tokio::test(start_paused = true)]
async fn test_supervisor_restores_subscriptions() {
    let h = harness_with(|o| o.broker_check_interval(Duration::from_secs(1)));
    let orders = MockSubscriber::new("orders.created");
    h.server.register_subscriber(Arc::new(orders.clone())).await.unwrap();
    h.server.start().await.unwrap();

    h.broker.drop_connection();
    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert!(h.broker.is_connected());
    assert_eq!(h.broker.active_subscriptions(), 1);

    h.broker
        .publish("orders.created", json_message(&json!({"id": 9})))
        .await
        .unwrap();
    assert_eq!(orders.count(), 1);
}

/// Broker that holds the first subscribe on one topic until released
struct GatedBroker {
    inner: Arc<MockBroker>,
    topic: &'static str,
    gate: Notify,
    held: AtomicBool,
}

impl GatedBroker {
    fn new(inner: Arc<MockBroker>, topic: &'static str) -> Self {
        Self {
            inner,
            topic,
            gate: Notify::new(),
            held: AtomicBool::new(false),
        }
    }

    fn release(&self) {
        self.gate.notify_one();
    }
}

#[async_trait::async_trait]
impl Broker for GatedBroker {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn connect(&self) -> std::result::Result<(), BrokerError> {
        self.inner.connect().await
    }

    async fn disconnect(&self) -> std::result::Result<(), BrokerError> {
        self.inner.disconnect().await
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    async fn publish(&self, topic: &str, message: Message) -> std::result::Result<(), BrokerError> {
        self.inner.publish(topic, message).await
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn EventHandler>,
        options: SubscribeOptions,
    ) -> std::result::Result<Box<dyn Subscription>, BrokerError> {
        if topic == self.topic && !self.held.swap(true, Ordering::SeqCst) {
            self.gate.notified().await;
        }
        self.inner.subscribe(topic, handler, options).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_resync_during_hot_registration_subscribes_once() {
    let broker = Arc::new(MockBroker::new());
    let gated = Arc::new(GatedBroker::new(Arc::clone(&broker), "late"));
    let h = harness_with(|o| {
        o.broker(gated.clone())
            .broker_check_interval(Duration::from_secs(1))
    });
    h.server.start().await.unwrap();

    let late = MockSubscriber::new("late");
    let server = h.server.clone();
    let subscriber: Arc<dyn Subscriber> = Arc::new(late.clone());
    let registering = tokio::spawn(async move { server.register_subscriber(subscriber).await });

    // the supervisor checks at 1s while the broker still holds the subscribe
    tokio::time::sleep(Duration::from_millis(1500)).await;
    gated.release();
    registering.await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(broker.active_subscriptions(), 1);
    broker.publish("late", json_message(&json!(1))).await.unwrap();
    assert_eq!(late.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_listener_is_bound_again_after_drop() {
    let h = harness();
    h.server.handle(greeter()).await.unwrap();
    h.server.start().await.unwrap();
    let first = h.server.listen_address().await.unwrap();

    assert!(h.transport.drop_listener(&first));
    tokio::time::sleep(Duration::from_millis(10)).await;

    let second = h.server.listen_address().await.unwrap();
    assert_ne!(first, second);
    assert_eq!(h.transport.listen_calls().len(), 2);
    assert_eq!(h.server.state().await, ServerState::Started);

    let response = h
        .transport
        .call(&second, Request::new("shop", "Greeter.Hello", r#"{"name":"Cy"}"#))
        .await
        .unwrap();
    assert!(response.is_ok());

    let latest = h.registry.registrations().pop().unwrap().0;
    assert_eq!(latest.node("shop-1").unwrap().address, second);
}

#[tokio::test(start_paused = true)]
async fn test_stop_gives_up_after_shutdown_grace() {
    let h = harness_with(|o| o.shutdown_grace(Duration::from_secs(2)));
    let entered = Arc::new(Notify::new());
    let entered_in_handler = Arc::clone(&entered);

    h.server
        .subscribe(
            "jobs",
            subscriber_fn(move |_ctx: Context, _msg: Value| {
                let entered = Arc::clone(&entered_in_handler);
                async move {
                    entered.notify_one();
                    // ignores cancellation
                    tokio::time::sleep(Duration::from_secs(600)).await;
                    Ok(())
                }
            }),
            SubscriberOptions::default(),
        )
        .await
        .unwrap();
    h.server.start().await.unwrap();

    let broker = Arc::clone(&h.broker);
    tokio::spawn(async move { broker.publish("jobs", json_message(&json!({}))).await });
    entered.notified().await;

    let began = tokio::time::Instant::now();
    h.server.stop().await.unwrap();
    let waited = began.elapsed();

    assert!(waited >= Duration::from_secs(2), "{waited:?}");
    assert!(waited < Duration::from_secs(600), "{waited:?}");
    assert_eq!(h.server.state().await, ServerState::Stopped);
}
