//! Greeter - a request handler and a topic subscriber on in-memory plugins
//!
//! Run with: cargo run --example greeter
//!
//! This example demonstrates:
//! - Building a handler from a static method table with `RpcHandler::builder`
//! - Subscribing a typed closure to a topic
//! - Wiring broker, registry and transport through `ServerOptions`
//! - The full `init → start → stop` lifecycle
//!
//! # Flow
//!
//! ```text
//!   MockTransport ──"Greeter.Hello"──► Server ──► Greeter::Hello
//!   MockBroker    ──"greetings"──────► Server ──► subscriber closure ──► ack
//!   MockRegistry  ◄──register/deregister── Server
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use micro_rs::broker::{Broker, Message};
use micro_rs::codec::JsonCodec;
use micro_rs::mock::{MockBroker, MockRegistry, MockTransport};
use micro_rs::registry::Registry;
use micro_rs::transport::Request;
use micro_rs::{
    subscriber_fn, Context, HandlerError, RpcHandler, Server, ServerOptions, SubscriberOptions,
};

#[derive(Debug, Deserialize)]
struct HelloRequest {
    name: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct HelloResponse {
    message: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Greeted {
    name: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("micro_rs=debug".parse()?)
                .add_directive("greeter=info".parse()?),
        )
        .init();

    let broker = Arc::new(MockBroker::new());
    let registry = Arc::new(MockRegistry::new());
    let transport = Arc::new(MockTransport::new());

    let server = Server::new(
        ServerOptions::default()
            .broker(broker.clone())
            .registry(registry.clone())
            .transport(transport.clone()),
    );
    server
        .init(|options| {
            options
                .name("greeter")
                .version("1.0.0")
                .register_ttl(Duration::from_secs(30))
                .register_interval(Duration::from_secs(10))
        })
        .await?;

    server
        .handle(
            RpcHandler::builder("Greeter")
                .method("Hello", |ctx: Context, req: HelloRequest| async move {
                    if req.name.is_empty() {
                        return Err(HandlerError::bad_request("name is required"));
                    }
                    tracing::info!(endpoint = %ctx.target, name = %req.name, "Greeting");
                    Ok(HelloResponse {
                        message: format!("Hello, {}", req.name),
                    })
                })
                .build(),
        )
        .await?;

    server
        .subscribe(
            "greetings",
            subscriber_fn(|_ctx, event: Greeted| async move {
                tracing::info!(name = %event.name, "Someone was greeted");
                Ok(())
            }),
            SubscriberOptions::default().queue("greeter"),
        )
        .await?;

    server.start().await?;

    let address = server
        .listen_address()
        .await
        .ok_or("server has no listen address")?;
    tracing::info!(address = %address, "Greeter running");

    for name in ["Ana", ""] {
        let body = serde_json::to_vec(&serde_json::json!({ "name": name }))?;
        let response = transport
            .call(&address, Request::new("greeter", "Greeter.Hello", body))
            .await?;
        tracing::info!(
            status = %response.status,
            body = %String::from_utf8_lossy(&response.body),
            "Response"
        );

        if response.is_ok() {
            let reply: HelloResponse = serde_json::from_slice(&response.body)?;
            let greeted = serde_json::to_vec(&Greeted {
                name: reply.message.trim_start_matches("Hello, ").to_string(),
            })?;
            broker
                .publish(
                    "greetings",
                    Message::new(greeted).with_content_type(JsonCodec::CONTENT_TYPE),
                )
                .await?;
        }
    }

    for service in registry.list_services().await? {
        tracing::info!(
            service = %service.name,
            version = %service.version,
            endpoints = service.endpoints.len(),
            "Registered service"
        );
    }

    let stats = server.stats();
    tracing::info!(
        requests_served = stats.requests_served,
        requests_failed = stats.requests_failed,
        events_acked = stats.events_acked,
        "Dispatch stats"
    );

    server.stop().await?;
    Ok(())
}
