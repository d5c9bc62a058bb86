//! Pluggable microservice runtime
//!
//! A [`Server`] holds topic subscribers and request handlers and connects
//! them to three pluggable collaborators:
//!
//! - a [`Broker`](broker::Broker) that delivers published messages to subscribers
//! - a [`Registry`](registry::Registry) where the service announces itself
//! - a [`Transport`](transport::Transport) that carries `Service.Method` requests
//!
//! Payloads are encoded by a [`Codec`](codec::Codec) picked by content type.
//!
//! # Architecture
//!
//! ```text
//!                        ┌──────────── Server ────────────┐
//!   Broker ──Event──────►│                                │
//!                        │  Dispatcher ──► RouteTable     │
//!   Transport ─Request──►│      │          ├ topic → Subscriber
//!                        │      │          └ name  → Handler
//!                        │      ▼                         │
//!                        │  ack / nack / Response         │
//!                        └───────┬────────────────────────┘
//!                                │ register every interval
//!                                ▼
//!                             Registry
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use micro_rs::mock::{MockBroker, MockRegistry, MockTransport};
//! use micro_rs::{RpcHandler, Server, ServerOptions};
//!
//! let server = Server::new(
//!     ServerOptions::default()
//!         .name("greeter")
//!         .broker(Arc::new(MockBroker::new()))
//!         .registry(Arc::new(MockRegistry::new()))
//!         .transport(Arc::new(MockTransport::new())),
//! );
//!
//! server
//!     .handle(
//!         RpcHandler::builder("Greeter")
//!             .method("Hello", |_ctx, req: HelloRequest| async move {
//!                 Ok(HelloResponse { message: format!("Hello, {}", req.name) })
//!             })
//!             .build(),
//!     )
//!     .await?;
//!
//! server.start().await?;
//! ```
//!
//! The library only emits `tracing` events; installing a subscriber is up to
//! the application.

pub mod broker;
pub mod codec;
pub mod error;
pub mod mock;
pub mod registry;
pub mod server;
pub mod transport;

pub use error::{Error, HandlerError, Result};
pub use server::{
    subscriber_fn, Context, Handler, HandlerOptions, RpcHandler, Server, ServerOptions,
    ServerState, Subscriber, SubscriberOptions,
};
