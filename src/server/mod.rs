//! Server runtime
//!
//! Registration of subscribers and handlers, the lifecycle that connects
//! them to the broker, registry and transport, and dispatch of inbound work.
//!
//! ```text
//!   Broker ──Event──►┐                          ┌──► Subscriber (topic)
//!                    ├──► Dispatcher ──routes───┤
//!   Transport ─Req──►┘        │                 └──► Handler.Method
//!                             ▼
//!                   ack/nack or Response
//! ```

mod announce;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod handler;
mod listener;
pub mod options;
pub mod routes;
mod runtime;
pub mod state;
pub mod stats;
pub mod subscriber;
mod subscriptions;
mod supervisor;

pub use announce::{BROKER_METADATA_KEY, REGISTRY_METADATA_KEY, TRANSPORT_METADATA_KEY};
pub use config::ServerOptions;
pub use context::Context;
pub use dispatcher::{DispatchHandler, Dispatcher};
pub use handler::{Handler, Method, RpcHandler, RpcHandlerBuilder, TypedMethod};
pub use options::{ErrorHandler, Extensions, HandlerOptions, SubscriberOptions};
pub use routes::{RouteTable, Routes};
pub use runtime::Server;
pub use state::ServerState;
pub use stats::{DispatchStats, StatsSnapshot};
pub use subscriber::{subscriber_fn, MessageHandler, Subscriber, TopicSubscriber, TypedSubscriber};

#[cfg(test)]
mod tests;
