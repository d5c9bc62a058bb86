//! In-memory collaborators
//!
//! Deterministic stand-ins for a broker, registry and transport, plus a
//! recording subscriber. Every call is recorded and failures can be injected,
//! which makes them suitable for tests and demos. They never touch the
//! network.

mod broker;
mod registry;
mod subscriber;
mod transport;

pub use broker::MockBroker;
pub use registry::MockRegistry;
pub use subscriber::MockSubscriber;
pub use transport::MockTransport;
