//! In-memory transport

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::transport::{
    Client, Exchange, Listener, Request, Responder, Response, Transport, TransportError,
};

/// Pending exchanges per listener
const QUEUE_DEPTH: usize = 64;

/// First port handed out for `:0` addresses
const FIRST_EPHEMERAL_PORT: u16 = 40000;

/// Transport connecting in-process clients to in-process listeners
///
/// Listening on a `host:0` address picks a fresh `mock:<port>` address.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    listeners: HashMap<String, Bound>,
    next_port: u16,
    fail_listen: bool,
    listen_calls: Vec<String>,
}

struct Bound {
    sender: mpsc::Sender<Exchange>,
    closed: CancellationToken,
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockTransport {
    /// Create a transport with no listeners
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every listen call fail
    pub fn fail_listen(&self, fail: bool) {
        lock(&self.state).fail_listen = fail;
    }

    /// Addresses passed to listen, failed calls included
    pub fn listen_calls(&self) -> Vec<String> {
        lock(&self.state).listen_calls.clone()
    }

    /// Whether something listens on `address`
    pub fn is_listening(&self, address: &str) -> bool {
        lock(&self.state).listeners.contains_key(address)
    }

    /// Kill the listener on `address` as if the network dropped it
    ///
    /// Its `accept` returns `None` from then on. Returns whether something was
    /// listening.
    pub fn drop_listener(&self, address: &str) -> bool {
        match lock(&self.state).listeners.remove(address) {
            Some(bound) => {
                bound.closed.cancel();
                true
            }
            None => false,
        }
    }

    /// Dial `address` and send one request
    pub async fn call(&self, address: &str, request: Request) -> Result<Response, TransportError> {
        let client = self.dial(address).await?;
        client.call(request).await
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &str {
        "mock"
    }

    async fn listen(&self, address: &str) -> Result<Box<dyn Listener>, TransportError> {
        let mut state = lock(&self.state);
        state.listen_calls.push(address.to_string());

        if state.fail_listen {
            return Err(TransportError::Listen {
                address: address.to_string(),
                reason: "injected failure".into(),
            });
        }

        let addr = if address.ends_with(":0") {
            let port = FIRST_EPHEMERAL_PORT.saturating_add(state.next_port);
            state.next_port = state.next_port.wrapping_add(1);
            format!("mock:{}", port)
        } else {
            address.to_string()
        };
        if state.listeners.contains_key(&addr) {
            return Err(TransportError::Listen {
                address: addr,
                reason: "address in use".into(),
            });
        }

        let (sender, rx) = mpsc::channel(QUEUE_DEPTH);
        let closed = CancellationToken::new();
        state.listeners.insert(
            addr.clone(),
            Bound {
                sender,
                closed: closed.clone(),
            },
        );

        Ok(Box::new(MockListener {
            addr,
            rx: tokio::sync::Mutex::new(rx),
            closed,
            state: Arc::clone(&self.state),
        }))
    }

    async fn dial(&self, address: &str) -> Result<Box<dyn Client>, TransportError> {
        let sender = lock(&self.state)
            .listeners
            .get(address)
            .map(|bound| bound.sender.clone());
        match sender {
            Some(sender) => Ok(Box::new(MockClient { sender })),
            None => Err(TransportError::Dial {
                address: address.to_string(),
                reason: "nothing listening".into(),
            }),
        }
    }
}

struct MockListener {
    addr: String,
    rx: tokio::sync::Mutex<mpsc::Receiver<Exchange>>,
    closed: CancellationToken,
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl Listener for MockListener {
    fn addr(&self) -> String {
        self.addr.clone()
    }

    async fn accept(&self) -> Result<Option<Exchange>, TransportError> {
        if self.closed.is_cancelled() {
            return Ok(None);
        }

        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Ok(None),
            exchange = rx.recv() => Ok(exchange),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.cancel();
        let mut state = lock(&self.state);
        // the address may already belong to a newer listener
        if state
            .listeners
            .get(&self.addr)
            .is_some_and(|bound| bound.closed.is_cancelled())
        {
            state.listeners.remove(&self.addr);
        }
        Ok(())
    }
}

struct MockClient {
    sender: mpsc::Sender<Exchange>,
}

#[async_trait]
impl Client for MockClient {
    async fn call(&self, request: Request) -> Result<Response, TransportError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Exchange::new(request, Box::new(OneshotResponder(tx))))
            .await
            .map_err(|_| TransportError::Closed)?;

        rx.await.map_err(|_| TransportError::Closed)
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

struct OneshotResponder(oneshot::Sender<Response>);

#[async_trait]
impl Responder for OneshotResponder {
    async fn respond(self: Box<Self>, response: Response) -> Result<(), TransportError> {
        self.0.send(response).map_err(|_| TransportError::Closed)
    }
}
