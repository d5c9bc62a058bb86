//! Transport accept loop
//!
//! Pulls exchanges off the bound listener and hands each one to the
//! dispatcher on its own tracked task. When the listener dies while the
//! server is running, the loop binds a new one with backoff.
//!
//! ```text
//!   Binding ──accept──► Exchange ──spawn──► Dispatcher ──► Responder
//!      │
//!      └─ closed? ──listen again (backoff)──► watch<String> ──► Announcer
//! ```

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::transport::{Exchange, Listener, Transport, TransportError};

use super::dispatcher::Dispatcher;
use super::supervisor::Backoff;

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// The listener currently bound for the server
///
/// Holds the configured address so the listener can be bound again, and
/// publishes every bound address on a watch channel.
pub(crate) struct Binding {
    transport: Arc<dyn Transport>,
    address: String,
    listener: Mutex<Arc<dyn Listener>>,
    bound: watch::Sender<String>,
}

impl Binding {
    /// Listen on `address`
    pub(crate) async fn bind(
        transport: Arc<dyn Transport>,
        address: &str,
    ) -> Result<Arc<Self>, TransportError> {
        let listener: Arc<dyn Listener> = Arc::from(transport.listen(address).await?);
        let (bound, _) = watch::channel(listener.addr());

        Ok(Arc::new(Self {
            transport,
            address: address.to_string(),
            listener: Mutex::new(listener),
            bound,
        }))
    }

    pub(crate) fn listener(&self) -> Arc<dyn Listener> {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Address of the current listener
    pub(crate) fn addr(&self) -> String {
        self.bound.borrow().clone()
    }

    /// Follow the bound address
    pub(crate) fn watch(&self) -> watch::Receiver<String> {
        self.bound.subscribe()
    }

    pub(crate) async fn close(&self) -> Result<(), TransportError> {
        self.listener().close().await
    }

    async fn rebind(&self) -> Result<Arc<dyn Listener>, TransportError> {
        let listener = self.transport.listen(&self.address).await?;
        let listener: Arc<dyn Listener> = Arc::from(listener);

        *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&listener);
        self.bound.send_replace(listener.addr());
        Ok(listener)
    }
}

/// Spawn the accept loop; it exits when `token` fires
pub(crate) fn spawn_accept_loop(
    binding: Arc<Binding>,
    dispatcher: Arc<Dispatcher>,
    backoff: Backoff,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(addr = %binding.addr(), "Accepting requests");

        accept_loop(&binding, &dispatcher, backoff, &token).await;

        tracing::debug!(addr = %binding.addr(), "Accept loop stopped");
    })
}

async fn accept_loop(
    binding: &Binding,
    dispatcher: &Arc<Dispatcher>,
    backoff: Backoff,
    token: &CancellationToken,
) {
    let mut listener = binding.listener();

    loop {
        let accepted = tokio::select! {
            _ = token.cancelled() => return,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok(Some(exchange)) => handle_exchange(dispatcher, exchange),
            Ok(None) | Err(TransportError::Closed) => {
                if token.is_cancelled() {
                    return;
                }
                tracing::warn!(addr = %listener.addr(), "Listener closed, binding again");
                match rebind(binding, backoff, token).await {
                    Some(fresh) => listener = fresh,
                    None => return,
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to accept request");
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                }
            }
        }
    }
}

/// Returns `None` if cancelled before a listener was bound
async fn rebind(
    binding: &Binding,
    backoff: Backoff,
    token: &CancellationToken,
) -> Option<Arc<dyn Listener>> {
    let mut delay = backoff.initial_delay.max(ACCEPT_BACKOFF);
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        match binding.rebind().await {
            Ok(listener) => {
                if token.is_cancelled() {
                    if let Err(e) = listener.close().await {
                        tracing::debug!(error = %e, "Failed to close listener");
                    }
                    return None;
                }
                tracing::info!(addr = %listener.addr(), attempt = attempt, "Listener bound again");
                return Some(listener);
            }
            Err(e) => {
                tracing::warn!(
                    address = %binding.address,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Rebind failed"
                );
            }
        }

        tokio::select! {
            _ = token.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = backoff.next_delay(delay);
    }
}

fn handle_exchange(dispatcher: &Arc<Dispatcher>, exchange: Exchange) {
    let Exchange { request, responder } = exchange;
    let tracker = dispatcher.tracker().clone();
    let dispatcher = Arc::clone(dispatcher);

    tracker.spawn(async move {
        let endpoint = request.endpoint.clone();
        let serving = Arc::clone(&dispatcher);
        let response = match tokio::spawn(async move { serving.dispatch_request(request).await })
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(endpoint = %endpoint, error = %e, "Request dispatch failed");
                dispatcher.failure_response()
            }
        };

        tracing::debug!(
            endpoint = %endpoint,
            status = %response.status,
            "Request served"
        );

        if let Err(e) = responder.respond(response).await {
            tracing::debug!(endpoint = %endpoint, error = %e, "Failed to send response");
        }
    });
}
