//! Broker connection supervisor
//!
//! Checks the broker connection periodically. When it is lost the supervisor
//! drops the dead subscription handles, reconnects with exponential backoff
//! and subscribes every routed topic again.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::broker::Broker;

use super::routes::Routes;
use super::subscriptions::Subscriptions;

/// Reconnect timing
#[derive(Debug, Clone, Copy)]
pub(crate) struct Backoff {
    pub(crate) check_interval: Duration,
    pub(crate) initial_delay: Duration,
    pub(crate) max_delay: Duration,
}

impl Backoff {
    pub(crate) fn next_delay(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_delay)
    }
}

pub(crate) struct Supervisor {
    broker: Arc<dyn Broker>,
    subscriptions: Arc<Subscriptions>,
    routes: Arc<Routes>,
    backoff: Backoff,
}

impl Supervisor {
    pub(crate) fn new(
        broker: Arc<dyn Broker>,
        subscriptions: Arc<Subscriptions>,
        routes: Arc<Routes>,
        backoff: Backoff,
    ) -> Self {
        Self {
            broker,
            subscriptions,
            routes,
            backoff,
        }
    }

    /// Run until `token` fires; `None` when checks are disabled
    pub(crate) fn spawn(self, token: CancellationToken) -> Option<JoinHandle<()>> {
        let period = self.backoff.check_interval;
        if period.is_zero() {
            return None;
        }

        Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                if !self.broker.is_connected() {
                    tracing::warn!(broker = %self.broker.name(), "Broker connection lost");
                    self.subscriptions.forget_all().await;

                    if !self.reconnect(&token).await {
                        break;
                    }
                }

                self.subscriptions.resync(&self.routes).await;
            }

            tracing::debug!("Broker supervisor stopped");
        }))
    }

    /// Returns false if cancelled before the broker came back
    async fn reconnect(&self, token: &CancellationToken) -> bool {
        let mut delay = self.backoff.initial_delay;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            match self.broker.connect().await {
                Ok(()) => {
                    tracing::info!(
                        broker = %self.broker.name(),
                        attempt = attempt,
                        "Broker reconnected"
                    );
                    return true;
                }
                Err(e) => {
                    tracing::warn!(
                        broker = %self.broker.name(),
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Broker reconnect failed"
                    );
                }
            }

            tokio::select! {
                _ = token.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = self.backoff.next_delay(delay);
        }
    }
}
