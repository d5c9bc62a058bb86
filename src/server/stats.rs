//! Dispatch statistics

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters updated by the dispatcher
#[derive(Debug, Default)]
pub struct DispatchStats {
    events_received: AtomicU64,
    events_acked: AtomicU64,
    events_nacked: AtomicU64,
    events_unhandled: AtomicU64,
    events_failed: AtomicU64,
    requests_served: AtomicU64,
    requests_failed: AtomicU64,
    panics: AtomicU64,
}

/// Point-in-time copy of [`DispatchStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Broker deliveries received
    pub events_received: u64,
    /// Deliveries acked by the dispatcher
    pub events_acked: u64,
    /// Deliveries nacked by the dispatcher
    pub events_nacked: u64,
    /// Deliveries with no matching subscriber
    pub events_unhandled: u64,
    /// Deliveries whose handler failed
    pub events_failed: u64,
    /// Requests answered with a success status
    pub requests_served: u64,
    /// Requests answered with an error status
    pub requests_failed: u64,
    /// Handler invocations that panicked
    pub panics: u64,
}

impl DispatchStats {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn event_received(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn event_acked(&self) {
        self.events_acked.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn event_nacked(&self) {
        self.events_nacked.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn event_unhandled(&self) {
        self.events_unhandled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn event_failed(&self) {
        self.events_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn request_done(&self, ok: bool) {
        if ok {
            self.requests_served.fetch_add(1, Ordering::Relaxed);
        } else {
            self.requests_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn panicked(&self) {
        self.panics.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current values
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            events_received: self.events_received.load(Ordering::Relaxed),
            events_acked: self.events_acked.load(Ordering::Relaxed),
            events_nacked: self.events_nacked.load(Ordering::Relaxed),
            events_unhandled: self.events_unhandled.load(Ordering::Relaxed),
            events_failed: self.events_failed.load(Ordering::Relaxed),
            requests_served: self.requests_served.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            panics: self.panics.load(Ordering::Relaxed),
        }
    }
}
