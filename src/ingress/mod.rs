//! Ingress channels (C4)
//!
//! Two listeners accept commands from outside the relay fleet: the
//! SIP-proxy control channel over a Unix-domain socket
//! ([`opensips::run`]), which accepts multi-line requests terminated by a
//! blank line, and the management channel over TCP or TLS
//! ([`management::run`]), which accepts one command per line. Both track
//! in-flight requests per connection so a graceful shutdown can close idle
//! connections immediately and wait only on ones mid-request, mirroring
//! the source dispatcher's `ControlFactory`.

pub mod management;
pub mod opensips;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Tracks how many connections an ingress listener currently has open, so
/// that shutdown can wait for them to reach zero.
#[derive(Clone, Default)]
pub struct ConnectionTracker {
    count: Arc<AtomicUsize>,
    all_closed: Arc<Notify>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connected(&self) -> ConnectionGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard { tracker: self.clone() }
    }

    /// Wait until every tracked connection has disconnected.
    pub async fn wait_for_empty(&self) {
        loop {
            // Register as a waiter before checking the count: a guard
            // dropping (and calling `notify_waiters()`) between the check
            // and the `.await` would otherwise be missed and this would
            // block until the caller's own timeout instead of returning.
            let notified = self.all_closed.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Held for the lifetime of one accepted connection; decrements the
/// tracker's count and wakes any waiter when dropped.
pub struct ConnectionGuard {
    tracker: ConnectionTracker,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.tracker.count.fetch_sub(1, Ordering::SeqCst);
        self.tracker.all_closed.notify_waiters();
    }
}
