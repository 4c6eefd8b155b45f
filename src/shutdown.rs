//! Graceful shutdown
//!
//! Generalizes the teacher's broadcast-based `ShutdownCoordinator` to a
//! `watch<bool>` signal, since every listener here needs to both react to
//! the transition and read "are we shutting down" at arbitrary points (a
//! `watch` gives both for free). SIGHUP, SIGINT, and SIGTERM all trigger
//! the same sequence, matching the source dispatcher's three identical
//! signal handlers.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};

/// Coordinates a single shutdown signal across every listener and the
/// final persistence step.
pub struct ShutdownCoordinator {
    tx: watch::Sender<bool>,
    complete: Arc<Notify>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            tx,
            complete: Arc::new(Notify::new()),
            timeout,
        }
    }

    /// A receiver that listeners hold and poll with `changed()`/`borrow()`.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn completion_handle(&self) -> Arc<Notify> {
        self.complete.clone()
    }

    /// Trigger shutdown directly, without waiting on a signal. Used by the
    /// management `quit`/`exit` commands in future extensions and by tests.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    /// Block until SIGHUP, SIGINT, SIGTERM, or Ctrl+C arrives, then signal
    /// every subscriber.
    pub async fn listen_for_signals(&self) -> crate::Result<()> {
        tracing::info!("listening for shutdown signals");

        #[cfg(unix)]
        {
            let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;
            let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
            let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

            tokio::select! {
                _ = sighup.recv() => tracing::info!("received SIGHUP, shutting down"),
                _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
                _ = sigint.recv() => tracing::info!("received SIGINT, shutting down"),
                _ = tokio::signal::ctrl_c() => tracing::info!("received Ctrl+C, shutting down"),
            }
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await?;
            tracing::info!("received Ctrl+C, shutting down");
        }

        self.trigger();
        Ok(())
    }

    /// Wait, up to the configured timeout plus a short buffer, for
    /// [`Self::mark_complete`] to be called.
    pub async fn wait_for_completion(&self) {
        let waited = tokio::time::timeout(self.timeout + Duration::from_secs(5), self.complete.notified()).await;
        if waited.is_err() {
            tracing::warn!("shutdown completion timed out after {:?}", self.timeout);
        }
    }

    pub fn mark_complete(&self) {
        self.complete.notify_waiters();
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_observe_trigger() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let mut rx = coordinator.subscribe();
        coordinator.trigger();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn completion_is_observed() {
        let coordinator = ShutdownCoordinator::new(Duration::from_millis(50));
        coordinator.mark_complete();
        coordinator.wait_for_completion().await;
    }
}
