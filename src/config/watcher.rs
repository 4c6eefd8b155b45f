//! Configuration File Watcher
//!
//! Watches the configuration file for changes and notifies subscribers so
//! that safe-to-change-live settings (timers, monitoring, accounting sinks)
//! can be re-applied without a restart. Listener addresses, the Unix socket
//! path, and TLS material are not reloaded live: a change to any of those
//! is logged and otherwise ignored, since the sockets they govern are
//! already bound.

use super::Config;
use crate::Result;
use anyhow::Context;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};

/// A reload attempt, successful or not, broadcast to subscribers.
#[derive(Debug, Clone)]
pub enum ConfigChangeEvent {
    /// The file was reparsed and validated successfully.
    Reloaded(Box<Config>),
    /// The file changed but failed to parse or validate; the previous
    /// configuration remains in effect.
    Rejected(String),
}

/// Watches a configuration file for writes and broadcasts [`ConfigChangeEvent`]s.
pub struct ConfigWatcher {
    path: PathBuf,
    tx: broadcast::Sender<ConfigChangeEvent>,
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    /// Start watching `path`. The returned watcher must be kept alive for
    /// notifications to keep arriving; subscribe to changes with
    /// [`Self::subscribe`].
    pub fn spawn(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (tx, _rx) = broadcast::channel(8);
        let (std_tx, std_rx) = std_mpsc::channel::<notify::Result<Event>>();

        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = std_tx.send(res);
        })
        .context("failed to create configuration file watcher")?;

        watcher
            .watch(&path, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch configuration file: {}", path.display()))?;

        let watch_path = path.clone();
        let event_tx = tx.clone();
        std::thread::spawn(move || {
            handle_file_events(watch_path, std_rx, event_tx);
        });

        Ok(Self {
            path,
            tx,
            _watcher: watcher,
        })
    }

    /// Re-read and re-parse the watched file right now, without waiting for
    /// a filesystem event. Used by the management `reload` command.
    pub fn reload(&self) -> ConfigChangeEvent {
        match super::ConfigManager::load_from_file(&self.path) {
            Ok(config) => ConfigChangeEvent::Reloaded(Box::new(config)),
            Err(e) => ConfigChangeEvent::Rejected(format!("{e:#}")),
        }
    }

    /// Subscribe to configuration changes as a stream, matching the
    /// teacher's `ConfigWatcher::subscribe` shape.
    pub fn subscribe(&self) -> BroadcastStream<ConfigChangeEvent> {
        BroadcastStream::new(self.tx.subscribe())
    }
}

/// Debounces filesystem events arriving on `std_rx` and reloads the config
/// at `path`, publishing the outcome to `event_tx`. Runs on its own OS
/// thread because `notify`'s callback is synchronous.
fn handle_file_events(
    path: PathBuf,
    std_rx: std_mpsc::Receiver<notify::Result<Event>>,
    event_tx: broadcast::Sender<ConfigChangeEvent>,
) {
    const DEBOUNCE: Duration = Duration::from_millis(200);

    while let Ok(res) = std_rx.recv() {
        let event = match res {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("configuration watcher error: {}", e);
                continue;
            }
        };

        if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
            continue;
        }

        // Editors often write a file in several rapid steps (truncate,
        // write, rename); wait for things to settle before reparsing.
        std::thread::sleep(DEBOUNCE);
        while std_rx.try_recv().is_ok() {}

        let outcome = match super::ConfigManager::load_from_file(&path) {
            Ok(config) => {
                tracing::info!("configuration reloaded from {}", path.display());
                ConfigChangeEvent::Reloaded(Box::new(config))
            }
            Err(e) => {
                tracing::warn!(
                    "configuration reload from {} rejected: {:#}",
                    path.display(),
                    e
                );
                ConfigChangeEvent::Rejected(format!("{e:#}"))
            }
        };

        let _ = event_tx.send(outcome);
    }
}

/// Applies incoming [`ConfigChangeEvent`]s to the live, shared configuration,
/// re-applying only the fields that are safe to change without restarting a
/// listener. Intended to be driven as a background task for the lifetime of
/// the dispatcher.
pub struct ConfigReloadService {
    current: std::sync::Arc<tokio::sync::RwLock<Config>>,
}

impl ConfigReloadService {
    pub fn new(current: std::sync::Arc<tokio::sync::RwLock<Config>>) -> Self {
        Self { current }
    }

    /// Consume change events from `stream` until it closes, applying each
    /// accepted reload's live-safe fields onto the shared configuration.
    pub async fn run(self, mut stream: BroadcastStream<ConfigChangeEvent>) {
        while let Some(next) = stream.next().await {
            match next {
                Ok(ConfigChangeEvent::Reloaded(new_config)) => {
                    self.apply(*new_config).await;
                }
                Ok(ConfigChangeEvent::Rejected(reason)) => {
                    tracing::warn!("ignoring rejected configuration reload: {}", reason);
                }
                Err(tokio_stream::wrappers::errors::BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        "configuration reload service lagged, skipped {} events",
                        skipped
                    );
                }
            }
        }
    }

    async fn apply(&self, new_config: Config) {
        let mut guard = self.current.write().await;

        if guard.server.listen != new_config.server.listen
            || guard.server.listen_management != new_config.server.listen_management
            || guard.server.socket_path != new_config.server.socket_path
            || guard.tls.cert_file != new_config.tls.cert_file
            || guard.tls.key_file != new_config.tls.key_file
        {
            tracing::warn!(
                "listener addresses, socket path, or TLS material changed on reload; \
                 these require a restart and were not applied"
            );
        }

        guard.timers = new_config.timers;
        guard.accounting = new_config.accounting.clone();
        guard.monitoring = new_config.monitoring.clone();
        guard.passport = new_config.passport.clone();
        guard.management_passport = new_config.management_passport.clone();

        tracing::info!("applied live-reloadable configuration changes");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn sample_toml() -> &'static str {
        r#"
        [server]
        listen = "0.0.0.0:12045"
        listen_management = "127.0.0.1:12046"
        management_use_tls = false
        socket_path = "/var/run/mediaproxy/dispatcher.sock"
        state_file = "/var/run/mediaproxy/dispatcher_state"
        shutdown_timeout = "30s"

        [tls]
        cert_file = "/etc/mediaproxy/tls/dispatcher.crt"
        key_file = "/etc/mediaproxy/tls/dispatcher.key"
        relay_ca_file = "/etc/mediaproxy/tls/relay_ca.crt"

        [passport]
        fingerprints = []

        [timers]
        relay_timeout = "10s"
        relay_recover_interval = "60s"
        cleanup_dead_relays_after = "6h"
        cleanup_expired_sessions_after = "24h"

        [accounting]
        sinks = ["logging"]

        [monitoring]
        log_level = "info"
        prometheus_enabled = true
        metrics_addr = "127.0.0.1:9090"
        "#
    }

    #[test]
    fn reload_accepts_valid_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(sample_toml().as_bytes()).unwrap();

        let watcher = ConfigWatcher::spawn(file.path()).unwrap();
        match watcher.reload() {
            ConfigChangeEvent::Reloaded(config) => {
                assert_eq!(config.monitoring.log_level, "info");
            }
            ConfigChangeEvent::Rejected(reason) => panic!("unexpected rejection: {reason}"),
        }
    }

    #[test]
    fn reload_rejects_invalid_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"not valid toml {{{").unwrap();

        let watcher = ConfigWatcher::spawn(file.path()).unwrap();
        match watcher.reload() {
            ConfigChangeEvent::Rejected(_) => {}
            ConfigChangeEvent::Reloaded(_) => panic!("expected rejection of invalid TOML"),
        }
    }

    #[tokio::test]
    async fn reload_service_applies_timers_but_not_listeners() {
        let initial = Config::default();
        let shared = std::sync::Arc::new(tokio::sync::RwLock::new(initial.clone()));
        let service = ConfigReloadService::new(shared.clone());

        let mut changed = initial.clone();
        changed.timers.relay_timeout = Duration::from_secs(99);
        changed.server.listen = "0.0.0.0:1".parse().unwrap();

        service.apply(changed).await;

        let guard = shared.read().await;
        assert_eq!(guard.timers.relay_timeout, Duration::from_secs(99));
        assert_eq!(guard.server.listen, initial.server.listen);
    }
}
