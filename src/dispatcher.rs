//! Process wiring and graceful shutdown (C9)
//!
//! Builds every collaborator from configuration, starts the three
//! listeners, and on a shutdown signal walks through the same ordering as
//! the source dispatcher's `_shutdown`: stop accepting new ingress
//! connections, let in-flight ones finish, close relay connections and
//! persist the session table, then stop accounting.

use crate::accounting::AccountingRegistry;
use crate::config::{Config, ConfigReloadService, ConfigWatcher};
use crate::ingress::ConnectionTracker;
use crate::metrics::{Metrics, MetricsServer};
use crate::router::DispatchHandle;
use crate::shutdown::ShutdownCoordinator;
use crate::sip_proxy::{LoggingSipProxyManagement, SipProxyManagement};
use crate::tls::{CertPolicy, TlsMaterial};
use crate::{ingress, relay, router};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_rustls::TlsAcceptor;

/// Owns every long-lived collaborator and drives the dispatcher's run loop.
pub struct Dispatcher {
    config_path: Option<PathBuf>,
    shared_config: Arc<RwLock<Config>>,
    dispatch: DispatchHandle,
    accounting: Arc<AccountingRegistry>,
    metrics: Arc<Metrics>,
    shutdown: ShutdownCoordinator,
    opensips_tracker: ConnectionTracker,
    management_tracker: ConnectionTracker,
}

impl Dispatcher {
    /// Build the dispatcher from a validated configuration: loads TLS
    /// material, restores the persisted session table, and constructs the
    /// accounting registry and SIP-proxy management client. `config_path`,
    /// when set, is watched for live-reloadable changes (see
    /// [`crate::config::watcher`]).
    pub fn new(config: Config, config_path: Option<PathBuf>) -> crate::Result<Self> {
        let accounting = Arc::new(AccountingRegistry::from_names(&config.accounting.sinks)?);
        let sip_proxy: Arc<dyn SipProxyManagement> = Arc::new(LoggingSipProxyManagement);
        let metrics = Arc::new(Metrics::new()?);

        let dispatch = router::spawn(
            config.server.state_file.clone(),
            config.timers.clone(),
            accounting.clone(),
            sip_proxy,
            metrics.clone(),
        );

        let shutdown = ShutdownCoordinator::new(config.server.shutdown_timeout);
        let shared_config = Arc::new(RwLock::new(config));

        Ok(Self {
            config_path,
            shared_config,
            dispatch,
            accounting,
            metrics,
            shutdown,
            opensips_tracker: ConnectionTracker::new(),
            management_tracker: ConnectionTracker::new(),
        })
    }

    /// Start every listener, run until a shutdown signal arrives, then
    /// drive the shutdown sequence to completion.
    pub async fn run(self) -> crate::Result<()> {
        self.accounting.start().await;

        let config = self.shared_config.read().await.clone();

        let tls_material = TlsMaterial::load(&config.tls)?;
        let relay_passport = CertPolicy::new(&config.passport);
        let relay_tls = tls_material.relay_server_config()?;
        let relay_acceptor = TlsAcceptor::from(relay_tls);

        let mut tasks = tokio::task::JoinSet::new();

        // Keep the config file watcher alive for the task's lifetime; it
        // stops watching (and the reload task exits) when dropped at the
        // end of `run`.
        let _config_watcher = match &self.config_path {
            Some(path) if path.exists() => match ConfigWatcher::spawn(path) {
                Ok(watcher) => {
                    let reload_service = ConfigReloadService::new(self.shared_config.clone());
                    let stream = watcher.subscribe();
                    tasks.spawn(async move {
                        reload_service.run(stream).await;
                        Ok(())
                    });
                    Some(watcher)
                }
                Err(e) => {
                    tracing::warn!("failed to start configuration file watcher: {:#}", e);
                    None
                }
            },
            _ => None,
        };

        tasks.spawn(relay::listener::run(
            config.server.listen,
            relay_acceptor,
            relay_passport,
            self.shared_config.clone(),
            self.dispatch.clone(),
            self.shutdown.subscribe(),
        ));

        tasks.spawn(ingress::opensips::run(
            config.server.socket_path.clone(),
            self.dispatch.clone(),
            self.opensips_tracker.clone(),
            self.shutdown.subscribe(),
        ));

        let management_acceptor = if config.server.management_use_tls {
            Some(TlsAcceptor::from(tls_material.management_server_config()?))
        } else {
            None
        };
        let management_passport = config
            .management_passport
            .as_ref()
            .map(CertPolicy::new)
            .unwrap_or_default();
        tasks.spawn(ingress::management::run(
            config.server.listen_management,
            management_acceptor,
            management_passport,
            self.dispatch.clone(),
            self.management_tracker.clone(),
            self.shutdown.subscribe(),
        ));

        if config.monitoring.prometheus_enabled {
            if let Some(addr) = config.monitoring.metrics_addr {
                let metrics_server = MetricsServer::new(self.metrics.clone(), addr);
                let shutdown_rx = self.shutdown.subscribe();
                tasks.spawn(async move { metrics_server.run(shutdown_rx).await });
            }
        }

        self.shutdown.listen_for_signals().await?;

        self.shutdown_sequence().await;
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}

        Ok(())
    }

    async fn shutdown_sequence(&self) {
        let timeout = self.shutdown.timeout();

        // Listeners already stopped accepting as soon as the watch flipped;
        // this just waits for in-flight requests to finish, bounded so a
        // stuck client can never wedge shutdown indefinitely.
        if tokio::time::timeout(timeout, self.opensips_tracker.wait_for_empty())
            .await
            .is_err()
        {
            tracing::warn!("SIP-proxy control connections did not drain within {:?}", timeout);
        }
        if tokio::time::timeout(timeout, self.management_tracker.wait_for_empty())
            .await
            .is_err()
        {
            tracing::warn!("management connections did not drain within {:?}", timeout);
        }

        self.dispatch.shutdown().await;
        self.accounting.stop().await;

        self.shutdown.mark_complete();
    }
}
