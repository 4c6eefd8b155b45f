//! Configuration Types

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level dispatcher configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub tls: TlsConfig,
    pub passport: CertPolicyConfig,
    pub management_passport: Option<CertPolicyConfig>,
    pub timers: TimersConfig,
    pub accounting: AccountingConfig,
    pub monitoring: MonitoringConfig,
}

/// Listener addresses and filesystem paths.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Relay-facing TLS listener address.
    pub listen: SocketAddr,
    /// Management listener address (TCP or TLS, see `management_use_tls`).
    pub listen_management: SocketAddr,
    pub management_use_tls: bool,
    /// Unix-domain socket path the SIP proxy connects to.
    pub socket_path: PathBuf,
    /// Path the session table is persisted to at graceful shutdown.
    pub state_file: PathBuf,
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

/// TLS identity material for the dispatcher's own listeners.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    /// Root(s) trusted to authenticate relay client certificates.
    pub relay_ca_file: PathBuf,
    /// Root(s) trusted to authenticate management client certificates,
    /// only consulted when `management_use_tls` is set.
    pub management_ca_file: Option<PathBuf>,
}

/// An accept/reject predicate over a peer certificate ("passport" in the
/// source dispatcher). An empty `fingerprints` list accepts any peer the
/// TLS handshake already authenticated; a non-empty list additionally
/// requires the peer's certificate SHA-256 fingerprint (hex, lowercase)
/// to appear in it.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CertPolicyConfig {
    #[serde(default)]
    pub fingerprints: Vec<String>,
}

/// Timeouts and intervals governing relay liveness and session cleanup.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimersConfig {
    /// Per-request deadline on a relay connection.
    #[serde(with = "humantime_serde")]
    pub relay_timeout: Duration,
    /// Grace period after a request timeout before the connection is
    /// forcibly closed absent a heartbeat.
    #[serde(with = "humantime_serde")]
    pub relay_recover_interval: Duration,
    /// Delay before purging sessions pinned to a relay that disconnected.
    #[serde(with = "humantime_serde")]
    pub cleanup_dead_relays_after: Duration,
    /// TTL for sessions whose `expire_time` is set but whose `remove`
    /// confirmation never arrived.
    #[serde(with = "humantime_serde")]
    pub cleanup_expired_sessions_after: Duration,
}

/// Names of the accounting sinks to load, resolved against the registry
/// in [`crate::accounting`].
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AccountingConfig {
    pub sinks: Vec<String>,
}

/// Logging and metrics.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    pub log_level: String,
    pub prometheus_enabled: bool,
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                listen: "0.0.0.0:12045".parse().unwrap(),
                listen_management: "127.0.0.1:12046".parse().unwrap(),
                management_use_tls: false,
                socket_path: PathBuf::from("/var/run/mediaproxy/dispatcher.sock"),
                state_file: PathBuf::from("/var/run/mediaproxy/dispatcher_state"),
                shutdown_timeout: Duration::from_secs(30),
            },
            tls: TlsConfig {
                cert_file: PathBuf::from("/etc/mediaproxy/tls/dispatcher.crt"),
                key_file: PathBuf::from("/etc/mediaproxy/tls/dispatcher.key"),
                relay_ca_file: PathBuf::from("/etc/mediaproxy/tls/relay_ca.crt"),
                management_ca_file: None,
            },
            passport: CertPolicyConfig::default(),
            management_passport: None,
            timers: TimersConfig {
                relay_timeout: Duration::from_secs(10),
                relay_recover_interval: Duration::from_secs(60),
                cleanup_dead_relays_after: Duration::from_secs(6 * 3600),
                cleanup_expired_sessions_after: Duration::from_secs(24 * 3600),
            },
            accounting: AccountingConfig {
                sinks: vec!["logging".to_string()],
            },
            monitoring: MonitoringConfig {
                log_level: "info".to_string(),
                prometheus_enabled: true,
                metrics_addr: Some("127.0.0.1:9090".parse().unwrap()),
            },
        }
    }
}
