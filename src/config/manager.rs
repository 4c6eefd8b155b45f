//! Configuration Manager

use super::Config;
use crate::Result;
use anyhow::{bail, Context};
use std::net::SocketAddr;
use std::path::Path;

/// Loads and validates configuration from a file or from the environment.
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Config> {
        tracing::info!("Loading configuration from: {}", path.display());
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config
            .validate()
            .with_context(|| "Configuration validation failed")?;

        tracing::info!("Configuration loaded and validated successfully");
        Ok(config)
    }

    /// Load configuration from environment variables, falling back to
    /// built-in defaults for anything unset.
    pub fn load_from_env() -> Result<Config> {
        let mut config = Config::default();

        if let Ok(listen) = std::env::var("DISPATCHER_LISTEN") {
            config.server.listen = listen
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid DISPATCHER_LISTEN: {}", listen))?;
        }

        if let Ok(listen_mgmt) = std::env::var("DISPATCHER_LISTEN_MANAGEMENT") {
            config.server.listen_management = listen_mgmt
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid DISPATCHER_LISTEN_MANAGEMENT: {}", listen_mgmt))?;
        }

        if let Ok(socket_path) = std::env::var("DISPATCHER_SOCKET_PATH") {
            config.server.socket_path = socket_path.into();
        }

        if let Ok(relay_timeout) = std::env::var("DISPATCHER_RELAY_TIMEOUT") {
            config.timers.relay_timeout = humantime::parse_duration(&relay_timeout)
                .with_context(|| format!("Invalid DISPATCHER_RELAY_TIMEOUT: {}", relay_timeout))?;
        }

        if let Ok(log_level) = std::env::var("DISPATCHER_LOG_LEVEL") {
            config.monitoring.log_level = log_level;
        }

        config.validate()?;
        Ok(config)
    }
}

impl Config {
    /// Validate the configuration, rejecting values the core cannot act on.
    pub fn validate(&self) -> Result<()> {
        self.validate_server()
            .with_context(|| "Server configuration validation failed")?;
        self.validate_timers()
            .with_context(|| "Timer configuration validation failed")?;
        self.validate_accounting()
            .with_context(|| "Accounting configuration validation failed")?;
        self.validate_monitoring()
            .with_context(|| "Monitoring configuration validation failed")?;
        self.validate_tls()
            .with_context(|| "TLS configuration validation failed")?;
        Ok(())
    }

    fn validate_server(&self) -> Result<()> {
        if self.server.listen == self.server.listen_management {
            bail!("listen and listen_management must not be the same address");
        }
        if self.server.shutdown_timeout.as_secs() == 0 {
            bail!("shutdown_timeout must be greater than 0");
        }
        Ok(())
    }

    fn validate_timers(&self) -> Result<()> {
        let t = &self.timers;
        if t.relay_timeout.as_millis() == 0 {
            bail!("relay_timeout must be greater than 0");
        }
        if t.relay_recover_interval.as_millis() == 0 {
            bail!("relay_recover_interval must be greater than 0");
        }
        if t.cleanup_dead_relays_after.as_secs() == 0 {
            bail!("cleanup_dead_relays_after must be greater than 0");
        }
        if t.cleanup_expired_sessions_after.as_secs() == 0 {
            bail!("cleanup_expired_sessions_after must be greater than 0");
        }
        Ok(())
    }

    fn validate_accounting(&self) -> Result<()> {
        for name in &self.accounting.sinks {
            if !crate::accounting::is_known_sink(name) {
                bail!("Unknown accounting sink: {}", name);
            }
        }
        Ok(())
    }

    fn validate_monitoring(&self) -> Result<()> {
        let valid = ["trace", "debug", "info", "warn", "error"];
        if !valid.contains(&self.monitoring.log_level.as_str()) {
            bail!(
                "monitoring.log_level must be one of: {}",
                valid.join(", ")
            );
        }
        if self.monitoring.prometheus_enabled && self.monitoring.metrics_addr.is_none() {
            bail!("prometheus_enabled is set but metrics_addr is not configured");
        }
        Ok(())
    }

    fn validate_tls(&self) -> Result<()> {
        if self.server.management_use_tls && self.tls.management_ca_file.is_none() {
            bail!(
                "management_use_tls is set but tls.management_ca_file is not configured \
                 (required to authenticate management clients)"
            );
        }
        Ok(())
    }

    /// Apply CLI overrides, highest priority.
    pub fn merge_with_cli_args(
        &mut self,
        listen: Option<&str>,
        listen_management: Option<&str>,
        log_level: Option<&str>,
    ) {
        if let Some(listen) = listen {
            match listen.parse::<SocketAddr>() {
                Ok(addr) => {
                    self.server.listen = addr;
                    tracing::info!("CLI override: relay listen address set to {}", addr);
                }
                Err(_) => tracing::warn!("Invalid --listen address provided: {}", listen),
            }
        }

        if let Some(listen_management) = listen_management {
            match listen_management.parse::<SocketAddr>() {
                Ok(addr) => {
                    self.server.listen_management = addr;
                    tracing::info!("CLI override: management listen address set to {}", addr);
                }
                Err(_) => tracing::warn!(
                    "Invalid --listen-management address provided: {}",
                    listen_management
                ),
            }
        }

        if let Some(log_level) = log_level {
            self.monitoring.log_level = log_level.to_string();
            tracing::info!("CLI override: log level set to {}", log_level);
        }
    }
}
