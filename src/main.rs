//! Media-relay dispatcher entry point
//!
//! Parses CLI flags, loads configuration with the usual CLI > file >
//! environment > defaults priority, initializes tracing, builds the
//! dispatcher, and runs it until a shutdown signal arrives.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mediaproxy_dispatcher::config::ConfigManager;
use mediaproxy_dispatcher::Dispatcher;

/// CLI arguments for the media-relay dispatcher.
#[derive(Parser, Debug)]
#[command(name = "dispatcher")]
#[command(about = "Media-relay dispatcher: pins SIP dialogs to media relays")]
#[command(version)]
pub struct CliArgs {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml", help = "Path to configuration file")]
    pub config: PathBuf,

    /// Relay-facing listen address (overrides config file)
    #[arg(long, help = "Relay listen address (e.g., 0.0.0.0:12045)")]
    pub listen: Option<String>,

    /// Management listen address (overrides config file)
    #[arg(long, help = "Management listen address (e.g., 127.0.0.1:12046)")]
    pub listen_management: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", help = "Log level")]
    pub log_level: String,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    init_tracing(&args)?;

    info!("starting media-relay dispatcher v{}", env!("CARGO_PKG_VERSION"));

    let config_path = if args.config.exists() {
        Some(args.config.clone())
    } else {
        None
    };

    let mut config = if let Some(path) = &config_path {
        ConfigManager::load_from_file(path)?
    } else {
        info!("config file {} not found, checking environment variables", args.config.display());
        ConfigManager::load_from_env()?
    };

    config.merge_with_cli_args(args.listen.as_deref(), args.listen_management.as_deref(), Some(&args.log_level));

    config.validate().context("final configuration validation failed")?;

    if args.validate_config {
        info!("configuration is valid");
        info!("  relay listen: {}", config.server.listen);
        info!("  management listen: {}", config.server.listen_management);
        info!("  SIP-proxy socket: {}", config.server.socket_path.display());
        info!("  accounting sinks: {:?}", config.accounting.sinks);
        return Ok(());
    }

    info!("relay listen: {}", config.server.listen);
    info!("management listen: {} (tls={})", config.server.listen_management, config.server.management_use_tls);
    info!("SIP-proxy socket: {}", config.server.socket_path.display());

    let dispatcher = Dispatcher::new(config, config_path)?;

    info!("media-relay dispatcher ready");
    info!("press Ctrl+C or send SIGHUP/SIGINT/SIGTERM to shut down gracefully");

    dispatcher.run().await?;

    info!("dispatcher shutdown complete");
    Ok(())
}

/// Initialize the tracing subscriber: `RUST_LOG` if set, else `--log-level`
/// (or `debug` when `--verbose` is passed).
fn init_tracing(args: &CliArgs) -> Result<()> {
    let log_level = if args.verbose { "debug" } else { &args.log_level };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true),
        )
        .with(env_filter)
        .init();

    Ok(())
}
