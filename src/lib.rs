//! Media-relay dispatcher
//!
//! Sits between a SIP proxy and a fleet of media-relay nodes. For each
//! incoming dialog it pins a call-id to a relay, forwards commands to it,
//! and tracks the resulting session through to removal, timeout, or loss
//! of the relay connection.

pub mod accounting;
pub mod config;
pub mod dispatcher;
pub mod ingress;
pub mod metrics;
pub mod relay;
pub mod router;
pub mod shutdown;
pub mod sip_proxy;
pub mod tls;

pub use config::Config;
pub use dispatcher::Dispatcher;
pub use shutdown::ShutdownCoordinator;

/// Common error type used throughout the dispatcher.
pub type Result<T> = anyhow::Result<T>;
