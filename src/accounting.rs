//! Accounting sinks
//!
//! The source dispatcher loads accounting modules by name from config and
//! fans call statistics out to each of them whenever a session completes
//! with `start_time` set, logging and discarding any individual sink's
//! failure rather than letting it affect the others or the router.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

/// The annotated statistics payload handed to accounting sinks once a
/// session's lifetime is known to be complete.
#[derive(Debug, Clone, Serialize)]
pub struct AccountingRecord {
    pub call_id: String,
    pub dialog_id: Option<String>,
    pub from_tag: Option<String>,
    pub to_tag: Option<String>,
    pub relay_ip: String,
    pub start_time: Option<f64>,
    pub timed_out: bool,
    /// Only `Some` for records raised from the `expired` event path;
    /// absent for the plain `update`-then-`remove` path, which never
    /// computes it.
    pub all_streams_ice: Option<bool>,
    #[serde(flatten)]
    pub stats: serde_json::Value,
}

/// A pluggable destination for completed-call accounting records.
///
/// Implementations should treat `record` as best-effort: the registry logs
/// and swallows any error so that one sink can never block or fail the
/// others.
#[async_trait]
pub trait AccountingSink: Send + Sync {
    /// Human-readable name, used in logs and error messages.
    fn name(&self) -> &str;

    /// Called once before the dispatcher starts accepting connections.
    async fn start(&self) -> crate::Result<()> {
        Ok(())
    }

    /// Called once during graceful shutdown, after the last record.
    async fn stop(&self) -> crate::Result<()> {
        Ok(())
    }

    /// Record a completed call's statistics.
    async fn record(&self, record: &AccountingRecord) -> crate::Result<()>;
}

/// Sink that writes each record as a single `tracing::info!` line. This is
/// the default and the one builtin sink shipped with the dispatcher.
pub struct LoggingSink;

#[async_trait]
impl AccountingSink for LoggingSink {
    fn name(&self) -> &str {
        "logging"
    }

    async fn record(&self, record: &AccountingRecord) -> crate::Result<()> {
        tracing::info!(
            call_id = %record.call_id,
            dialog_id = ?record.dialog_id,
            relay_ip = %record.relay_ip,
            timed_out = record.timed_out,
            all_streams_ice = ?record.all_streams_ice,
            stats = %record.stats,
            "call accounting record"
        );
        Ok(())
    }
}

/// The set of accounting sink names the dispatcher knows how to construct.
/// Configuration validation rejects any name not in this list.
pub fn is_known_sink(name: &str) -> bool {
    matches!(name, "logging")
}

/// Construct a sink by name. Panics are not possible here: callers are
/// expected to have validated names with [`is_known_sink`] already, but an
/// unrecognized name still returns an error rather than panicking.
fn build_sink(name: &str) -> crate::Result<Arc<dyn AccountingSink>> {
    match name {
        "logging" => Ok(Arc::new(LoggingSink)),
        other => anyhow::bail!("unknown accounting sink: {other}"),
    }
}

/// Holds every configured accounting sink and fans calls out to all of them.
pub struct AccountingRegistry {
    sinks: Vec<Arc<dyn AccountingSink>>,
}

impl AccountingRegistry {
    /// Build a registry from the sink names listed in configuration.
    pub fn from_names(names: &[String]) -> crate::Result<Self> {
        let sinks = names
            .iter()
            .map(|name| build_sink(name))
            .collect::<crate::Result<Vec<_>>>()?;
        Ok(Self { sinks })
    }

    /// Start every sink, logging (not propagating) individual failures.
    pub async fn start(&self) {
        for sink in &self.sinks {
            if let Err(e) = sink.start().await {
                tracing::warn!("accounting sink '{}' failed to start: {:#}", sink.name(), e);
            }
        }
    }

    /// Stop every sink, logging (not propagating) individual failures.
    pub async fn stop(&self) {
        for sink in &self.sinks {
            if let Err(e) = sink.stop().await {
                tracing::warn!("accounting sink '{}' failed to stop: {:#}", sink.name(), e);
            }
        }
    }

    /// Record a completed call against every configured sink. Only called
    /// when the originating statistics carried a `start_time`, mirroring
    /// the source dispatcher's `update_statistics` guard.
    pub async fn record(&self, record: &AccountingRecord) {
        for sink in &self.sinks {
            if let Err(e) = sink.record(record).await {
                tracing::warn!(
                    "accounting sink '{}' failed to record call_id={}: {:#}",
                    sink.name(),
                    record.call_id,
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_sinks_accepted_unknown_rejected() {
        assert!(is_known_sink("logging"));
        assert!(!is_known_sink("graphite"));
    }

    #[tokio::test]
    async fn registry_builds_from_valid_names() {
        let registry = AccountingRegistry::from_names(&["logging".to_string()]).unwrap();
        registry.start().await;

        let record = AccountingRecord {
            call_id: "abc123".to_string(),
            dialog_id: Some("d1".to_string()),
            from_tag: None,
            to_tag: None,
            relay_ip: "10.0.0.1".to_string(),
            start_time: Some(1.0),
            timed_out: false,
            all_streams_ice: None,
            stats: serde_json::json!({}),
        };
        registry.record(&record).await;
        registry.stop().await;
    }

    #[test]
    fn registry_rejects_unknown_sink_name() {
        let err = AccountingRegistry::from_names(&["graphite".to_string()]).unwrap_err();
        assert!(err.to_string().contains("unknown accounting sink"));
    }
}
