//! Prometheus metrics
//!
//! The source dispatcher has no metrics endpoint; this is ambient
//! observability carried over from the teacher regardless, using the same
//! raw-TCP HTTP responder and `prometheus` registry style as its
//! `metrics::server`/`metrics::collector`.

use prometheus::{Counter, Gauge, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// The dispatcher's Prometheus metrics, registered once at startup.
pub struct Metrics {
    registry: Registry,
    pub active_relays: Gauge,
    pub active_sessions: Gauge,
    pub relay_requests_total: IntCounterVec,
    pub expired_sessions_swept_total: Counter,
    pub dead_relay_sweeps_total: Counter,
}

impl Metrics {
    pub fn new() -> crate::Result<Self> {
        let registry = Registry::new();

        let active_relays = Gauge::new("dispatcher_active_relays", "Number of relays currently connected")?;
        let active_sessions = Gauge::new("dispatcher_active_sessions", "Number of sessions currently tracked")?;
        let relay_requests_total = IntCounterVec::new(
            Opts::new("dispatcher_relay_requests_total", "Relay commands issued, by command and outcome"),
            &["command", "outcome"],
        )?;
        let expired_sessions_swept_total = Counter::new(
            "dispatcher_expired_sessions_swept_total",
            "Sessions purged by the periodic expired-session sweep",
        )?;
        let dead_relay_sweeps_total = Counter::new(
            "dispatcher_dead_relay_sweeps_total",
            "Times a disconnected relay's sessions were purged after the cleanup grace period",
        )?;

        registry.register(Box::new(active_relays.clone()))?;
        registry.register(Box::new(active_sessions.clone()))?;
        registry.register(Box::new(relay_requests_total.clone()))?;
        registry.register(Box::new(expired_sessions_swept_total.clone()))?;
        registry.register(Box::new(dead_relay_sweeps_total.clone()))?;

        Ok(Self {
            registry,
            active_relays,
            active_sessions,
            relay_requests_total,
            expired_sessions_swept_total,
            dead_relay_sweeps_total,
        })
    }

    pub fn export_prometheus(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        encoder.encode_to_string(&families).unwrap_or_default()
    }

    /// Record the outcome of one relay command, labeled by command name and
    /// `success`/`error`.
    pub fn record_relay_request(&self, command: &str, success: bool) {
        let outcome = if success { "success" } else { "error" };
        self.relay_requests_total.with_label_values(&[command, outcome]).inc();
    }

    pub fn set_active_relays(&self, n: usize) {
        self.active_relays.set(n as f64);
    }

    pub fn set_active_sessions(&self, n: usize) {
        self.active_sessions.set(n as f64);
    }

    pub fn inc_expired_sessions_swept(&self, n: usize) {
        self.expired_sessions_swept_total.inc_by(n as f64);
    }

    pub fn inc_dead_relay_sweep(&self) {
        self.dead_relay_sweeps_total.inc();
    }
}

/// Raw-TCP HTTP server exposing `/metrics` and `/health`, in the same style
/// as the teacher's hand-rolled `MetricsServer` rather than pulling in a
/// full HTTP framework for two endpoints.
pub struct MetricsServer {
    metrics: Arc<Metrics>,
    bind_addr: std::net::SocketAddr,
}

impl MetricsServer {
    pub fn new(metrics: Arc<Metrics>, bind_addr: std::net::SocketAddr) -> Self {
        Self { metrics, bind_addr }
    }

    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> crate::Result<()> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(|e| anyhow::anyhow!("failed to bind metrics listener on {}: {e}", self.bind_addr))?;
        tracing::info!(addr = %self.bind_addr, "metrics server started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            let metrics = self.metrics.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_request(stream, metrics).await {
                                    tracing::warn!(client = %addr, "failed to handle metrics request: {}", e);
                                }
                            });
                        }
                        Err(e) => tracing::warn!("failed to accept metrics connection: {}", e),
                    }
                }
            }
        }
    }
}

async fn handle_request(mut stream: TcpStream, metrics: Arc<Metrics>) -> crate::Result<()> {
    let mut buffer = [0u8; 1024];
    let bytes_read = stream.read(&mut buffer).await?;
    if bytes_read == 0 {
        return Ok(());
    }
    let request = String::from_utf8_lossy(&buffer[..bytes_read]);

    let response = if request.starts_with("GET /metrics") {
        let body = metrics.export_prometheus();
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        )
    } else if request.starts_with("GET /health") {
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\nOK".to_string()
    } else {
        "HTTP/1.1 404 Not Found\r\nContent-Type: text/plain\r\nContent-Length: 9\r\n\r\nNot Found".to_string()
    };

    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_without_conflict() {
        let metrics = Metrics::new().unwrap();
        let exported = metrics.export_prometheus();
        assert!(exported.contains("dispatcher_active_relays"));
    }
}
