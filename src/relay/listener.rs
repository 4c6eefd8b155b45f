//! Relay-facing TLS listener
//!
//! Accepts connections from media-relay nodes, checks the configured
//! certificate policy ("passport"), and hands each accepted connection to
//! [`crate::relay::connection::spawn`] before registering it with the
//! dispatch actor. Mirrors `RelayFactory.buildProtocol`/`connectionMade`.

use crate::config::{Config, TimersConfig};
use crate::relay::connection;
use crate::router::actor::DispatchHandle;
use crate::tls::CertPolicy;
use rustls_pki_types::CertificateDer;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_rustls::TlsAcceptor;

/// Accept relay connections on `addr` until `shutdown` fires. Returns once
/// the listener socket has been closed; in-flight connections are handled
/// independently and are not waited on here (the dispatch actor's shutdown
/// sequence does that). `config` is read fresh for every accepted
/// connection, so a hot-reloaded `relay_timeout`/`relay_recover_interval`
/// applies to newly connected relays without rebinding this listener.
pub async fn run(
    addr: SocketAddr,
    acceptor: TlsAcceptor,
    passport: CertPolicy,
    config: Arc<RwLock<Config>>,
    dispatch: DispatchHandle,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> crate::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind relay listener on {addr}: {e}"))?;
    tracing::info!(%addr, "relay listener ready");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("relay listener shutting down");
                    return Ok(());
                }
            }
            accepted = listener.accept() => {
                let (tcp_stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!("failed to accept relay connection: {}", e);
                        continue;
                    }
                };
                tracing::debug!(peer = %peer_addr, "connection from relay");

                let acceptor = acceptor.clone();
                let passport = passport.clone();
                let timers = config.read().await.timers.clone();
                let dispatch = dispatch.clone();

                tokio::spawn(async move {
                    accept_one(tcp_stream, peer_addr, acceptor, passport, timers, dispatch).await;
                });
            }
        }
    }
}

async fn accept_one(
    tcp_stream: tokio::net::TcpStream,
    peer_addr: SocketAddr,
    acceptor: TlsAcceptor,
    passport: CertPolicy,
    timers: TimersConfig,
    dispatch: DispatchHandle,
) {
    let tls_stream = match acceptor.accept(tcp_stream).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(peer = %peer_addr, "TLS handshake with relay failed: {}", e);
            return;
        }
    };

    let peer_cert: Option<CertificateDer<'static>> = tls_stream
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|certs| certs.first().cloned());

    if !passport.accept(peer_cert.as_ref()) {
        tracing::warn!(peer = %peer_addr, "relay peer certificate not accepted, closing");
        return;
    }

    let ip = peer_addr.ip();
    let handle = connection::spawn(ip, tls_stream, timers, dispatch.clone());
    dispatch.new_relay(handle).await;
}
