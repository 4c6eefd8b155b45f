//! Management control channel (C4b)
//!
//! A single-line-command interface, over plain TCP or mutual TLS depending
//! on configuration: `quit`/`exit` closes the connection, `summary` and
//! `sessions` fan a query out across every connected relay, `version`
//! echoes the dispatcher's version, anything else is an error. Mirrors
//! `ManagementControlProtocol`.

use crate::ingress::ConnectionTracker;
use crate::router::DispatchHandle;
use crate::tls::CertPolicy;
use rustls_pki_types::CertificateDer;
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

/// The dispatcher's own version, echoed back to the `version` command.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Accept management connections on `addr`, either in the clear or over
/// TLS depending on `acceptor`, until `shutdown` fires.
pub async fn run(
    addr: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    passport: CertPolicy,
    dispatch: DispatchHandle,
    tracker: ConnectionTracker,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> crate::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind management listener on {addr}: {e}"))?;
    tracing::info!(%addr, tls = acceptor.is_some(), "management listener ready");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("management listener shutting down");
                    return Ok(());
                }
            }
            accepted = listener.accept() => {
                let (tcp_stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!("failed to accept management connection: {}", e);
                        continue;
                    }
                };

                let dispatch = dispatch.clone();
                let guard = tracker.connected();
                let conn_shutdown = shutdown.clone();
                let acceptor = acceptor.clone();
                let passport = passport.clone();

                tokio::spawn(async move {
                    accept_one(tcp_stream, peer_addr, acceptor, passport, dispatch, conn_shutdown).await;
                    drop(guard);
                });
            }
        }
    }
}

async fn accept_one(
    tcp_stream: TcpStream,
    peer_addr: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    passport: CertPolicy,
    dispatch: DispatchHandle,
    shutdown: tokio::sync::watch::Receiver<bool>,
) {
    match acceptor {
        Some(acceptor) => {
            let tls_stream = match acceptor.accept(tcp_stream).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(peer = %peer_addr, "TLS handshake with management client failed: {}", e);
                    return;
                }
            };

            let peer_cert: Option<CertificateDer<'static>> = tls_stream
                .get_ref()
                .1
                .peer_certificates()
                .and_then(|certs| certs.first().cloned());
            if !passport.accept(peer_cert.as_ref()) {
                tracing::warn!(peer = %peer_addr, "management peer certificate not accepted, closing");
                return;
            }

            handle_connection(tls_stream, dispatch, shutdown).await;
        }
        None => {
            handle_connection(tcp_stream, dispatch, shutdown).await;
        }
    }
}

async fn handle_connection<S: AsyncRead + AsyncWrite + Unpin>(
    stream: S,
    dispatch: DispatchHandle,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut lines = BufReader::new(read_half).lines();

    let mut in_progress: u32 = 0;
    let mut pending_close = false;

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    if in_progress == 0 {
                        break;
                    }
                    pending_close = true;
                }
            }

            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) | Err(_) => break,
                };

                if line == "quit" || line == "exit" {
                    break;
                }

                in_progress += 1;
                let reply = handle_command(&line, &dispatch).await;
                in_progress -= 1;

                if write_half.write_all(format!("{reply}\n").as_bytes()).await.is_err() {
                    break;
                }
                if pending_close && in_progress == 0 {
                    break;
                }
            }
        }
    }
}

async fn handle_command(line: &str, dispatch: &DispatchHandle) -> String {
    match line {
        "summary" => dispatch.get_summary().await,
        "sessions" => dispatch.get_statistics().await,
        "version" => VERSION.to_string(),
        other => {
            tracing::error!("unknown command on management interface: {}", other);
            "error".to_string()
        }
    }
}
