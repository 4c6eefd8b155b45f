//! SIP-proxy control channel (C4a)
//!
//! A Unix-domain socket the SIP proxy connects to and sends multi-line
//! requests over: a command name line, zero or more `key: value` header
//! lines, then a blank line terminating the request. A connection may send
//! any number of requests; each gets exactly one reply line back. Mirrors
//! `OpenSIPSControlProtocol`.

use crate::ingress::ConnectionTracker;
use crate::relay::protocol::Command;
use crate::router::DispatchHandle;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

/// Accept SIP-proxy connections on `socket_path` until `shutdown` fires.
/// The socket file is removed first if present, and removed again on the
/// way out.
pub async fn run(
    socket_path: PathBuf,
    dispatch: DispatchHandle,
    tracker: ConnectionTracker,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> crate::Result<()> {
    if socket_path.exists() {
        std::fs::remove_file(&socket_path).map_err(|e| {
            anyhow::anyhow!("failed to remove stale socket at {}: {e}", socket_path.display())
        })?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }

    let listener = UnixListener::bind(&socket_path)
        .map_err(|e| anyhow::anyhow!("failed to bind SIP-proxy socket at {}: {e}", socket_path.display()))?;
    tracing::info!(path = %socket_path.display(), "SIP-proxy control listener ready");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("SIP-proxy control listener shutting down");
                    break;
                }
            }
            accepted = listener.accept() => {
                let (stream, _addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!("failed to accept SIP-proxy connection: {}", e);
                        continue;
                    }
                };
                let dispatch = dispatch.clone();
                let guard = tracker.connected();
                let conn_shutdown = shutdown.clone();
                tokio::spawn(async move {
                    handle_connection(stream, dispatch, conn_shutdown).await;
                    drop(guard);
                });
            }
        }
    }

    remove_socket(&socket_path);
    Ok(())
}

fn remove_socket(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("failed to remove SIP-proxy socket {}: {}", path.display(), e);
        }
    }
}

async fn handle_connection(stream: UnixStream, dispatch: DispatchHandle, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let mut request_lines: Vec<String> = Vec::new();
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
                match line {
                    Ok(Some(line)) => {
                        if line.is_empty() {
                            if !request_lines.is_empty() {
                                let request = std::mem::take(&mut request_lines);
                                in_progress += 1;
                                let reply = process_request(request, &dispatch).await;
                                in_progress -= 1;
                                if write_half.write_all(format!("{reply}\n").as_bytes()).await.is_err() {
                                    break;
                                }
                                if pending_close && in_progress == 0 {
                                    break;
                                }
                            }
                        } else if !line.ends_with(": ") {
                            request_lines.push(line);
                        }
                    }
                    Ok(None) => break,
                    Err(_) => break,
                }
            }
        }
    }
}

async fn process_request(lines: Vec<String>, dispatch: &DispatchHandle) -> String {
    let command = match Command::from_lines(&lines) {
        Ok(command) => command,
        Err(e) => {
            tracing::error!("failed to parse request from SIP proxy: {}", e);
            return "error".to_string();
        }
    };
    if command.call_id().is_none() {
        tracing::error!("request from OpenSIPS is missing the call_id header");
        return "error".to_string();
    }

    match dispatch.send_command(command).await {
        Ok(reply) => reply,
        Err(e) => {
            tracing::error!("{}", e);
            "error".to_string()
        }
    }
}
