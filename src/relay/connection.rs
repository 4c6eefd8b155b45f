//! Relay connection (C1)
//!
//! One task per connected relay: owns the socket, multiplexes outbound
//! commands over sequence numbers, matches responses back to callers,
//! enforces the per-request timeout, and dispatches the two unsolicited
//! event lines (`expired`, `ping`) into the dispatch actor. Mirrors the
//! source dispatcher's `RelayServerProtocol`.

use crate::config::TimersConfig;
use crate::relay::protocol::{Command, RelayError, RelayStats};
use crate::router::actor::DispatchHandle;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};
use tokio_rustls::server::TlsStream;

/// The idle poll interval used when no request timeout is pending. Keeps
/// the connection's select loop simple at the cost of an occasional
/// no-op wakeup.
const IDLE_POLL: Duration = Duration::from_secs(3600);

pub type RelayStream = TlsStream<TcpStream>;

struct PendingRequest {
    command_name: String,
    reply: oneshot::Sender<Result<String, RelayError>>,
    deadline: Instant,
}

struct OutboundRequest {
    command: Command,
    reply: oneshot::Sender<Result<String, RelayError>>,
}

/// Distinguishes one connection instance from another at the same address,
/// so the registry can tell a stale close notification from a superseded
/// connection apart from the close of the connection it currently holds.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// A cloneable, cheap-to-hold reference to one relay's live connection.
#[derive(Clone)]
pub struct RelayHandle {
    ip: IpAddr,
    id: u64,
    to_conn: mpsc::Sender<OutboundRequest>,
    active: Arc<AtomicBool>,
    close: Arc<tokio::sync::Notify>,
}

impl RelayHandle {
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    /// Opaque identity of this specific connection instance, stable across
    /// clones of the same handle but distinct from any other connection at
    /// the same address. Used to detect stale `connection_lost`
    /// notifications from a connection the registry has already replaced.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Not halting and not presently timed out: eligible as a failover
    /// candidate for a new session.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Force this connection closed, used when a relay reconnects from the
    /// same address and the old connection needs to be torn down. Mirrors
    /// `RelayFactory.new_relay`'s `connectionLost` on the superseded
    /// protocol.
    pub fn force_close(&self) {
        self.close.notify_one();
    }

    /// Issue a command and await the matching response. Fails with
    /// [`RelayError::Disconnected`] if the connection task is gone.
    pub async fn send_command(&self, command: Command) -> Result<String, RelayError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let name = command.name.clone();
        if self
            .to_conn
            .send(OutboundRequest {
                command,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return Err(disconnected(&name, self.ip));
        }
        reply_rx.await.unwrap_or_else(|_| Err(disconnected(&name, self.ip)))
    }
}

fn disconnected(command: &str, ip: IpAddr) -> RelayError {
    RelayError::Disconnected {
        command: command.to_string(),
        relay: ip.to_string(),
    }
}

/// Spawn the task owning one relay's connection. Registration with the
/// dispatch actor (replacing any prior connection at the same IP) is the
/// caller's responsibility, mirroring `RelayFactory.new_relay`.
pub fn spawn(ip: IpAddr, stream: RelayStream, timers: TimersConfig, dispatch: DispatchHandle) -> RelayHandle {
    let (tx, rx) = mpsc::channel(32);
    let active = Arc::new(AtomicBool::new(true));
    let close = Arc::new(tokio::sync::Notify::new());
    let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    let handle = RelayHandle {
        ip,
        id,
        to_conn: tx,
        active: active.clone(),
        close: close.clone(),
    };

    tokio::spawn(run_connection(ip, id, stream, timers, dispatch, rx, active, close));

    handle
}

#[allow(clippy::too_many_arguments)]
async fn run_connection(
    ip: IpAddr,
    id: u64,
    stream: RelayStream,
    timers: TimersConfig,
    dispatch: DispatchHandle,
    mut outbound: mpsc::Receiver<OutboundRequest>,
    active: Arc<AtomicBool>,
    close: Arc<tokio::sync::Notify>,
) {
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut lines = BufReader::new(read_half).lines();

    let mut pending: HashMap<u64, PendingRequest> = HashMap::new();
    let mut sequence_number: u64 = 0;
    let mut halting = false;
    let mut timedout = false;
    let mut disconnect_deadline: Option<Instant> = None;
    let mut close_reason = "connection closed by relay";

    'connection: loop {
        let next_timeout = pending.values().map(|p| p.deadline).min();
        let wake_at = match (next_timeout, disconnect_deadline) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => Instant::now() + IDLE_POLL,
        };

        tokio::select! {
            biased;

            _ = close.notified() => {
                close_reason = "relay reconnected, replacing this connection";
                break 'connection;
            }

            _ = tokio::time::sleep_until(wake_at) => {
                let now = Instant::now();
                if let Some(deadline) = disconnect_deadline {
                    if now >= deadline {
                        close_reason = "relay timed out and did not recover in time";
                        break 'connection;
                    }
                }

                let expired: Vec<u64> = pending
                    .iter()
                    .filter(|(_, p)| p.deadline <= now)
                    .map(|(seq, _)| *seq)
                    .collect();
                if !expired.is_empty() && !timedout {
                    timedout = true;
                    active.store(false, Ordering::Relaxed);
                    disconnect_deadline = Some(Instant::now() + timers.relay_recover_interval);
                }
                for seq in expired {
                    if let Some(p) = pending.remove(&seq) {
                        let _ = p.reply.send(Err(RelayError::Timeout {
                            command: p.command_name,
                            relay: ip.to_string(),
                        }));
                    }
                }
            }

            maybe_req = outbound.recv() => {
                let Some(req) = maybe_req else {
                    // Every handle was dropped. The dispatch actor still
                    // owns this connection's lifetime through
                    // `connection_lost`, so keep reading for events.
                    continue 'connection;
                };
                let seq = sequence_number;
                sequence_number += 1;
                let wire = req.command.encode(seq);
                let command_name = req.command.name.clone();
                if write_half.write_all(wire.as_bytes()).await.is_err() {
                    let _ = req.reply.send(Err(disconnected(&command_name, ip)));
                    close_reason = "write to relay failed";
                    break 'connection;
                }
                pending.insert(
                    seq,
                    PendingRequest {
                        command_name,
                        reply: req.reply,
                        deadline: Instant::now() + timers.relay_timeout,
                    },
                );
            }

            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        handle_line(
                            &line,
                            ip,
                            &dispatch,
                            &mut pending,
                            &mut halting,
                            &mut timedout,
                            &mut disconnect_deadline,
                            &active,
                            &mut write_half,
                        )
                        .await;
                    }
                    Ok(None) => {
                        close_reason = "connection closed by relay";
                        break 'connection;
                    }
                    Err(_) => {
                        close_reason = "connection reset";
                        break 'connection;
                    }
                }
            }
        }
    }

    for (_, p) in pending.drain() {
        let _ = p.reply.send(Err(disconnected(&p.command_name, ip)));
    }
    tracing::info!(relay = %ip, reason = close_reason, "relay connection closed");
    dispatch.connection_lost(ip, id).await;
}

#[allow(clippy::too_many_arguments)]
async fn handle_line<W: AsyncWrite + Unpin>(
    line: &str,
    ip: IpAddr,
    dispatch: &DispatchHandle,
    pending: &mut HashMap<u64, PendingRequest>,
    halting: &mut bool,
    timedout: &mut bool,
    disconnect_deadline: &mut Option<Instant>,
    active: &Arc<AtomicBool>,
    write_half: &mut W,
) {
    let (first, rest) = line.split_once(' ').unwrap_or((line, ""));

    match first {
        "expired" => match serde_json::from_str::<RelayStats>(rest) {
            Ok(stats) => dispatch.relay_expired(ip, stats).await,
            Err(e) => tracing::error!("error decoding JSON from relay at {}: {}", ip, e),
        },
        "ping" => {
            if *timedout {
                *timedout = false;
                active.store(!*halting, Ordering::Relaxed);
                *disconnect_deadline = None;
            }
            let _ = write_half.write_all(b"pong\n").await;
        }
        seq_str => {
            let Ok(seq) = seq_str.parse::<u64>() else {
                tracing::error!("got unexpected response from relay at {}: {}", ip, line);
                return;
            };
            let Some(p) = pending.remove(&seq) else {
                tracing::error!("got unexpected response from relay at {}: {}", ip, line);
                return;
            };

            if rest == "error" {
                let _ = p.reply.send(Err(RelayError::ErrorReply {
                    command: p.command_name,
                    relay: ip.to_string(),
                }));
            } else if rest == "halting" {
                *halting = true;
                active.store(false, Ordering::Relaxed);
                let _ = p.reply.send(Err(RelayError::Halting { relay: ip.to_string() }));
            } else if p.command_name == "remove" {
                dispatch.relay_removed(ip, rest).await;
                let _ = p.reply.send(Ok("removed".to_string()));
            } else {
                let _ = p.reply.send(Ok(rest.to_string()));
            }
        }
    }
}
