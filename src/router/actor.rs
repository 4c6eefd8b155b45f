//! Dispatch actor (C2 relay registry + C3 session router)
//!
//! Owns both the relay registry and the session table on a single task, so
//! neither structure is ever shared behind a lock. Everything else reaches
//! it through [`DispatchHandle`], a cheap mailbox handle. This merges the
//! two responsibilities the source dispatcher keeps in one `RelayFactory`
//! class.

use crate::accounting::{AccountingRecord, AccountingRegistry};
use crate::config::TimersConfig;
use crate::metrics::Metrics;
use crate::relay::protocol::{Command, RelayError, RelayStats};
use crate::relay::RelayHandle;
use crate::router::session::{self, RelaySession};
use crate::sip_proxy::SipProxyManagement;
use rand::seq::SliceRandom;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{mpsc, oneshot};

/// How often the actor sweeps the session table for sessions whose
/// `expire_time` was set but which never received a confirming `remove`.
/// Matches the source's `RecurrentCall(600, ...)`.
pub const EXPIRED_SESSION_SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(600);

enum DispatchMsg {
    SendCommand {
        command: Command,
        reply: oneshot::Sender<Result<String, RelayError>>,
    },
    NewRelay {
        handle: RelayHandle,
    },
    ConnectionLost {
        ip: IpAddr,
        id: u64,
    },
    RelayExpired {
        ip: IpAddr,
        stats: Box<RelayStats>,
    },
    RelayRemoved {
        ip: IpAddr,
        body: String,
    },
    GetSummary {
        reply: oneshot::Sender<String>,
    },
    GetStatistics {
        reply: oneshot::Sender<String>,
    },
    CleanupDeadRelay {
        ip: IpAddr,
        generation: u64,
    },
    SweepExpiredSessions,
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    /// A spawned `update` placement succeeded against `relay_ip`; routed
    /// back through the mailbox (rather than replying to the caller
    /// directly from the spawned task) so the session table is updated
    /// before the caller can see success — otherwise a request for the
    /// same call_id queued right behind this one could race the insert.
    SessionEstablished {
        call_id: String,
        relay_ip: IpAddr,
        dialog_id: Option<String>,
        result: String,
        reply: oneshot::Sender<Result<String, RelayError>>,
    },
    /// A reconnected relay's own `sessions` view arrived; reconcile it
    /// against the session table.
    ReconcileSessions {
        ip: IpAddr,
        sessions_json: String,
    },
}

/// A cheap, cloneable mailbox handle to the dispatch actor.
#[derive(Clone)]
pub struct DispatchHandle {
    tx: mpsc::Sender<DispatchMsg>,
}

impl DispatchHandle {
    /// Route a command from an ingress channel to the right relay,
    /// choosing one if the call has no pinned session yet.
    pub async fn send_command(&self, command: Command) -> Result<String, RelayError> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(DispatchMsg::SendCommand { command, reply }).await.is_err() {
            return Err(RelayError::NoSuitableRelay);
        }
        rx.await.unwrap_or(Err(RelayError::NoSuitableRelay))
    }

    /// Register a newly connected relay, replacing any existing connection
    /// at the same address.
    pub async fn new_relay(&self, handle: RelayHandle) {
        let _ = self.tx.send(DispatchMsg::NewRelay { handle }).await;
    }

    /// Notify the actor that a relay connection task has exited. `id`
    /// identifies which connection instance is reporting this so a stale
    /// notification from a superseded connection can never evict the
    /// connection that replaced it.
    pub async fn connection_lost(&self, ip: IpAddr, id: u64) {
        let _ = self.tx.send(DispatchMsg::ConnectionLost { ip, id }).await;
    }

    /// Report an unsolicited `expired` event from a relay.
    pub async fn relay_expired(&self, ip: IpAddr, stats: RelayStats) {
        let _ = self
            .tx
            .send(DispatchMsg::RelayExpired {
                ip,
                stats: Box::new(stats),
            })
            .await;
    }

    /// Report the body of a `remove` response from a relay.
    pub async fn relay_removed(&self, ip: IpAddr, body: &str) {
        let _ = self
            .tx
            .send(DispatchMsg::RelayRemoved {
                ip,
                body: body.to_string(),
            })
            .await;
    }

    /// Fan `summary` out to every connected relay and return a combined
    /// JSON array, for the management `summary` command.
    pub async fn get_summary(&self) -> String {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(DispatchMsg::GetSummary { reply }).await;
        rx.await.unwrap_or_else(|_| "[]".to_string())
    }

    /// Fan `sessions` out to every connected relay and return a combined
    /// JSON array, for the management `sessions` command.
    pub async fn get_statistics(&self) -> String {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(DispatchMsg::GetStatistics { reply }).await;
        rx.await.unwrap_or_else(|_| "[]".to_string())
    }

    /// Ask every connected relay to close, persist the session table, and
    /// wait for that to complete.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(DispatchMsg::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

/// Owns the relay registry and session table. Construct with [`spawn`].
pub struct DispatchActor {
    relays: HashMap<IpAddr, RelayHandle>,
    sessions: HashMap<String, RelaySession>,
    cleanup_generation: HashMap<IpAddr, u64>,
    timers: TimersConfig,
    state_file: PathBuf,
    accounting: Arc<AccountingRegistry>,
    sip_proxy: Arc<dyn SipProxyManagement>,
    metrics: Arc<Metrics>,
    shutting_down: bool,
    self_tx: mpsc::Sender<DispatchMsg>,
}

/// Spawn the dispatch actor, loading any persisted session table from
/// `state_file` first (and unlinking it, per [`session::load_sessions`]).
/// Starts the periodic expired-session sweep and, for every relay address
/// found in the loaded sessions, a cleanup timer as though that relay had
/// just disconnected.
pub fn spawn(
    state_file: PathBuf,
    timers: TimersConfig,
    accounting: Arc<AccountingRegistry>,
    sip_proxy: Arc<dyn SipProxyManagement>,
    metrics: Arc<Metrics>,
) -> DispatchHandle {
    let (tx, rx) = mpsc::channel(256);
    let handle = DispatchHandle { tx: tx.clone() };

    let sessions = session::load_sessions(&state_file);
    let mut cleanup_generation = HashMap::new();
    let stale_relay_ips: std::collections::HashSet<IpAddr> =
        sessions.values().map(|s| s.relay_ip).collect();

    metrics.set_active_sessions(sessions.len());

    let mut actor = DispatchActor {
        relays: HashMap::new(),
        sessions,
        cleanup_generation: HashMap::new(),
        timers: timers.clone(),
        state_file,
        accounting,
        sip_proxy,
        metrics,
        shutting_down: false,
        self_tx: tx.clone(),
    };

    for ip in stale_relay_ips {
        let generation = actor.schedule_cleanup(ip);
        cleanup_generation.insert(ip, generation);
    }
    actor.cleanup_generation = cleanup_generation;

    schedule_periodic_sweep(tx);
    tokio::spawn(actor.run(rx));

    handle
}

fn schedule_periodic_sweep(tx: mpsc::Sender<DispatchMsg>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(EXPIRED_SESSION_SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            if tx.send(DispatchMsg::SweepExpiredSessions).await.is_err() {
                break;
            }
        }
    });
}

impl DispatchActor {
    async fn run(mut self, mut rx: mpsc::Receiver<DispatchMsg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                // `handle_send_command` and `new_relay` only ever touch the
                // actor's own maps and spawn a task for the actual relay
                // round-trip; neither awaits a relay reply here. That keeps
                // one slow or timing-out relay from blocking every other
                // in-flight session, event, or reconnect: each relay reply
                // is an independent, concurrent suspension point.
                DispatchMsg::SendCommand { command, reply } => self.handle_send_command(command, reply),
                DispatchMsg::NewRelay { handle } => self.new_relay(handle),
                DispatchMsg::ConnectionLost { ip, id } => self.connection_lost(ip, id),
                DispatchMsg::RelayExpired { ip, stats } => self.relay_expired(ip, *stats).await,
                DispatchMsg::RelayRemoved { ip, body } => self.relay_removed(ip, &body).await,
                DispatchMsg::GetSummary { reply } => self.spawn_fan_out("summary", true, reply),
                DispatchMsg::GetStatistics { reply } => self.spawn_fan_out("sessions", false, reply),
                DispatchMsg::CleanupDeadRelay { ip, generation } => self.cleanup_dead_relay(ip, generation),
                DispatchMsg::SweepExpiredSessions => self.sweep_expired_sessions(),
                DispatchMsg::Shutdown { reply } => {
                    self.shutdown().await;
                    let _ = reply.send(());
                    return;
                }
                DispatchMsg::SessionEstablished {
                    call_id,
                    relay_ip,
                    dialog_id,
                    result,
                    reply,
                } => {
                    self.sessions.insert(call_id, RelaySession::new(relay_ip, dialog_id));
                    let _ = reply.send(Ok(result));
                }
                DispatchMsg::ReconcileSessions { ip, sessions_json } => {
                    self.purge_sessions_not_on_relay(ip, &sessions_json)
                }
            }
            self.sync_gauges();
        }
    }

    /// Keep the relay/session gauges current after every handled message.
    /// Cheap enough (two `HashMap::len()` calls) to run unconditionally
    /// rather than track deltas at each individual mutation site.
    fn sync_gauges(&self) {
        self.metrics.set_active_relays(self.relays.len());
        self.metrics.set_active_sessions(self.sessions.len());
    }

    /// Route a command from an ingress caller. Never awaits a relay reply
    /// itself: every branch either answers `reply` immediately from data
    /// already on hand, or spawns a task that owns the relay round-trip and
    /// completes `reply` (directly, or via [`DispatchMsg::SessionEstablished`]
    /// when the session table also needs updating) once the relay answers.
    /// This keeps the actor's mailbox loop free to process other sessions,
    /// events, and reconnects while one relay request is outstanding.
    fn handle_send_command(&mut self, command: Command, reply: oneshot::Sender<Result<String, RelayError>>) {
        let call_id = command.call_id().unwrap_or_default().to_string();
        let name = command.name.clone();

        if let Some(session) = self.sessions.get(&call_id) {
            if session.expire_time.is_none() {
                let relay_ip = session.relay_ip;
                match self.relays.get(&relay_ip).cloned() {
                    Some(relay) => self.spawn_forward(relay, command, name, reply),
                    None => {
                        let _ = reply.send(Err(RelayError::RelayGone {
                            relay: relay_ip.to_string(),
                        }));
                    }
                }
                return;
            }
        }

        match command.name.as_str() {
            "update" => self.spawn_update(call_id, command, reply),
            "remove" => {
                // Matches the source's handling of the `remove` it triggers
                // itself after asking the SIP proxy to end an expired
                // dialog: the session is already gone from the relay's
                // point of view, so this just clears local bookkeeping.
                let result = if self.sessions.remove(&call_id).is_some() {
                    Ok("removed".to_string())
                } else {
                    Err(RelayError::UnknownSession { call_id })
                };
                self.metrics.record_relay_request(&name, result.is_ok());
                let _ = reply.send(result);
            }
            _ => {
                let _ = reply.send(Err(RelayError::UnknownSession { call_id }));
            }
        }
    }

    /// Forward an already-pinned command to its relay off the mailbox loop.
    fn spawn_forward(&self, relay: RelayHandle, command: Command, name: String, reply: oneshot::Sender<Result<String, RelayError>>) {
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            let result = relay.send_command(command).await;
            metrics.record_relay_request(&name, result.is_ok());
            let _ = reply.send(result);
        });
    }

    /// Placement of a brand-new session: candidate selection is cheap and
    /// stays on the mailbox loop, but trying each candidate in turn (each a
    /// relay round-trip) runs in a spawned task so a slow or failing first
    /// candidate never blocks anything else the actor owns.
    fn spawn_update(&mut self, call_id: String, command: Command, reply: oneshot::Sender<Result<String, RelayError>>) {
        let preferred_ip: Option<IpAddr> = command.header("media_relay").and_then(|s| s.parse().ok());

        let mut candidates: VecDeque<RelayHandle> = self
            .relays
            .values()
            .filter(|r| r.is_active() && Some(r.ip()) != preferred_ip)
            .cloned()
            .collect();
        {
            let mut rng = rand::rng();
            candidates.make_contiguous().shuffle(&mut rng);
        }

        if let Some(ip) = preferred_ip {
            match self.relays.get(&ip) {
                Some(relay) if relay.is_active() => candidates.push_front(relay.clone()),
                _ => tracing::warn!("user requested media_relay {} is not available", ip),
            }
        }

        let dialog_id = command.header("dialog_id").map(str::to_string);
        let self_tx = self.self_tx.clone();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            match Self::try_next(&mut candidates, &command).await {
                Ok((result, relay_ip)) => {
                    metrics.record_relay_request("update", true);
                    let _ = self_tx
                        .send(DispatchMsg::SessionEstablished {
                            call_id,
                            relay_ip,
                            dialog_id,
                            result,
                            reply,
                        })
                        .await;
                }
                Err(e) => {
                    metrics.record_relay_request("update", false);
                    let _ = reply.send(Err(e));
                }
            }
        });
    }

    async fn try_next(candidates: &mut VecDeque<RelayHandle>, command: &Command) -> Result<(String, IpAddr), RelayError> {
        loop {
            let Some(relay) = candidates.front().cloned() else {
                return Err(RelayError::NoSuitableRelay);
            };
            match relay.send_command(command.clone()).await {
                Ok(result) => return Ok((result, relay.ip())),
                Err(e) => {
                    tracing::warn!("relay {} failed: {}", relay.ip(), e);
                    candidates.pop_front();
                }
            }
        }
    }

    fn new_relay(&mut self, handle: RelayHandle) {
        let ip = handle.ip();
        if let Some(old) = self.relays.remove(&ip) {
            tracing::warn!("relay at {} reconnected, closing old connection", ip);
            old.force_close();
        }

        // Dropping the tracked generation makes any `CleanupDeadRelay`
        // message already in flight for this address a no-op on arrival.
        self.cleanup_generation.remove(&ip);

        self.relays.insert(ip, handle.clone());

        // The `sessions` probe is itself a relay round-trip; run it off the
        // mailbox loop and come back through `ReconcileSessions` once it
        // answers, rather than blocking every other relay and session while
        // this one relay's view is fetched.
        let self_tx = self.self_tx.clone();
        tokio::spawn(async move {
            match handle.send_command(Command::new("sessions", Vec::new())).await {
                Ok(result) => {
                    let _ = self_tx
                        .send(DispatchMsg::ReconcileSessions { ip, sessions_json: result })
                        .await;
                }
                Err(e) => tracing::error!("failed to query sessions from newly connected relay {}: {}", ip, e),
            }
        });
    }

    /// After a relay (re)connects, drop any locally pinned, non-expiring
    /// session for that relay whose call_id the relay itself doesn't list;
    /// its statistics are presumed lost.
    fn purge_sessions_not_on_relay(&mut self, relay_ip: IpAddr, sessions_json: &str) {
        let relay_call_ids: std::collections::HashSet<String> = match serde_json::from_str::<Vec<serde_json::Value>>(sessions_json) {
            Ok(entries) => entries
                .into_iter()
                .filter_map(|v| v.get("call_id").and_then(|c| c.as_str()).map(str::to_string))
                .collect(),
            Err(e) => {
                tracing::error!("failed to parse sessions response from relay {}: {}", relay_ip, e);
                return;
            }
        };

        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|(call_id, session)| {
                session.expire_time.is_none()
                    && session.relay_ip == relay_ip
                    && !relay_call_ids.contains(call_id.as_str())
            })
            .map(|(call_id, _)| call_id.clone())
            .collect();

        for call_id in stale {
            tracing::warn!(
                "session {} is no longer on relay {}, statistics are probably lost",
                call_id,
                relay_ip
            );
            if let Some(session) = self.sessions.remove(&call_id) {
                if let Some(dialog_id) = session.dialog_id {
                    let sip_proxy = self.sip_proxy.clone();
                    tokio::spawn(async move {
                        sip_proxy.end_dialog(&dialog_id).await;
                    });
                }
            }
        }
    }

    fn connection_lost(&mut self, ip: IpAddr, id: u64) {
        let Some(current) = self.relays.get(&ip) else {
            return;
        };
        // A reconnect already replaced this entry with a newer connection;
        // this notification is from the superseded connection shutting
        // down after being force-closed, ignore it.
        if current.id() != id {
            return;
        }
        self.relays.remove(&ip);

        if self.shutting_down {
            return;
        }

        let generation = self.schedule_cleanup(ip);
        self.cleanup_generation.insert(ip, generation);
    }

    /// Schedule a `CleanupDeadRelay` message after `cleanup_dead_relays_after`,
    /// returning the generation token the actor must still hold when the
    /// message arrives for it to take effect.
    fn schedule_cleanup(&self, ip: IpAddr) -> u64 {
        let generation = self.cleanup_generation.get(&ip).copied().unwrap_or(0) + 1;
        let delay = self.timers.cleanup_dead_relays_after;
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(DispatchMsg::CleanupDeadRelay { ip, generation }).await;
        });
        generation
    }

    fn cleanup_dead_relay(&mut self, ip: IpAddr, generation: u64) {
        if self.cleanup_generation.get(&ip) != Some(&generation) {
            return; // superseded by a reconnect or a later disconnect
        }
        tracing::debug!("doing cleanup for old relay {}", ip);
        self.cleanup_generation.remove(&ip);
        self.sessions.retain(|_, session| session.relay_ip != ip);
        self.metrics.inc_dead_relay_sweep();
    }

    async fn relay_expired(&mut self, ip: IpAddr, stats: RelayStats) {
        let call_id = stats.call_id.clone();
        let Some(session) = self.sessions.get(&call_id) else {
            tracing::error!("unknown session with call_id {} expired at relay {}", call_id, ip);
            return;
        };
        if session.relay_ip != ip {
            tracing::error!(
                "session with call_id {} expired at relay {}, but is actually at relay {}, ignoring",
                call_id,
                ip,
                session.relay_ip
            );
            return;
        }

        let all_ice = stats.all_streams_ice();
        let dialog_id = session.dialog_id.clone();
        if all_ice {
            tracing::info!("session with call_id {} from relay {} removed because ICE was used", call_id, ip);
        } else {
            tracing::info!("session with call_id {} from relay {} did timeout", call_id, ip);
        }

        self.record_accounting(&stats, ip, dialog_id.clone(), !all_ice, Some(all_ice)).await;

        if dialog_id.is_some() && stats.start_time.is_some() && !all_ice {
            self.sip_proxy.end_dialog(dialog_id.as_deref().unwrap()).await;
            if let Some(session) = self.sessions.get_mut(&call_id) {
                session.expire_time = Some(SystemTime::now());
            }
        } else {
            self.sessions.remove(&call_id);
        }
    }

    async fn relay_removed(&mut self, ip: IpAddr, body: &str) {
        let stats: RelayStats = match serde_json::from_str(body) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("error decoding JSON from relay at {}: {}", ip, e);
                return;
            }
        };
        let call_id = stats.call_id.clone();
        let dialog_id = self.sessions.get(&call_id).and_then(|s| s.dialog_id.clone());
        self.record_accounting(&stats, ip, dialog_id, false, None).await;
        self.sessions.remove(&call_id);
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_accounting(
        &self,
        stats: &RelayStats,
        relay_ip: IpAddr,
        dialog_id: Option<String>,
        timed_out: bool,
        all_streams_ice: Option<bool>,
    ) {
        if stats.start_time.is_none() {
            return;
        }
        let from_tag = stats.extra.get("from_tag").and_then(|v| v.as_str()).map(str::to_string);
        let to_tag = stats.extra.get("to_tag").and_then(|v| v.as_str()).map(str::to_string);
        let record = AccountingRecord {
            call_id: stats.call_id.clone(),
            dialog_id,
            from_tag,
            to_tag,
            relay_ip: relay_ip.to_string(),
            start_time: stats.start_time,
            timed_out,
            all_streams_ice,
            stats: serde_json::to_value(&stats.extra).unwrap_or(serde_json::Value::Null),
        };
        self.accounting.record(&record).await;
    }

    fn sweep_expired_sessions(&mut self) {
        let now = SystemTime::now();
        let limit = self.timers.cleanup_expired_sessions_after;
        let before = self.sessions.len();
        self.sessions.retain(|_, session| match session.expire_time {
            Some(expire_time) => now.duration_since(expire_time).map(|age| age < limit).unwrap_or(true),
            None => true,
        });
        let removed = before - self.sessions.len();
        if removed > 0 {
            tracing::warn!(
                "found {} expired sessions which were not removed during the last {} hours",
                removed,
                limit.as_secs() / 3600
            );
            self.metrics.inc_expired_sessions_swept(removed);
        }
    }

    /// Fan a query out to every connected relay off the mailbox loop, then
    /// reply directly from the spawned task: `fan_out` only reads the
    /// relay/metrics handles it was given a snapshot of, so it needs no
    /// access back into the actor once spawned.
    fn spawn_fan_out(&self, command_name: &'static str, tolerate_errors: bool, reply: oneshot::Sender<String>) {
        let relays: Vec<RelayHandle> = self.relays.values().cloned().collect();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            let result = Self::fan_out(&relays, &metrics, command_name, tolerate_errors).await;
            let _ = reply.send(result);
        });
    }

    async fn fan_out(relays: &[RelayHandle], metrics: &Arc<Metrics>, command_name: &str, tolerate_errors: bool) -> String {
        let futures = relays.iter().map(|relay| {
            let relay = relay.clone();
            let metrics = metrics.clone();
            let command_name = command_name.to_string();
            async move {
                let ip = relay.ip();
                let result = relay.send_command(Command::new(command_name.clone(), Vec::new())).await;
                metrics.record_relay_request(&command_name, result.is_ok());
                match result {
                    Ok(result) => Some(result),
                    Err(e) => {
                        tracing::error!("error processing query at relay {}: {}", ip, e);
                        if tolerate_errors {
                            Some(format!("{{\"status\":\"error\",\"ip\":\"{ip}\"}}"))
                        } else {
                            None
                        }
                    }
                }
            }
        });

        let results: Vec<String> = futures::future::join_all(futures).await.into_iter().flatten().collect();

        if command_name == "sessions" {
            // Each per-relay reply is itself a JSON array; concatenate
            // their contents rather than nesting arrays, matching the
            // source's `[%s]' % ', '.join(result[1:-1] ...)`.
            let joined = results
                .iter()
                .map(|s| s.trim())
                .filter(|s| *s != "[]")
                .map(|s| s.trim_start_matches('[').trim_end_matches(']'))
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(", ");
            format!("[{joined}]")
        } else {
            format!("[{}]", results.join(", "))
        }
    }

    async fn shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;

        if !self.relays.is_empty() {
            let futures = self.relays.values().map(|relay| {
                let relay = relay.clone();
                async move {
                    relay.force_close();
                }
            });
            futures::future::join_all(futures).await;

            // Give connection tasks a moment to unwind and report
            // themselves lost before persisting; this is best-effort, not
            // a hard synchronization point, since the dispatcher's overall
            // shutdown timeout bounds total wait time.
            let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
            while !self.relays.is_empty() && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        }

        if let Err(e) = session::save_sessions(&self.state_file, &self.sessions) {
            tracing::error!("failed to persist session table at shutdown: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::protocol::StreamInfo;
    use std::sync::Mutex;
    use std::time::Duration as StdDuration;

    /// Records every dialog_id it is asked to end, for assertions.
    #[derive(Default)]
    struct RecordingSipProxy {
        ended: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl SipProxyManagement for RecordingSipProxy {
        async fn end_dialog(&self, dialog_id: &str) {
            self.ended.lock().unwrap().push(dialog_id.to_string());
        }
    }

    fn test_timers() -> TimersConfig {
        TimersConfig {
            relay_timeout: StdDuration::from_secs(5),
            relay_recover_interval: StdDuration::from_secs(5),
            cleanup_dead_relays_after: StdDuration::from_secs(5),
            cleanup_expired_sessions_after: StdDuration::from_secs(3600),
        }
    }

    fn build_actor(sip_proxy: Arc<dyn SipProxyManagement>) -> DispatchActor {
        let (tx, _rx) = mpsc::channel(16);
        DispatchActor {
            relays: HashMap::new(),
            sessions: HashMap::new(),
            cleanup_generation: HashMap::new(),
            timers: test_timers(),
            state_file: PathBuf::from("/tmp/dispatcher-test-state-unused"),
            accounting: Arc::new(AccountingRegistry::from_names(&[]).unwrap()),
            sip_proxy,
            metrics: Arc::new(Metrics::new().unwrap()),
            shutting_down: false,
            self_tx: tx,
        }
    }

    fn update_command(call_id: &str) -> Command {
        Command::new("update", vec![("call_id".to_string(), call_id.to_string())])
    }

    fn remove_command(call_id: &str) -> Command {
        Command::new("remove", vec![("call_id".to_string(), call_id.to_string())])
    }

    #[tokio::test]
    async fn update_with_no_active_relays_fails() {
        let mut actor = build_actor(Arc::new(RecordingSipProxy::default()));
        let (reply, rx) = oneshot::channel();
        actor.handle_send_command(update_command("call-1"), reply);
        let result = rx.await.unwrap();
        assert!(matches!(result, Err(RelayError::NoSuitableRelay)));
        assert!(actor.sessions.is_empty());
    }

    #[tokio::test]
    async fn remove_for_unknown_session_fails() {
        let mut actor = build_actor(Arc::new(RecordingSipProxy::default()));
        let (reply, rx) = oneshot::channel();
        actor.handle_send_command(remove_command("call-1"), reply);
        let result = rx.await.unwrap();
        assert!(matches!(result, Err(RelayError::UnknownSession { .. })));
    }

    #[tokio::test]
    async fn remove_confirms_already_expired_session_without_contacting_a_relay() {
        let mut actor = build_actor(Arc::new(RecordingSipProxy::default()));
        let mut session = RelaySession::new("10.0.0.1".parse().unwrap(), None);
        session.expire_time = Some(SystemTime::now());
        actor.sessions.insert("call-1".to_string(), session);

        let (reply, rx) = oneshot::channel();
        actor.handle_send_command(remove_command("call-1"), reply);
        let result = rx.await.unwrap();
        assert_eq!(result.unwrap(), "removed");
        assert!(!actor.sessions.contains_key("call-1"));
    }

    #[tokio::test]
    async fn expired_all_ice_drops_session_immediately_without_ending_dialog() {
        let sip_proxy = Arc::new(RecordingSipProxy::default());
        let mut actor = build_actor(sip_proxy.clone());
        let relay_ip = "10.0.0.1".parse().unwrap();
        actor.sessions.insert(
            "call-1".to_string(),
            RelaySession::new(relay_ip, Some("dialog-1".to_string())),
        );

        let stats = RelayStats {
            call_id: "call-1".to_string(),
            streams: vec![StreamInfo {
                status: "unselected ICE candidate".to_string(),
            }],
            start_time: Some(1000.0),
            extra: Default::default(),
        };
        actor.relay_expired(relay_ip, stats).await;

        assert!(!actor.sessions.contains_key("call-1"));
        assert!(sip_proxy.ended.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn expired_non_ice_with_dialog_marks_session_terminal_and_ends_dialog() {
        let sip_proxy = Arc::new(RecordingSipProxy::default());
        let mut actor = build_actor(sip_proxy.clone());
        let relay_ip = "10.0.0.1".parse().unwrap();
        actor.sessions.insert(
            "call-1".to_string(),
            RelaySession::new(relay_ip, Some("dialog-1".to_string())),
        );

        let stats = RelayStats {
            call_id: "call-1".to_string(),
            streams: vec![StreamInfo {
                status: "active".to_string(),
            }],
            start_time: Some(1000.0),
            extra: Default::default(),
        };
        actor.relay_expired(relay_ip, stats).await;

        let session = actor.sessions.get("call-1").expect("session must remain, awaiting remove");
        assert!(session.expire_time.is_some());
        assert_eq!(sip_proxy.ended.lock().unwrap().as_slice(), ["dialog-1"]);
    }

    #[tokio::test]
    async fn expired_for_unknown_call_id_is_dropped_silently() {
        let sip_proxy = Arc::new(RecordingSipProxy::default());
        let mut actor = build_actor(sip_proxy.clone());

        let stats = RelayStats {
            call_id: "ghost".to_string(),
            streams: Vec::new(),
            start_time: Some(1.0),
            extra: Default::default(),
        };
        actor.relay_expired("10.0.0.1".parse().unwrap(), stats).await;
        assert!(sip_proxy.ended.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn expired_at_the_wrong_relay_is_ignored() {
        let sip_proxy = Arc::new(RecordingSipProxy::default());
        let mut actor = build_actor(sip_proxy.clone());
        let pinned_ip = "10.0.0.1".parse().unwrap();
        actor.sessions.insert("call-1".to_string(), RelaySession::new(pinned_ip, None));

        let stats = RelayStats {
            call_id: "call-1".to_string(),
            streams: Vec::new(),
            start_time: Some(1.0),
            extra: Default::default(),
        };
        actor.relay_expired("10.0.0.2".parse().unwrap(), stats).await;

        // Session is untouched: still pinned to its original relay, not expired.
        let session = actor.sessions.get("call-1").unwrap();
        assert_eq!(session.relay_ip, pinned_ip);
        assert!(session.expire_time.is_none());
    }

    #[tokio::test]
    async fn sweep_expired_sessions_purges_only_stale_terminal_sessions() {
        let mut actor = build_actor(Arc::new(RecordingSipProxy::default()));
        actor.timers.cleanup_expired_sessions_after = StdDuration::from_secs(60);

        let old_expiry = SystemTime::now() - StdDuration::from_secs(3600);
        let mut stale = RelaySession::new("10.0.0.1".parse().unwrap(), None);
        stale.expire_time = Some(old_expiry);
        actor.sessions.insert("stale".to_string(), stale);

        let mut fresh = RelaySession::new("10.0.0.1".parse().unwrap(), None);
        fresh.expire_time = Some(SystemTime::now());
        actor.sessions.insert("fresh".to_string(), fresh);

        actor.sessions.insert("active".to_string(), RelaySession::new("10.0.0.1".parse().unwrap(), None));

        actor.sweep_expired_sessions();

        assert!(!actor.sessions.contains_key("stale"));
        assert!(actor.sessions.contains_key("fresh"));
        assert!(actor.sessions.contains_key("active"));
    }

    #[tokio::test]
    async fn cleanup_dead_relay_respects_generation_token() {
        let mut actor = build_actor(Arc::new(RecordingSipProxy::default()));
        let ip1: IpAddr = "10.0.0.1".parse().unwrap();
        let ip2: IpAddr = "10.0.0.2".parse().unwrap();
        actor.sessions.insert("a".to_string(), RelaySession::new(ip1, None));
        actor.sessions.insert("b".to_string(), RelaySession::new(ip2, None));
        actor.cleanup_generation.insert(ip1, 5);

        // Stale generation for ip2 (none tracked): no-op.
        actor.cleanup_dead_relay(ip2, 99);
        assert!(actor.sessions.contains_key("b"));

        // Matching generation for ip1: purges every session pinned there.
        actor.cleanup_dead_relay(ip1, 5);
        assert!(!actor.sessions.contains_key("a"));
    }

    #[tokio::test]
    async fn purge_sessions_not_on_relay_drops_stale_entries_and_ends_their_dialogs() {
        let sip_proxy = Arc::new(RecordingSipProxy::default());
        let mut actor = build_actor(sip_proxy.clone());
        let relay_ip = "10.0.0.1".parse().unwrap();
        actor
            .sessions
            .insert("still-there".to_string(), RelaySession::new(relay_ip, None));
        actor.sessions.insert(
            "gone".to_string(),
            RelaySession::new(relay_ip, Some("dialog-gone".to_string())),
        );

        let relay_view = r#"[{"call_id":"still-there"}]"#;
        actor.purge_sessions_not_on_relay(relay_ip, relay_view);

        assert!(actor.sessions.contains_key("still-there"));
        assert!(!actor.sessions.contains_key("gone"));

        // The SIP-proxy notification for the dropped session is fired from
        // a spawned task; give it a tick to run.
        tokio::task::yield_now().await;
        tokio::time::sleep(StdDuration::from_millis(10)).await;
        assert_eq!(sip_proxy.ended.lock().unwrap().as_slice(), ["dialog-gone"]);
    }
}
