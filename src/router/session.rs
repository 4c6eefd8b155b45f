//! Session state and persistence
//!
//! A session pins a SIP dialog's `call_id` to the relay handling its media
//! for the dialog's lifetime. The source dispatcher persists its session
//! table across restarts by pickling it to a state file at shutdown and
//! unlinking that file as soon as it has been read back in, so a crash
//! between those two steps loses state rather than replaying it twice.
//! This implementation keeps that same discipline with a schema-versioned,
//! newline-delimited JSON file instead of a pickle.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Schema version written as the first line of the persisted state file.
/// Bump this if the record shape below changes incompatibly.
const STATE_SCHEMA_VERSION: u32 = 1;

/// A call pinned to a relay, tracked for the lifetime of its media session.
#[derive(Debug, Clone)]
pub struct RelaySession {
    pub relay_ip: IpAddr,
    pub dialog_id: Option<String>,
    /// Set once the dispatcher has asked the SIP proxy to end the dialog
    /// because a relay reported the session as expired; the session is
    /// purged once this has been set for `cleanup_expired_sessions_after`.
    pub expire_time: Option<SystemTime>,
}

impl RelaySession {
    pub fn new(relay_ip: IpAddr, dialog_id: Option<String>) -> Self {
        Self {
            relay_ip,
            dialog_id,
            expire_time: None,
        }
    }

    pub fn is_expiring(&self) -> bool {
        self.expire_time.is_some()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedSession {
    call_id: String,
    relay_ip: IpAddr,
    dialog_id: Option<String>,
    expire_time: Option<f64>,
}

fn system_time_to_epoch(t: SystemTime) -> f64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

fn epoch_to_system_time(secs: f64) -> SystemTime {
    UNIX_EPOCH + std::time::Duration::from_secs_f64(secs.max(0.0))
}

/// Write the session table to `path` as a version-prefixed, newline-delimited
/// JSON file. Called once, at graceful shutdown only.
pub fn save_sessions(path: &Path, sessions: &HashMap<String, RelaySession>) -> crate::Result<()> {
    let mut buf = String::new();
    buf.push_str(&STATE_SCHEMA_VERSION.to_string());
    buf.push('\n');

    for (call_id, session) in sessions {
        let record = PersistedSession {
            call_id: call_id.clone(),
            relay_ip: session.relay_ip,
            dialog_id: session.dialog_id.clone(),
            expire_time: session.expire_time.map(system_time_to_epoch),
        };
        buf.push_str(&serde_json::to_string(&record).context("failed to encode session record")?);
        buf.push('\n');
    }

    std::fs::write(path, buf)
        .with_context(|| format!("failed to write session state file: {}", path.display()))?;
    tracing::info!(sessions = sessions.len(), path = %path.display(), "persisted session table");
    Ok(())
}

/// Load the session table from `path`, if present, then unlink the file so
/// a subsequent crash never replays state already handed back to the
/// relays. A missing or unparseable file is not an error: the dispatcher
/// simply starts with an empty session table, matching the source
/// implementation's bare `except: self.sessions = {}`.
pub fn load_sessions(path: &Path) -> HashMap<String, RelaySession> {
    let sessions = match std::fs::read_to_string(path) {
        Ok(content) => parse_sessions(&content).unwrap_or_else(|e| {
            tracing::warn!("failed to parse session state file {}: {:#}", path.display(), e);
            HashMap::new()
        }),
        Err(_) => HashMap::new(),
    };

    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("failed to remove session state file {}: {}", path.display(), e);
        }
    }

    sessions
}

fn parse_sessions(content: &str) -> crate::Result<HashMap<String, RelaySession>> {
    let mut lines = content.lines();
    let version: u32 = lines
        .next()
        .context("session state file is empty")?
        .trim()
        .parse()
        .context("session state file has no schema version")?;
    anyhow::ensure!(
        version == STATE_SCHEMA_VERSION,
        "unsupported session state schema version: {version}"
    );

    let mut sessions = HashMap::new();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let record: PersistedSession = serde_json::from_str(line)
            .context("failed to decode a session record")?;
        sessions.insert(
            record.call_id,
            RelaySession {
                relay_ip: record.relay_ip,
                dialog_id: record.dialog_id,
                expire_time: record.expire_time.map(epoch_to_system_time),
            },
        );
    }
    Ok(sessions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn save_then_load_roundtrips() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_path_buf();
        // `save_sessions` writes via `fs::write`, which is fine on a path
        // that the NamedTempFile already created.

        let mut sessions = HashMap::new();
        sessions.insert(
            "call-1".to_string(),
            RelaySession::new("10.0.0.5".parse().unwrap(), Some("dlg-1".to_string())),
        );
        save_sessions(&path, &sessions).unwrap();

        let loaded = load_sessions(&path);
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded["call-1"].dialog_id.as_deref(), Some("dlg-1"));
        assert!(!path.exists(), "state file must be unlinked after load");
    }

    #[test]
    fn load_missing_file_yields_empty_table() {
        let sessions = load_sessions(Path::new("/nonexistent/state/file"));
        assert!(sessions.is_empty());
    }
}
