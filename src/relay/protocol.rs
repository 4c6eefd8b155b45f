//! Relay wire protocol
//!
//! Commands are sent to a relay as `"{name} {sequence}\n{header}: {value}\n...\n\n"`
//! and answered on a line of their own, keyed back to the request by the
//! same sequence number. Two lines arrive unsolicited rather than in
//! response to a request: `expired <json>` and `ping`.

use std::collections::BTreeMap;
use std::fmt;

/// A relay command: a name (`update`, `remove`, `summary`, `sessions`, ...)
/// plus an ordered set of headers. Headers are kept in insertion order
/// because they are written back out verbatim on the wire.
#[derive(Debug, Clone)]
pub struct Command {
    pub name: String,
    headers: Vec<(String, String)>,
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("could not parse command headers")]
    MalformedHeaders,
    #[error("request is missing the call_id header")]
    MissingCallId,
}

impl Command {
    pub fn new(name: impl Into<String>, headers: Vec<(String, String)>) -> Self {
        Self {
            name: name.into(),
            headers,
        }
    }

    /// Parse a command from its line representation: the first line is the
    /// command name, the rest are `key: value` header lines.
    pub fn from_lines(lines: &[String]) -> Result<Self, CommandError> {
        let name = lines.first().cloned().unwrap_or_default();
        let mut headers = Vec::with_capacity(lines.len().saturating_sub(1));
        for line in &lines[1.min(lines.len())..] {
            let (key, value) = line
                .split_once(": ")
                .ok_or(CommandError::MalformedHeaders)?;
            headers.push((key.to_string(), value.to_string()));
        }
        Ok(Self { name, headers })
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn call_id(&self) -> Option<&str> {
        self.header("call_id")
    }

    pub fn require_call_id(&self) -> Result<&str, CommandError> {
        self.call_id().ok_or(CommandError::MissingCallId)
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Render as the on-wire request body, not including the trailing blank
    /// line that terminates a request on the relay protocol.
    pub fn encode(&self, sequence_number: u64) -> String {
        let mut out = format!("{} {}\n", self.name, sequence_number);
        for (key, value) in &self.headers {
            out.push_str(key);
            out.push_str(": ");
            out.push_str(value);
            out.push('\n');
        }
        out.push('\n');
        out
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.name)
    }
}

/// Errors a relay command exchange can fail with; distinct from transport
/// I/O errors, which are reported as `anyhow::Error`.
#[derive(Debug, thiserror::Error, Clone)]
pub enum RelayError {
    #[error("{command:?} command failed: relay at {relay} timed out")]
    Timeout { command: String, relay: String },
    #[error("received error from relay at {relay} in response to {command:?} command")]
    ErrorReply { command: String, relay: String },
    #[error("relay at {relay} is shutting down")]
    Halting { relay: String },
    #[error("{command:?} command failed: relay at {relay} disconnected")]
    Disconnected { command: String, relay: String },
    #[error("relay for this session ({relay}) is no longer connected")]
    RelayGone { relay: String },
    #[error("no suitable relay found")]
    NoSuitableRelay,
    #[error("unknown session with call-id {call_id}")]
    UnknownSession { call_id: String },
}

/// A single line of per-stream relay statistics inside an `expired` event,
/// enough to decide whether every stream negotiated ICE.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct StreamInfo {
    pub status: String,
}

/// The JSON payload carried by an unsolicited `expired <json>` line, and by
/// the response to a `remove` command.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct RelayStats {
    pub call_id: String,
    #[serde(default)]
    pub streams: Vec<StreamInfo>,
    pub start_time: Option<f64>,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl RelayStats {
    /// `true` when every stream reports the ICE-unselected status; this is
    /// the source dispatcher's signal that the session ended because ICE
    /// negotiation picked a direct path rather than because it timed out.
    /// Vacuously true when `streams` is empty, matching the source's
    /// `all(...)` over a possibly-empty list.
    pub fn all_streams_ice(&self) -> bool {
        self.streams.iter().all(|s| s.status == "unselected ICE candidate")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_roundtrips_header_order() {
        let cmd = Command::new(
            "update",
            vec![
                ("call_id".to_string(), "abc".to_string()),
                ("media_relay".to_string(), "10.0.0.1".to_string()),
            ],
        );
        let wire = cmd.encode(7);
        assert_eq!(wire, "update 7\ncall_id: abc\nmedia_relay: 10.0.0.1\n\n");
    }

    #[test]
    fn from_lines_parses_headers() {
        let lines = vec![
            "update".to_string(),
            "call_id: abc".to_string(),
            "from_tag: ft".to_string(),
        ];
        let cmd = Command::from_lines(&lines).unwrap();
        assert_eq!(cmd.name, "update");
        assert_eq!(cmd.call_id(), Some("abc"));
        assert_eq!(cmd.header("from_tag"), Some("ft"));
    }

    #[test]
    fn from_lines_rejects_missing_call_id() {
        let lines = vec!["update".to_string()];
        let cmd = Command::from_lines(&lines).unwrap();
        assert!(cmd.require_call_id().is_err());
    }

    #[test]
    fn all_streams_ice_requires_unanimous() {
        let stats = RelayStats {
            call_id: "c1".to_string(),
            streams: vec![
                StreamInfo {
                    status: "unselected ICE candidate".to_string(),
                },
                StreamInfo {
                    status: "unselected ICE candidate".to_string(),
                },
            ],
            start_time: Some(1.0),
            extra: BTreeMap::new(),
        };
        assert!(stats.all_streams_ice());

        let mixed = RelayStats {
            streams: vec![StreamInfo {
                status: "active".to_string(),
            }],
            ..stats.clone()
        };
        assert!(!mixed.all_streams_ice());
    }

    #[test]
    fn all_streams_ice_is_vacuously_true_when_no_streams() {
        let stats = RelayStats {
            call_id: "c1".to_string(),
            streams: Vec::new(),
            start_time: Some(1.0),
            extra: BTreeMap::new(),
        };
        assert!(stats.all_streams_ice());
    }
}
