//! Relay connection handling (C1)
//!
//! A relay is a TLS-authenticated TCP peer that accepts sequence-numbered
//! commands and answers them on the matching sequence, plus emits two
//! unsolicited event lines (`expired`, `ping`). This module owns the wire
//! protocol, the per-connection actor, and the listener that accepts new
//! relay connections.

pub mod connection;
pub mod listener;
pub mod protocol;

pub use connection::{spawn, RelayHandle, RelayStream};
pub use protocol::{Command, CommandError, RelayError, RelayStats};
