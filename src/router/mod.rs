//! Session routing and the relay registry (C2 + C3)
//!
//! The session table and the set of connected relays are owned by a single
//! actor task ([`actor::spawn`]) reached through [`actor::DispatchHandle`].
//! Everything that needs to pin a call to a relay, forward a command, or
//! inspect the fleet goes through that handle rather than touching shared
//! state directly.

pub mod actor;
pub mod session;

pub use actor::{spawn, DispatchActor, DispatchHandle};
pub use session::RelaySession;
