//! SIP-proxy management RPC client
//!
//! When a session is dropped while its dialog is still believed active
//! (for example, a relay reports `expired` for a non-ICE stream that never
//! gets a `remove`), the source dispatcher calls back into OpenSIPS to end
//! the dialog out from under it. This is fire-and-forget: the dispatcher
//! does not block session cleanup on the SIP proxy's response.

use async_trait::async_trait;

/// A callback interface into the SIP proxy's own management plane.
#[async_trait]
pub trait SipProxyManagement: Send + Sync {
    /// Ask the SIP proxy to tear down the dialog identified by `dialog_id`.
    /// Implementations must not let failures propagate to the caller: this
    /// is advisory cleanup, not part of the session state machine.
    async fn end_dialog(&self, dialog_id: &str);
}

/// Default implementation: logs the request instead of issuing it. Useful
/// standalone and as a safe default when no OpenSIPS management endpoint
/// is configured.
pub struct LoggingSipProxyManagement;

#[async_trait]
impl SipProxyManagement for LoggingSipProxyManagement {
    async fn end_dialog(&self, dialog_id: &str) {
        tracing::info!(dialog_id = %dialog_id, "would end dialog via SIP-proxy management RPC");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn logging_impl_does_not_panic() {
        let client = LoggingSipProxyManagement;
        client.end_dialog("dlg-1").await;
    }
}
