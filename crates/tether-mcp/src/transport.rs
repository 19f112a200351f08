//! Transport abstraction over a byte-stream connection to an MCP server.
//!
//! One logical message in, one logical message out; framing and connection
//! semantics belong to the implementation. The client and supervisors depend
//! only on this trait, so a stream transport (e.g. long-lived HTTP) can stand
//! in for the subprocess one as long as it honors the same contract.

use crate::config::ServerConfig;
use crate::error::TransportError;
use async_trait::async_trait;
use std::sync::Arc;

/// Callback receiving one timestamped, human-readable line per protocol event.
/// Never required for correctness.
pub type DebugSink = Arc<dyn Fn(&str) + Send + Sync>;

/// A sink that forwards debug lines to `tracing::debug!`.
pub fn tracing_sink() -> DebugSink {
    Arc::new(|line| tracing::debug!(target: "tether_mcp", "{line}"))
}

/// Builds a transport for a server endpoint. Injected into the supervisor so
/// transport implementations can be swapped without touching it.
pub type TransportFactory = Arc<dyn Fn(&ServerConfig, DebugSink) -> Arc<dyn Transport> + Send + Sync>;

/// Contract every transport implementation must satisfy.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the connection (spawn the process, open the stream).
    /// Calling while already started is a caller error.
    async fn start(&self) -> Result<(), TransportError>;

    /// Release all resources. Idempotent; must unblock any task currently
    /// suspended in [`Transport::receive`].
    async fn stop(&self) -> Result<(), TransportError>;

    /// Deliver one message, reliably and in order.
    async fn send(&self, message: &[u8]) -> Result<(), TransportError>;

    /// Suspend until one complete message is available. Fails with
    /// [`TransportError::ConnectionClosed`] when the transport is stopped
    /// while the call is outstanding, or when the peer disconnects.
    async fn receive(&self) -> Result<Vec<u8>, TransportError>;

    /// Best-effort liveness flag, not a guarantee the next send or receive
    /// succeeds.
    fn is_connected(&self) -> bool;

    /// Drop any session token the transport holds, so the next handshake gets
    /// a fresh session. Process transports keep no session state.
    async fn clear_session(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_is_dyn_compatible() {
        fn _accept(_t: &dyn Transport) {}
    }

    #[test]
    fn arc_transport_is_send_sync() {
        fn _assert_send_sync<T: Send + Sync>() {}
        _assert_send_sync::<Arc<dyn Transport>>();
    }
}
