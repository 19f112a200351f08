//! Tether MCP client runtime.
//!
//! A client-side runtime for the Model Context Protocol: newline-delimited
//! JSON-RPC over a byte-stream transport, a request/response multiplexer with
//! retry and session reinitialization, and supervisors that keep the server
//! process alive across crashes.
//!
//! Layering, leaves first: [`Transport`] is the seam ([`ProcessTransport`]
//! runs the server as a child process); [`McpClient`] multiplexes requests
//! over one transport; [`ServerManager`] owns the transport/client pair and
//! restarts it on crash; [`ConnectionManager`] is the thin state machine UI
//! callers drive.

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod jsonrpc;
pub mod manager;
pub mod process;
pub mod retry;
pub mod transport;

pub use client::{McpClient, ServerInfo};
pub use config::{ClientConfig, ManagerConfig, McpConfig, ServerConfig};
pub use connection::{ConnectionManager, ConnectionState};
pub use error::{McpError, TransportError};
pub use manager::{ServerManager, ServerState};
pub use process::{ProcessTransport, process_transport_factory};
pub use transport::{DebugSink, Transport, TransportFactory, tracing_sink};
