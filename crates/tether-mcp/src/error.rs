//! Error types for the MCP client runtime.

use std::path::PathBuf;
use thiserror::Error;

/// Failures at the transport layer (process spawn, pipe I/O, connection state).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("server executable not found: {path}")]
    ServerNotFound { path: PathBuf },

    #[error("server failed to start: {reason}")]
    FailedToStart { reason: String },

    #[error("transport is not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("write to server failed: {reason}")]
    WriteFailed { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the MCP client and its supervisors.
#[derive(Debug, Error)]
pub enum McpError {
    #[error("client is not initialized")]
    NotInitialized,

    #[error("client stopped")]
    ClientStopped,

    #[error("server error (code {code}): {message}")]
    Server { code: i64, message: String },

    #[error("response has neither result nor error")]
    NoResult,

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("request '{method}' timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("'{operation}' is not valid in state '{state}'")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    #[error("failed to start server: {0}")]
    StartFailed(String),

    #[error("failed to stop server: {0}")]
    StopFailed(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
