//! Error classification and backoff for request retry and crash restart.
//!
//! The recoverable check is one funnel over both JSON-RPC error codes and
//! HTTP-flavored status codes/messages, because stream transports report
//! their failures through the same `Server` variant a process transport
//! uses for peer errors.

use crate::error::McpError;
use std::time::Duration;

/// JSON-RPC error code servers use for an expired or unknown session.
pub const SESSION_NOT_FOUND_CODE: i64 = -32000;

/// Header that carries the session token on stream transports.
pub const SESSION_HEADER: &str = "mcp-session-id";

/// Ceiling for request-retry backoff.
const MAX_RETRY_DELAY_SECS: u64 = 10;

/// Ceiling for crash-restart backoff.
const MAX_RESTART_DELAY_SECS: u64 = 30;

/// Returns `true` if the error is transient and the request should be retried.
pub fn is_recoverable(error: &McpError) -> bool {
    match error {
        McpError::Transport(_) => true,
        McpError::Timeout { .. } => true,
        McpError::Server { code, message } => {
            if *code == SESSION_NOT_FOUND_CODE || (500..600).contains(code) {
                return true;
            }
            let message = message.to_ascii_lowercase();
            message.contains("session")
                || message.contains(SESSION_HEADER)
                || message.contains("connection reset")
                || message.contains("timed out")
                || message.contains("timeout")
                || message.contains("connection refused")
                || message.contains("not found")
                || message.contains("404")
        }
        _ => false,
    }
}

/// Returns `true` if the session should be torn down and the handshake redone
/// before the next attempt.
pub fn needs_reinitialize(error: &McpError) -> bool {
    match error {
        McpError::Transport(_) => true,
        McpError::Server { code, message } => {
            if *code == SESSION_NOT_FOUND_CODE {
                return true;
            }
            let message = message.to_ascii_lowercase();
            message.contains("session") || message.contains(SESSION_HEADER)
        }
        _ => false,
    }
}

/// Backoff before request-retry attempt `attempt` (1-based): `min(2^(k-1), 10)` seconds.
pub fn retry_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1);
    Duration::from_secs(2u64.saturating_pow(exp).min(MAX_RETRY_DELAY_SECS))
}

/// Backoff before a crash restart after `attempts` prior attempts: `min(2^attempts, 30)` seconds.
pub fn restart_delay(attempts: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempts).min(MAX_RESTART_DELAY_SECS))
}
