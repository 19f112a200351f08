//! Configuration for MCP servers and their supervision.
//!
//! Every interval and ceiling is overridable; tests run with near-zero
//! delays and monitoring disabled.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

fn default_request_timeout() -> u64 {
    30_000
}

fn default_startup_grace() -> u64 {
    100
}

fn default_max_attempts() -> u32 {
    3
}

fn default_settle_delay() -> u64 {
    100
}

fn default_health_interval() -> u64 {
    30_000
}

fn default_health_chunks() -> u32 {
    10
}

fn default_max_restarts() -> u32 {
    3
}

fn default_health_monitoring() -> bool {
    true
}

fn default_restart_settle_delay() -> u64 {
    500
}

/// Top-level MCP configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default)]
    pub servers: HashMap<String, ServerConfig>,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub manager: ManagerConfig,
}

/// How to launch a single MCP server process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Path to the server executable. Bare names are resolved through PATH.
    pub command: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment for the server process, overlaid on the parent's.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// How long to wait after spawn before confirming the process survived.
    #[serde(default = "default_startup_grace")]
    pub startup_grace_ms: u64,
}

impl ServerConfig {
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            startup_grace_ms: default_startup_grace(),
        }
    }
}

/// Request handling knobs for [`crate::McpClient`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Attempt ceiling for recoverable request failures (the handshake always
    /// gets exactly one attempt).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Per-request timeout in milliseconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    /// Pause between a transport restart and the handshake redo.
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            request_timeout_ms: default_request_timeout(),
            settle_delay_ms: default_settle_delay(),
        }
    }
}

/// Supervision knobs for [`crate::ServerManager`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    #[serde(default = "default_health_interval")]
    pub health_check_interval_ms: u64,
    /// The health sleep is subdivided into this many chunks so cancellation
    /// is observed promptly.
    #[serde(default = "default_health_chunks")]
    pub health_check_chunks: u32,
    #[serde(default = "default_max_restarts")]
    pub max_restart_attempts: u32,
    #[serde(default = "default_health_monitoring")]
    pub health_monitoring: bool,
    /// Pause between stop and start during a restart.
    #[serde(default = "default_restart_settle_delay")]
    pub restart_settle_delay_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            health_check_interval_ms: default_health_interval(),
            health_check_chunks: default_health_chunks(),
            max_restart_attempts: default_max_restarts(),
            health_monitoring: default_health_monitoring(),
            restart_settle_delay_ms: default_restart_settle_delay(),
        }
    }
}
