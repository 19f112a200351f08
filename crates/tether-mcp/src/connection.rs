//! Connection manager — the thin state machine callers drive.
//!
//! Exposes connect/disconnect/reconnect and a connection state for display,
//! delegating the actual lifecycle work to [`ServerManager`].

use crate::client::McpClient;
use crate::error::McpError;
use crate::manager::ServerManager;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Caller-facing connection states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed(String),
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Reconnecting => f.write_str("reconnecting"),
            ConnectionState::Failed(cause) => write!(f, "failed: {cause}"),
        }
    }
}

/// Façade over a [`ServerManager`].
pub struct ConnectionManager {
    manager: Arc<ServerManager>,
    state: Mutex<ConnectionState>,
}

impl ConnectionManager {
    pub fn new(manager: Arc<ServerManager>) -> Self {
        Self {
            manager,
            state: Mutex::new(ConnectionState::Disconnected),
        }
    }

    pub async fn state(&self) -> ConnectionState {
        self.state.lock().await.clone()
    }

    /// Connect, valid from `Disconnected` only. From any other state this
    /// returns the existing client if the manager has one, else
    /// [`McpError::InvalidState`].
    pub async fn connect(&self) -> Result<Arc<McpClient>, McpError> {
        {
            let mut state = self.state.lock().await;
            match &*state {
                ConnectionState::Disconnected => *state = ConnectionState::Connecting,
                other => {
                    if let Some(client) = self.manager.client().await {
                        return Ok(client);
                    }
                    return Err(McpError::InvalidState {
                        operation: "connect",
                        state: other.to_string(),
                    });
                }
            }
        }

        match self.manager.start().await {
            Ok(client) => {
                *self.state.lock().await = ConnectionState::Connected;
                Ok(client)
            }
            Err(e) => {
                *self.state.lock().await = ConnectionState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    /// Disconnect and reset to `Disconnected` regardless of prior state.
    pub async fn disconnect(&self) -> Result<(), McpError> {
        let result = self.manager.stop().await;
        *self.state.lock().await = ConnectionState::Disconnected;
        result
    }

    /// Full teardown and reconnect through the manager's restart.
    pub async fn reconnect(&self) -> Result<Arc<McpClient>, McpError> {
        *self.state.lock().await = ConnectionState::Reconnecting;
        match self.manager.restart().await {
            Ok(client) => {
                *self.state.lock().await = ConnectionState::Connected;
                Ok(client)
            }
            Err(e) => {
                *self.state.lock().await = ConnectionState::Failed(e.to_string());
                Err(e)
            }
        }
    }
}
