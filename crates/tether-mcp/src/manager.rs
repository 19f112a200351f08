//! Server manager — supervises one MCP server's lifecycle.
//!
//! Owns the transport/client pair (at most one live pair at a time), a state
//! machine over the server process, periodic health checks, and bounded
//! crash recovery with exponential backoff.

use crate::client::McpClient;
use crate::config::{ClientConfig, ManagerConfig, ServerConfig};
use crate::error::McpError;
use crate::retry;
use crate::transport::{DebugSink, TransportFactory, tracing_sink};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Lifecycle states of the supervised server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Crashed,
    ShuttingDown,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerState::Stopped => "stopped",
            ServerState::Starting => "starting",
            ServerState::Running => "running",
            ServerState::Crashed => "crashed",
            ServerState::ShuttingDown => "shutting down",
        };
        f.write_str(name)
    }
}

/// Supervisor for one MCP server.
pub struct ServerManager {
    server_config: ServerConfig,
    client_config: ClientConfig,
    config: ManagerConfig,
    factory: TransportFactory,
    sink: DebugSink,
    state: Mutex<ServerState>,
    client: Mutex<Option<Arc<McpClient>>>,
    restart_attempts: AtomicU32,
    shutting_down: AtomicBool,
    health_task: Mutex<Option<(JoinHandle<()>, CancellationToken)>>,
}

impl ServerManager {
    pub fn new(server_config: ServerConfig, factory: TransportFactory) -> Self {
        Self {
            server_config,
            client_config: ClientConfig::default(),
            config: ManagerConfig::default(),
            factory,
            sink: tracing_sink(),
            state: Mutex::new(ServerState::Stopped),
            client: Mutex::new(None),
            restart_attempts: AtomicU32::new(0),
            shutting_down: AtomicBool::new(false),
            health_task: Mutex::new(None),
        }
    }

    pub fn with_manager_config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_client_config(mut self, config: ClientConfig) -> Self {
        self.client_config = config;
        self
    }

    pub fn with_debug_sink(mut self, sink: DebugSink) -> Self {
        self.sink = sink;
        self
    }

    pub async fn state(&self) -> ServerState {
        *self.state.lock().await
    }

    /// The live client, if one exists.
    pub async fn client(&self) -> Option<Arc<McpClient>> {
        self.client.lock().await.clone()
    }

    /// Crash-triggered restart attempts since the last successful start.
    pub fn restart_attempts(&self) -> u32 {
        self.restart_attempts.load(Ordering::SeqCst)
    }

    /// Start the server: build a fresh transport and client, run the
    /// handshake, and begin health monitoring.
    ///
    /// Legal from `Stopped` or `Crashed`. From any other state this returns
    /// the existing client if one exists, else [`McpError::InvalidState`].
    pub async fn start(self: &Arc<Self>) -> Result<Arc<McpClient>, McpError> {
        {
            let mut state = self.state.lock().await;
            match *state {
                ServerState::Stopped | ServerState::Crashed => *state = ServerState::Starting,
                other => {
                    if let Some(client) = self.client.lock().await.clone() {
                        return Ok(client);
                    }
                    return Err(McpError::InvalidState {
                        operation: "start",
                        state: other.to_string(),
                    });
                }
            }
        }

        let transport = (self.factory)(&self.server_config, Arc::clone(&self.sink));
        let client = Arc::new(
            McpClient::new(transport, self.client_config.clone())
                .with_debug_sink(Arc::clone(&self.sink)),
        );

        match client.start().await {
            Ok(()) => {
                *self.client.lock().await = Some(Arc::clone(&client));
                *self.state.lock().await = ServerState::Running;
                self.restart_attempts.store(0, Ordering::SeqCst);
                if self.config.health_monitoring {
                    self.spawn_health_loop().await;
                }
                tracing::info!(command = %self.server_config.command.display(), "MCP server running");
                Ok(client)
            }
            Err(e) => {
                self.cancel_health_loop().await;
                *self.state.lock().await = ServerState::Crashed;
                Err(McpError::StartFailed(e.to_string()))
            }
        }
    }

    /// Stop the server and retire the client. No-op when already stopped.
    pub async fn stop(&self) -> Result<(), McpError> {
        self.shutting_down.store(true, Ordering::SeqCst);
        {
            let mut state = self.state.lock().await;
            if *state == ServerState::Stopped {
                self.shutting_down.store(false, Ordering::SeqCst);
                return Ok(());
            }
            *state = ServerState::ShuttingDown;
        }

        self.cancel_health_loop().await;

        let client = self.client.lock().await.take();
        let result = match client {
            Some(client) => client.stop().await,
            None => Ok(()),
        };

        *self.state.lock().await = ServerState::Stopped;
        self.shutting_down.store(false, Ordering::SeqCst);

        result.map_err(|e| McpError::StopFailed(e.to_string()))
    }

    /// Stop (when needed), settle, start.
    pub async fn restart(self: &Arc<Self>) -> Result<Arc<McpClient>, McpError> {
        if self.state().await != ServerState::Stopped {
            self.stop().await?;
        }
        tokio::time::sleep(Duration::from_millis(self.config.restart_settle_delay_ms)).await;
        self.start().await
    }

    async fn spawn_health_loop(self: &Arc<Self>) {
        self.cancel_health_loop().await;

        let cancel = CancellationToken::new();
        let manager = Arc::clone(self);
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            manager.health_loop(token).await;
        });
        *self.health_task.lock().await = Some((task, cancel));
    }

    async fn cancel_health_loop(&self) {
        if let Some((task, cancel)) = self.health_task.lock().await.take() {
            cancel.cancel();
            task.abort();
            let _ = task.await;
        }
    }

    /// Periodic readiness probe. The interval sleep is chunked so a shutdown
    /// is observed within a fraction of the interval, not at its end.
    async fn health_loop(self: Arc<Self>, cancel: CancellationToken) {
        let interval = Duration::from_millis(self.config.health_check_interval_ms);
        let chunks = self.config.health_check_chunks.max(1);
        let chunk = interval / chunks;

        loop {
            for _ in 0..chunks {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(chunk) => {}
                }
            }

            if self.shutting_down.load(Ordering::SeqCst) {
                return;
            }

            let healthy = match self.client.lock().await.clone() {
                Some(client) => client.is_ready(),
                None => false,
            };
            if !healthy {
                tracing::warn!("MCP health check failed");
                // Crash handling runs outside this task, so the restart it
                // triggers can retire this loop and spawn a fresh one.
                let manager = Arc::clone(&self);
                tokio::spawn(async move {
                    manager.handle_crash().await;
                });
                return;
            }
        }
    }

    /// Bounded-retry crash recovery with exponential backoff. Exhaustion
    /// leaves the manager `Crashed` until an external start/restart.
    ///
    /// Returns a boxed future rather than being an `async fn` because this
    /// method and [`Self::start`]/[`Self::spawn_health_loop`] call each
    /// other indirectly (via spawned tasks); leaving it as an `async fn`
    /// makes the compiler unable to resolve the resulting opaque-type cycle
    /// when checking `Send`.
    fn handle_crash(
        self: &Arc<Self>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        let this = Arc::clone(self);
        Box::pin(async move {
            *this.state.lock().await = ServerState::Crashed;
            if this.shutting_down.load(Ordering::SeqCst) {
                return;
            }

            loop {
                let attempts = this.restart_attempts.load(Ordering::SeqCst);
                if attempts >= this.config.max_restart_attempts {
                    tracing::error!(
                        attempts,
                        "MCP server crashed; restart attempts exhausted, giving up"
                    );
                    return;
                }
                this.restart_attempts.store(attempts + 1, Ordering::SeqCst);

                let delay = retry::restart_delay(attempts);
                tracing::warn!(
                    "MCP server crashed; restarting in {}s (attempt {}/{})",
                    delay.as_secs(),
                    attempts + 1,
                    this.config.max_restart_attempts
                );
                tokio::time::sleep(delay).await;

                match this.restart().await {
                    Ok(_) => return,
                    Err(e) => tracing::error!("automatic restart failed: {e}"),
                }

                if this.shutting_down.load(Ordering::SeqCst) {
                    return;
                }
            }
        })
    }
}
