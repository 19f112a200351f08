//! MCP client — the request/response multiplexer over one transport.
//!
//! Owns request-id allocation, the pending-request table, the background
//! receive loop, and the retry/reinitialization policy. Callers issue typed
//! requests through [`McpClient::send_request`]; responses are matched back
//! by id, so any number of requests can be in flight at once.

use crate::config::ClientConfig;
use crate::error::{McpError, TransportError};
use crate::jsonrpc::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::retry;
use crate::transport::{DebugSink, Transport, tracing_sink};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// MCP protocol version we speak.
const PROTOCOL_VERSION: &str = "2024-11-05";

/// Client identity sent in the handshake.
const CLIENT_NAME: &str = "tether";

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<JsonRpcResponse, McpError>>>>>;

/// Server identity reported by the handshake.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Deserialize)]
struct InitializeResult {
    #[serde(default)]
    capabilities: serde_json::Value,
    #[serde(default, rename = "serverInfo")]
    server_info: Option<ServerInfo>,
}

/// Client for a single MCP server connection.
pub struct McpClient {
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    next_id: AtomicU64,
    pending: PendingMap,
    ready: AtomicBool,
    capabilities: Mutex<Option<serde_json::Value>>,
    server_info: Mutex<Option<ServerInfo>>,
    receive_task: Mutex<Option<(JoinHandle<()>, CancellationToken)>>,
    sink: DebugSink,
}

impl fmt::Debug for McpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("McpClient")
            .field("ready", &self.ready.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl McpClient {
    pub fn new(transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        Self {
            transport,
            config,
            next_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
            ready: AtomicBool::new(false),
            capabilities: Mutex::new(None),
            server_info: Mutex::new(None),
            receive_task: Mutex::new(None),
            sink: tracing_sink(),
        }
    }

    /// Replace the debug sink. One timestamped line per outgoing request,
    /// incoming response, and retry decision.
    pub fn with_debug_sink(mut self, sink: DebugSink) -> Self {
        self.sink = sink;
        self
    }

    /// Start the transport, launch the receive loop, and perform the
    /// `initialize` handshake.
    ///
    /// The handshake gets exactly one attempt: a failure here must surface the
    /// real error, not be masked by a silent retry.
    pub async fn start(&self) -> Result<(), McpError> {
        self.transport.start().await?;
        self.spawn_receive_loop().await;

        match self.initialize().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.shutdown_receive_loop().await;
                if let Err(stop_err) = self.transport.stop().await {
                    tracing::warn!("transport stop after failed handshake: {stop_err}");
                }
                Err(e)
            }
        }
    }

    /// Stop the receive loop, fail every pending request with
    /// [`McpError::ClientStopped`], then stop the transport.
    pub async fn stop(&self) -> Result<(), McpError> {
        self.ready.store(false, Ordering::SeqCst);
        self.shutdown_receive_loop().await;
        self.fail_all_pending(|| McpError::ClientStopped).await;
        self.transport.stop().await?;
        Ok(())
    }

    /// True iff the handshake succeeded and the transport reports connected.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst) && self.transport.is_connected()
    }

    /// Capabilities cached from the last successful handshake.
    pub async fn capabilities(&self) -> Option<serde_json::Value> {
        self.capabilities.lock().await.clone()
    }

    /// Apply a predicate to the cached capabilities; false when no handshake
    /// has completed.
    pub async fn has_capability(&self, predicate: impl FnOnce(&serde_json::Value) -> bool) -> bool {
        match self.capabilities.lock().await.as_ref() {
            Some(caps) => predicate(caps),
            None => false,
        }
    }

    /// Server name/version reported by the handshake.
    pub async fn server_info(&self) -> Option<ServerInfo> {
        self.server_info.lock().await.clone()
    }

    /// Send a request and decode its result into `T`.
    ///
    /// Recoverable failures (session, connection, 5xx-class) are retried up to
    /// the configured ceiling with exponential backoff, reinitializing the
    /// session first when the failure calls for it. Everything else propagates
    /// unchanged.
    pub async fn send_request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<T, McpError> {
        if !self.is_ready() {
            return Err(McpError::NotInitialized);
        }

        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        let result = loop {
            match self.request_once(method, params.clone()).await {
                Ok(value) => break value,
                Err(e) if attempt < max_attempts && retry::is_recoverable(&e) => {
                    let delay = retry::retry_delay(attempt);
                    tracing::warn!(
                        "request '{method}' failed (attempt {attempt}/{max_attempts}): {e}; \
                         retrying in {}s",
                        delay.as_secs()
                    );
                    self.debug(format!(
                        "retry {method} in {}s (attempt {attempt}/{max_attempts}): {e}",
                        delay.as_secs()
                    ));
                    if retry::needs_reinitialize(&e) {
                        if let Err(reinit_err) = self.reinitialize().await {
                            tracing::warn!("reinitialization failed: {reinit_err}");
                        }
                    }
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };

        serde_json::from_value(result).map_err(|e| McpError::Decode(e.to_string()))
    }

    /// Send a notification: fire-and-forget, never enters the pending table.
    pub async fn send_notification(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let notification = JsonRpcNotification::new(method, params);
        let encoded = serde_json::to_vec(&notification)?;
        self.transport.send(&encoded).await?;
        Ok(())
    }

    /// Tear the session down and bring it back: fails all pending requests
    /// immediately, clears any session token, restarts the transport, and
    /// redoes the handshake.
    ///
    /// For callers that detect persistent failure outside the request path,
    /// such as a supervising health check.
    pub async fn reconnect(&self) -> Result<(), McpError> {
        self.fail_all_pending(|| McpError::Transport(TransportError::ConnectionClosed))
            .await;
        self.reinitialize().await
    }

    /// One request attempt: register the waiter, send, suspend until the
    /// matching response arrives or the timeout fires.
    async fn request_once(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);
        let encoded = serde_json::to_vec(&request)?;

        // Register before sending, so a reply that races the send still finds
        // its waiter.
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        self.debug(format!("-> {method} (id {id})"));

        if let Err(e) = self.transport.send(&encoded).await {
            self.pending.lock().await.remove(&id);
            return Err(e.into());
        }

        let timeout = Duration::from_millis(self.config.request_timeout_ms);
        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome?,
            Ok(Err(_)) => return Err(McpError::ClientStopped),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                self.debug(format!("<- {method} (id {id}) timed out"));
                return Err(McpError::Timeout {
                    method: method.to_string(),
                    timeout_ms: self.config.request_timeout_ms,
                });
            }
        };

        match &response.error {
            Some(err) => self.debug(format!(
                "<- {method} (id {id}) error code {}: {}",
                err.code, err.message
            )),
            None => self.debug(format!("<- {method} (id {id}) ok")),
        }

        response.into_result()
    }

    /// The `initialize` handshake: fixed protocol version, client identity,
    /// exactly one attempt.
    async fn initialize(&self) -> Result<(), McpError> {
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": CLIENT_NAME,
                "version": env!("CARGO_PKG_VERSION"),
            },
        });

        let result = self.request_once("initialize", Some(params)).await?;
        let init: InitializeResult =
            serde_json::from_value(result).map_err(|e| McpError::Decode(e.to_string()))?;

        *self.capabilities.lock().await = Some(init.capabilities);
        if let Some(info) = &init.server_info {
            tracing::info!(server = %info.name, version = %info.version, "MCP session initialized");
        }
        *self.server_info.lock().await = init.server_info;

        self.send_notification("notifications/initialized", None).await?;
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Clear session state and redo the handshake on a fresh transport
    /// session. Pending requests are left alone; each retries or times out on
    /// its own schedule.
    async fn reinitialize(&self) -> Result<(), McpError> {
        tracing::info!("reinitializing MCP session");
        self.ready.store(false, Ordering::SeqCst);
        *self.capabilities.lock().await = None;

        self.transport.clear_session().await;
        self.shutdown_receive_loop().await;
        self.transport.stop().await?;
        self.transport.start().await?;
        self.spawn_receive_loop().await;

        tokio::time::sleep(Duration::from_millis(self.config.settle_delay_ms)).await;
        self.initialize().await
    }

    async fn spawn_receive_loop(&self) {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(receive_loop(
            Arc::clone(&self.transport),
            Arc::clone(&self.pending),
            Arc::clone(&self.sink),
            cancel.clone(),
        ));
        *self.receive_task.lock().await = Some((task, cancel));
    }

    async fn shutdown_receive_loop(&self) {
        if let Some((task, cancel)) = self.receive_task.lock().await.take() {
            cancel.cancel();
            task.abort();
            let _ = task.await;
        }
    }

    async fn fail_all_pending(&self, make_error: impl Fn() -> McpError) {
        let mut pending = self.pending.lock().await;
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(make_error()));
        }
    }

    fn debug(&self, line: impl AsRef<str>) {
        debug_line(&self.sink, line.as_ref());
    }
}

fn debug_line(sink: &DebugSink, line: &str) {
    let stamp = chrono::Local::now().format("%H:%M:%S%.3f");
    (sink)(&format!("[{stamp}] {line}"));
}

/// Background loop matching incoming responses to pending waiters by id.
///
/// Ends on cancellation, a decode failure, or a transport error. Connection
/// loss fails every pending request; other exits leave the pending table to
/// `stop()`.
async fn receive_loop(
    transport: Arc<dyn Transport>,
    pending: PendingMap,
    sink: DebugSink,
    cancel: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = transport.receive() => received,
        };

        match received {
            Ok(bytes) => {
                let response: JsonRpcResponse = match serde_json::from_slice(&bytes) {
                    Ok(response) => response,
                    Err(e) => {
                        tracing::warn!("failed to decode MCP message: {e}");
                        break;
                    }
                };
                let Some(id) = response.id else {
                    // Server-initiated notification; nothing waits on these.
                    tracing::debug!("ignoring MCP message without id");
                    continue;
                };
                let waiter = pending.lock().await.remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(Ok(response));
                    }
                    None => {
                        tracing::warn!(id, "dropping MCP response with no pending request");
                        debug_line(&sink, &format!("<- dropped response with unknown id {id}"));
                    }
                }
            }
            Err(TransportError::ConnectionClosed) => {
                tracing::warn!("MCP connection closed");
                let mut pending = pending.lock().await;
                for (_, tx) in pending.drain() {
                    let _ = tx.send(Err(McpError::Transport(TransportError::ConnectionClosed)));
                }
                break;
            }
            Err(e) => {
                tracing::warn!("MCP receive failed: {e}");
                break;
            }
        }
    }
}
