//! Scripted in-memory transport shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tether_mcp::{Transport, TransportError};
use tokio::sync::{Mutex, Notify};

/// Decides the response body (a map with `result` or `error`) for the nth
/// call of a method, 1-based. `None` leaves the request unanswered.
pub type Responder = Arc<dyn Fn(&str, usize) -> Option<Value> + Send + Sync>;

/// In-memory [`Transport`] that answers requests from a script.
pub struct MockTransport {
    responder: Responder,
    calls: Mutex<HashMap<String, usize>>,
    notifications: Mutex<Vec<String>>,
    queue: Mutex<VecDeque<Vec<u8>>>,
    notify: Notify,
    connected: AtomicBool,
    closed: AtomicBool,
    starts: AtomicUsize,
    cleared_sessions: AtomicUsize,
}

impl MockTransport {
    pub fn new(responder: Responder) -> Arc<Self> {
        Arc::new(Self {
            responder,
            calls: Mutex::new(HashMap::new()),
            notifications: Mutex::new(Vec::new()),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(true),
            starts: AtomicUsize::new(0),
            cleared_sessions: AtomicUsize::new(0),
        })
    }

    /// How many times `method` has been requested across all sessions.
    pub async fn call_count(&self, method: &str) -> usize {
        self.calls.lock().await.get(method).copied().unwrap_or(0)
    }

    /// Notification methods sent by the client, in order.
    pub async fn notifications(&self) -> Vec<String> {
        self.notifications.lock().await.clone()
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn cleared_sessions(&self) -> usize {
        self.cleared_sessions.load(Ordering::SeqCst)
    }

    /// Queue a raw response as if the peer had pushed it.
    pub async fn inject(&self, response: Value) {
        let encoded = serde_json::to_vec(&response).expect("test response serializes");
        self.queue.lock().await.push_back(encoded);
        self.notify.notify_one();
    }

    /// Simulate the peer dropping the connection.
    pub fn fail_connection(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn start(&self) -> Result<(), TransportError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.queue.lock().await.clear();
        self.closed.store(false, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
        Ok(())
    }

    async fn send(&self, message: &[u8]) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }

        let value: Value = serde_json::from_slice(message).map_err(|e| {
            TransportError::WriteFailed {
                reason: e.to_string(),
            }
        })?;
        let method = value["method"].as_str().unwrap_or_default().to_string();

        let Some(id) = value.get("id").and_then(Value::as_u64) else {
            self.notifications.lock().await.push(method);
            return Ok(());
        };

        let call = {
            let mut calls = self.calls.lock().await;
            let count = calls.entry(method.clone()).or_insert(0);
            *count += 1;
            *count
        };

        if let Some(mut body) = (self.responder)(&method, call) {
            body["jsonrpc"] = "2.0".into();
            body["id"] = id.into();
            self.inject(body).await;
        }
        Ok(())
    }

    async fn receive(&self) -> Result<Vec<u8>, TransportError> {
        loop {
            if let Some(message) = self.queue.lock().await.pop_front() {
                return Ok(message);
            }
            if self.closed.load(Ordering::SeqCst) {
                return Err(TransportError::ConnectionClosed);
            }
            self.notify.notified().await;
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn clear_session(&self) {
        self.cleared_sessions.fetch_add(1, Ordering::SeqCst);
    }
}

/// Handshake result body every well-behaved mock returns.
pub fn init_result() -> Value {
    serde_json::json!({
        "result": {
            "capabilities": { "tools": {} },
            "serverInfo": { "name": "mock-server", "version": "1.0.0" }
        }
    })
}

/// Responder where the handshake succeeds and every other request echoes its
/// method name back.
pub fn ok_responder() -> Responder {
    Arc::new(|method, _call| {
        if method == "initialize" {
            Some(init_result())
        } else {
            Some(serde_json::json!({ "result": { "method": method } }))
        }
    })
}
