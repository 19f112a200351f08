//! Subprocess transport: runs the MCP server as a child process and speaks
//! newline-delimited messages over its standard streams.
//!
//! stdout is the protocol stream, split on newlines into discrete messages.
//! stderr is drained for diagnostics only and never parsed. Delivery uses a
//! queue + waiter handoff so a message arriving before anyone calls
//! `receive()` is queued instead of lost.

use crate::config::ServerConfig;
use crate::error::TransportError;
use crate::transport::{DebugSink, Transport, TransportFactory};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Bounded wait for the child to exit after stdin closes, before force-kill.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// How much captured stderr to attach to a startup failure.
const STDERR_DIAG_LIMIT: usize = 1_000;

/// A [`TransportFactory`] producing [`ProcessTransport`] instances.
pub fn process_transport_factory() -> TransportFactory {
    Arc::new(|config: &ServerConfig, _sink: DebugSink| {
        Arc::new(ProcessTransport::new(config.clone())) as Arc<dyn Transport>
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelState {
    /// Never started (or between stop and the next start).
    Idle,
    Open,
    Closed,
}

/// Handoff between the stdout reader and `receive()` callers.
struct Mailbox {
    state: ChannelState,
    queue: VecDeque<Vec<u8>>,
    waiters: VecDeque<oneshot::Sender<Result<Vec<u8>, TransportError>>>,
}

impl Mailbox {
    fn new() -> Self {
        Self {
            state: ChannelState::Idle,
            queue: VecDeque::new(),
            waiters: VecDeque::new(),
        }
    }

    fn open(&mut self) {
        self.state = ChannelState::Open;
        self.queue.clear();
    }

    /// Hand the message to a suspended `receive()` call, or queue it for the
    /// next one.
    fn deliver(&mut self, message: Vec<u8>) {
        let mut message = message;
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.send(Ok(message)) {
                Ok(()) => return,
                // Receiver went away (caller dropped the future); try the next.
                Err(Ok(returned)) => message = returned,
                Err(Err(_)) => return,
            }
        }
        self.queue.push_back(message);
    }

    /// Mark the stream closed and resolve every outstanding waiter.
    fn close(&mut self) {
        self.state = ChannelState::Closed;
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(TransportError::ConnectionClosed));
        }
    }
}

struct ProcessHandle {
    child: Child,
    stdout_task: JoinHandle<()>,
    stderr_task: JoinHandle<()>,
    cancel: CancellationToken,
}

/// [`Transport`] implementation over a spawned child process.
///
/// Restartable: `stop()` then `start()` on the same instance spawns a fresh
/// process, which reinitialization relies on.
pub struct ProcessTransport {
    config: ServerConfig,
    stdin: Mutex<Option<ChildStdin>>,
    mailbox: Arc<Mutex<Mailbox>>,
    connected: Arc<AtomicBool>,
    handle: Mutex<Option<ProcessHandle>>,
}

impl ProcessTransport {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            stdin: Mutex::new(None),
            mailbox: Arc::new(Mutex::new(Mailbox::new())),
            connected: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Transport for ProcessTransport {
    async fn start(&self) -> Result<(), TransportError> {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            return Err(TransportError::FailedToStart {
                reason: "transport already started".into(),
            });
        }

        let command = resolve_command(&self.config.command)?;

        let mut child = Command::new(&command)
            .args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::FailedToStart {
                reason: format!("failed to spawn {}: {e}", command.display()),
            })?;

        let stdin = take_pipe(child.stdin.take(), "stdin")?;
        let stdout = take_pipe(child.stdout.take(), "stdout")?;
        let stderr = take_pipe(child.stderr.take(), "stderr")?;

        // Give the process a moment, then confirm it survived startup.
        tokio::time::sleep(Duration::from_millis(self.config.startup_grace_ms)).await;
        if let Ok(Some(status)) = child.try_wait() {
            let diag = drain_stderr(stderr).await;
            return Err(TransportError::FailedToStart {
                reason: format!("server exited during startup ({status}){diag}"),
            });
        }

        self.mailbox.lock().await.open();

        let cancel = CancellationToken::new();
        let stdout_task = tokio::spawn(read_stdout(
            stdout,
            Arc::clone(&self.mailbox),
            Arc::clone(&self.connected),
            cancel.clone(),
        ));
        let stderr_task = tokio::spawn(read_stderr(stderr, cancel.clone()));

        *self.stdin.lock().await = Some(stdin);
        self.connected.store(true, Ordering::SeqCst);
        *handle = Some(ProcessHandle {
            child,
            stdout_task,
            stderr_task,
            cancel,
        });

        tracing::info!(command = %self.config.command.display(), "MCP server process started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        let handle = self.handle.lock().await.take();
        let Some(handle) = handle else {
            return Ok(());
        };
        let ProcessHandle {
            mut child,
            stdout_task,
            stderr_task,
            cancel,
        } = handle;

        // Cancellation first, so the readers unblock before any pipe closes.
        cancel.cancel();
        self.connected.store(false, Ordering::SeqCst);

        // Closing stdin asks the server to exit on its own.
        self.stdin.lock().await.take();

        let mut failure: Option<std::io::Error> = None;
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => tracing::debug!("MCP server exited with {status}"),
            Ok(Err(e)) => failure = Some(e),
            Err(_) => {
                tracing::warn!("MCP server did not exit in time; killing");
                if let Err(e) = child.kill().await {
                    failure = Some(e);
                }
            }
        }

        // Make sure the readers are gone before resolving their mailbox.
        stdout_task.abort();
        stderr_task.abort();
        let _ = stdout_task.await;
        let _ = stderr_task.await;

        self.mailbox.lock().await.close();

        match failure {
            None => Ok(()),
            Some(e) => Err(TransportError::Io(e)),
        }
    }

    async fn send(&self, message: &[u8]) -> Result<(), TransportError> {
        let mut stdin = self.stdin.lock().await;
        let Some(stdin) = stdin.as_mut() else {
            return Err(TransportError::NotConnected);
        };

        let written: std::io::Result<()> = async {
            stdin.write_all(message).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        }
        .await;

        written.map_err(|e| TransportError::WriteFailed {
            reason: e.to_string(),
        })
    }

    async fn receive(&self) -> Result<Vec<u8>, TransportError> {
        let rx = {
            let mut mailbox = self.mailbox.lock().await;
            // Messages queued before close are still delivered.
            if let Some(message) = mailbox.queue.pop_front() {
                return Ok(message);
            }
            match mailbox.state {
                ChannelState::Idle => return Err(TransportError::NotConnected),
                ChannelState::Closed => return Err(TransportError::ConnectionClosed),
                ChannelState::Open => {}
            }
            let (tx, rx) = oneshot::channel();
            mailbox.waiters.push_back(tx);
            rx
        };

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(TransportError::ConnectionClosed),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

fn take_pipe<T>(pipe: Option<T>, name: &str) -> Result<T, TransportError> {
    pipe.ok_or_else(|| TransportError::FailedToStart {
        reason: format!("failed to capture {name}"),
    })
}

/// Resolve the configured command to an executable file, searching PATH for
/// bare names the way the shell would.
fn resolve_command(command: &Path) -> Result<PathBuf, TransportError> {
    if command.components().count() > 1 {
        validate_executable(command)?;
        return Ok(command.to_path_buf());
    }

    let path_var = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(command);
        if candidate.is_file() && validate_executable(&candidate).is_ok() {
            return Ok(candidate);
        }
    }

    Err(TransportError::ServerNotFound {
        path: command.to_path_buf(),
    })
}

fn validate_executable(path: &Path) -> Result<(), TransportError> {
    let metadata = std::fs::metadata(path).map_err(|_| TransportError::ServerNotFound {
        path: path.to_path_buf(),
    })?;

    if metadata.is_dir() {
        return Err(TransportError::FailedToStart {
            reason: format!("{} is a directory", path.display()),
        });
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(TransportError::FailedToStart {
                reason: format!("{} is not executable", path.display()),
            });
        }
    }

    Ok(())
}

/// Consume stdout lines and hand each one to the mailbox. EOF doubles as
/// process-exit detection: the stream only closes when the server is gone.
async fn read_stdout(
    stdout: ChildStdout,
    mailbox: Arc<Mutex<Mailbox>>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };
        match next {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                mailbox.lock().await.deliver(line.into_bytes());
            }
            Ok(None) => {
                tracing::warn!("MCP server closed stdout");
                connected.store(false, Ordering::SeqCst);
                mailbox.lock().await.close();
                break;
            }
            Err(e) => {
                tracing::warn!("error reading MCP server stdout: {e}");
                connected.store(false, Ordering::SeqCst);
                mailbox.lock().await.close();
                break;
            }
        }
    }
}

/// Drain stderr into the log. Never parsed as protocol data.
async fn read_stderr(stderr: ChildStderr, cancel: CancellationToken) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => tracing::debug!(target: "mcp_server_stderr", "{line}"),
                _ => break,
            },
        }
    }
}

/// Grab whatever the failed process wrote to stderr, for the error message.
async fn drain_stderr(stderr: ChildStderr) -> String {
    let mut stderr = stderr;
    let mut buf = String::new();
    let _ = tokio::time::timeout(
        Duration::from_millis(200),
        stderr.read_to_string(&mut buf),
    )
    .await;

    let mut diag = buf.trim().to_string();
    if diag.is_empty() {
        return String::new();
    }
    if diag.len() > STDERR_DIAG_LIMIT {
        diag.truncate(STDERR_DIAG_LIMIT);
        diag.push_str("...");
    }
    format!(": {diag}")
}
