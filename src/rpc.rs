//! Multiplexing JSON-RPC 2.0 client over a child process's stdio.
//!
//! One long-lived subprocess serves many concurrent callers. Framing is one
//! JSON message per line. Request ids are a client-wide incrementing counter;
//! a dedicated reader task routes each response line to the waiter registered
//! under its id, and a writer lock serializes stdin writes so concurrent
//! calls cannot interleave frames.
//!
//! On reader termination (EOF, parse failure on the stream, process exit)
//! the client enters a terminal dead state: every pending waiter completes
//! with a `ClientDead` error and subsequent calls fail immediately. The
//! client never retries on behalf of the caller.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::oneshot;

use crate::error::HangarError;

/// JSON-RPC protocol version used on the wire.
pub const JSONRPC_VERSION: &str = "2.0";

/// MCP protocol revision sent during the `initialize` handshake.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// Error object from a JSON-RPC error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A decoded JSON-RPC response: exactly one of `result` / `error` is set.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcErrorObject>,
}

impl RpcResponse {
    /// Extract the result, mapping a protocol-level error payload to the
    /// message the provider layer reports.
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(|e| e.message.clone())
    }
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: &'a Value,
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<RpcResponse>>>>;

/// Rolling buffer for per-provider stderr output, for diagnostics.
pub struct StderrBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl StderrBuffer {
    /// Create a new stderr buffer with the given line capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            capacity,
        }
    }

    /// Push a new stderr line, evicting the oldest if at capacity.
    pub fn push(&mut self, line: String) {
        if self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    /// Join the buffered lines for inclusion in error messages.
    pub fn tail(&self, max_lines: usize) -> String {
        self.lines
            .iter()
            .rev()
            .take(max_lines)
            .rev()
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Number of buffered lines.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Whether the buffer holds no lines.
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Multiplexing JSON-RPC client bound to one child process.
pub struct RpcClient {
    provider_id: String,
    /// Child handle, if this client owns a process (tests drive in-memory pipes).
    child: Mutex<Option<Child>>,
    /// Writer lock — serializes line writes on the child's stdin.
    stdin: tokio::sync::Mutex<Option<Box<dyn AsyncWrite + Send + Unpin>>>,
    pending: PendingMap,
    next_id: AtomicU64,
    /// Set once the reader task has terminated; never cleared.
    dead: Arc<AtomicBool>,
    dead_reason: Arc<Mutex<&'static str>>,
    stderr: Arc<Mutex<StderrBuffer>>,
}

impl RpcClient {
    /// Wrap a spawned child whose stdin/stdout are piped (stderr optional).
    ///
    /// Starts the reader task on stdout and a drain task on stderr.
    pub fn from_child(provider_id: impl Into<String>, mut child: Child) -> crate::Result<Self> {
        let provider_id = provider_id.into();
        let stdin = child.stdin.take().ok_or_else(|| {
            HangarError::Transport(provider_id.clone(), "failed to open stdin pipe".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            HangarError::Transport(provider_id.clone(), "failed to open stdout pipe".to_string())
        })?;

        let client = Self::from_transport(provider_id, stdout, stdin);
        if let Some(stderr) = child.stderr.take() {
            client.spawn_stderr_drain(stderr);
        }
        *client.child.lock().expect("child lock poisoned") = Some(child);
        Ok(client)
    }

    /// Build a client over arbitrary reader/writer halves.
    ///
    /// Used directly by tests; `from_child` delegates here for processes.
    pub fn from_transport<R, W>(provider_id: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let provider_id = provider_id.into();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let dead = Arc::new(AtomicBool::new(false));
        let dead_reason = Arc::new(Mutex::new("reader_died"));

        let client = RpcClient {
            provider_id: provider_id.clone(),
            child: Mutex::new(None),
            stdin: tokio::sync::Mutex::new(Some(
                Box::new(writer) as Box<dyn AsyncWrite + Send + Unpin>
            )),
            pending: pending.clone(),
            next_id: AtomicU64::new(1),
            dead: dead.clone(),
            dead_reason,
            stderr: Arc::new(Mutex::new(StderrBuffer::new(100))),
        };

        tokio::spawn(run_reader(provider_id, reader, pending, dead));
        client
    }

    fn spawn_stderr_drain(&self, stderr: tokio::process::ChildStderr) {
        let provider_id = self.provider_id.clone();
        let buffer = self.stderr.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(provider = %provider_id, line = %line, "provider stderr");
                buffer.lock().expect("stderr lock poisoned").push(line);
            }
        });
    }

    /// True iff the process has not exited and the reader task is running.
    pub fn is_alive(&self) -> bool {
        if self.dead.load(Ordering::SeqCst) {
            return false;
        }
        let mut child = self.child.lock().expect("child lock poisoned");
        match child.as_mut() {
            // try_wait returning Some(status) means the process exited.
            Some(c) => matches!(c.try_wait(), Ok(None)),
            None => true,
        }
    }

    /// Send one request and await its correlated response.
    ///
    /// Fails with `Timeout` when the deadline elapses (the waiter is removed;
    /// the protocol has no cancel verb so nothing is sent downstream), with
    /// `ClientDead` when the reader has terminated, and with `Transport` when
    /// the write itself fails.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> crate::Result<RpcResponse> {
        if self.dead.load(Ordering::SeqCst) {
            return Err(self.dead_error());
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();

        // Register the waiter before writing so a fast response cannot race
        // past an empty pending map.
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(id, tx);

        let request = RpcRequest {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params: &params,
        };
        let mut line = match serde_json::to_string(&request) {
            Ok(line) => line,
            Err(e) => {
                self.remove_waiter(id);
                return Err(HangarError::Transport(
                    self.provider_id.clone(),
                    format!("encode failed: {e}"),
                ));
            }
        };
        line.push('\n');

        {
            let mut stdin = self.stdin.lock().await;
            let writer = match stdin.as_mut() {
                Some(w) => w,
                None => {
                    self.remove_waiter(id);
                    return Err(self.dead_error());
                }
            };
            if let Err(e) = writer.write_all(line.as_bytes()).await {
                self.remove_waiter(id);
                return Err(HangarError::Transport(
                    self.provider_id.clone(),
                    format!("write failed: {e}"),
                ));
            }
            if let Err(e) = writer.flush().await {
                self.remove_waiter(id);
                return Err(HangarError::Transport(
                    self.provider_id.clone(),
                    format!("flush failed: {e}"),
                ));
            }
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(self.dead_error()),
            Err(_) => {
                self.remove_waiter(id);
                Err(HangarError::Timeout {
                    timeout_s: timeout.as_secs_f64(),
                })
            }
        }
    }

    /// Terminate the child and release all waiters.
    ///
    /// Sends no protocol message; the reader drains to EOF after the kill.
    pub async fn close(&self) {
        *self.dead_reason.lock().expect("reason lock poisoned") = "closed";
        self.dead.store(true, Ordering::SeqCst);

        // Dropping stdin closes the pipe; well-behaved providers exit on EOF.
        self.stdin.lock().await.take();

        let child = self.child.lock().expect("child lock poisoned").take();
        if let Some(mut child) = child {
            if let Err(e) = child.start_kill() {
                tracing::debug!(provider = %self.provider_id, error = %e, "kill on close failed");
            }
            let _ = child.wait().await;
        }

        // Dropping the senders completes every pending waiter with ClientDead.
        self.pending.lock().expect("pending lock poisoned").clear();
    }

    /// Recent stderr output from the child, newest last.
    pub fn stderr_tail(&self, max_lines: usize) -> String {
        self.stderr
            .lock()
            .expect("stderr lock poisoned")
            .tail(max_lines)
    }

    fn remove_waiter(&self, id: u64) {
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .remove(&id);
    }

    fn dead_error(&self) -> HangarError {
        let reason = *self.dead_reason.lock().expect("reason lock poisoned");
        HangarError::ClientDead(self.provider_id.clone(), reason.to_string())
    }
}

/// Reader task: consume stdout line-by-line and route responses by id.
async fn run_reader<R>(provider_id: String, reader: R, pending: PendingMap, dead: Arc<AtomicBool>)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                let parsed: Value = match serde_json::from_str(&line) {
                    Ok(v) => v,
                    Err(e) => {
                        // Noisy providers write non-protocol lines to stdout;
                        // discard them rather than killing the session.
                        tracing::debug!(
                            provider = %provider_id,
                            error = %e,
                            "discarding non-JSON stdout line"
                        );
                        continue;
                    }
                };

                let Some(id) = parsed.get("id").and_then(Value::as_u64) else {
                    tracing::debug!(provider = %provider_id, "ignoring message without numeric id");
                    continue;
                };

                let response: RpcResponse = match serde_json::from_value(parsed) {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(provider = %provider_id, id, error = %e, "malformed response");
                        continue;
                    }
                };

                let waiter = pending.lock().expect("pending lock poisoned").remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => {
                        tracing::debug!(provider = %provider_id, id, "response without waiter discarded");
                    }
                }
            }
            Ok(None) | Err(_) => break,
        }
    }

    dead.store(true, Ordering::SeqCst);
    // Dropping the senders completes every pending waiter with ClientDead.
    pending.lock().expect("pending lock poisoned").clear();
    tracing::debug!(provider = %provider_id, "rpc reader terminated");
}
