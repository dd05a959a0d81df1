//! Persistent LSP client over a child process's stdio pipes.
//!
//! A single reader task owns the server's stdout and is the only party that
//! dispatches into the pending-response registry; callers only register and
//! claim slots. Request ids are allocated and registered under one lock
//! *before* the request bytes are written, so a reply can never race its own
//! registration. The server's stderr is forwarded to this process's stderr
//! stream for operator visibility.
//!
//! Readiness: the JDT language server announces the end of indexing with a
//! `language/status` notification of type `ServiceReady`. The client latches
//! that signal exactly once; queries that need an indexed project must wait
//! for it.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, trace, warn};

use crate::protocol::{read_frame, write_frame, JsonRpcMessage};

/// Log messages forwarded from `window/logMessage` are clipped to this many
/// characters before they reach the operator log.
const LOG_MESSAGE_LIMIT: usize = 200;

/// Failure modes at the RPC boundary. Callers demote all of these to "no
/// result" except where startup handling needs to distinguish them.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("timed out waiting for response")]
    Timeout,
    #[error("no pending request with id {0}")]
    NotFound(i64),
    #[error("server returned an error: {0}")]
    Server(String),
    #[error("connection to the language server closed")]
    Closed,
}

type Outcome = Result<Value, RpcError>;

#[derive(Default)]
struct Registry {
    next_id: i64,
    /// Response slots consumed by the reader task.
    slots: HashMap<i64, oneshot::Sender<Outcome>>,
    /// Receiving halves claimed by `wait_for_result`.
    claims: HashMap<i64, oneshot::Receiver<Outcome>>,
}

/// Asynchronous JSON-RPC client for a language server.
pub struct LspClient {
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    registry: Arc<Mutex<Registry>>,
    ready: watch::Receiver<bool>,
    _child: Option<Child>,
}

impl LspClient {
    /// Start the language server child process and attach to its pipes.
    pub fn spawn(mut command: Command) -> Result<Self> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command.spawn().context("failed to start the language server")?;

        let stdin = child.stdin.take().context("language server stdin not piped")?;
        let stdout = child.stdout.take().context("language server stdout not piped")?;
        let stderr = child.stderr.take().context("language server stderr not piped")?;
        tokio::spawn(forward_stderr(stderr));

        Ok(Self::attach(Box::new(stdin), Box::new(stdout), Some(child)))
    }

    /// Attach to an arbitrary transport. Used by tests to talk to an
    /// in-process server over a duplex pipe.
    pub fn from_io<W, R>(writer: W, reader: R) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self::attach(Box::new(writer), Box::new(reader), None)
    }

    fn attach(
        writer: Box<dyn AsyncWrite + Send + Unpin>,
        reader: Box<dyn AsyncRead + Send + Unpin>,
        child: Option<Child>,
    ) -> Self {
        let registry = Arc::new(Mutex::new(Registry::default()));
        let (ready_tx, ready_rx) = watch::channel(false);
        tokio::spawn(read_loop(reader, Arc::clone(&registry), ready_tx));
        Self {
            writer: tokio::sync::Mutex::new(writer),
            registry,
            ready: ready_rx,
            _child: child,
        }
    }

    /// Send a request and return its id. The response slot is registered
    /// before the frame is written.
    pub async fn send_request(&self, method: &str, params: Value) -> Result<i64> {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut registry = self.registry.lock();
            registry.next_id += 1;
            let id = registry.next_id;
            registry.slots.insert(id, tx);
            registry.claims.insert(id, rx);
            id
        };

        let message = JsonRpcMessage::request(id, method, params);
        if let Err(err) = self.write_message(&message).await {
            let mut registry = self.registry.lock();
            registry.slots.remove(&id);
            registry.claims.remove(&id);
            return Err(err);
        }
        trace!(method, id, "request sent");
        Ok(id)
    }

    /// Block until the response for `id` arrives or the timeout elapses.
    /// Either way the slot is gone afterwards; a reply that straggles in
    /// after a timeout is discarded by the reader.
    pub async fn wait_for_result(&self, id: i64, timeout: Duration) -> Outcome {
        let claim = self.registry.lock().claims.remove(&id);
        let Some(rx) = claim else {
            return Err(RpcError::NotFound(id));
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                self.registry.lock().slots.remove(&id);
                Err(RpcError::Closed)
            }
            Err(_) => {
                self.registry.lock().slots.remove(&id);
                Err(RpcError::Timeout)
            }
        }
    }

    /// Request/response round trip with a per-request timeout.
    pub async fn request(&self, method: &str, params: Value, timeout: Duration) -> Outcome {
        let id = self
            .send_request(method, params)
            .await
            .map_err(|_| RpcError::Closed)?;
        self.wait_for_result(id, timeout).await
    }

    /// Fire-and-forget notification: no id, no response slot.
    pub async fn send_notification(&self, method: &str, params: Value) -> Result<()> {
        let message = JsonRpcMessage::notification(method, params);
        self.write_message(&message).await?;
        trace!(method, "notification sent");
        Ok(())
    }

    /// Block until the server has reported `ServiceReady` or the timeout
    /// elapses. Queries issued before this returns see a partial index.
    pub async fn wait_for_service_ready(&self, timeout: Duration) -> Result<()> {
        let mut ready = self.ready.clone();
        tokio::time::timeout(timeout, ready.wait_for(|ready| *ready))
            .await
            .context("timed out waiting for the language server to become ready")?
            .context("language server exited before becoming ready")?;
        Ok(())
    }

    async fn write_message(&self, message: &JsonRpcMessage) -> Result<()> {
        let body = serde_json::to_vec(message).context("failed to encode message")?;
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, &body).await
    }
}

async fn forward_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "language_server", "{line}");
    }
}

async fn read_loop(
    reader: Box<dyn AsyncRead + Send + Unpin>,
    registry: Arc<Mutex<Registry>>,
    ready: watch::Sender<bool>,
) {
    let mut reader = BufReader::new(reader);
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("language server stream ended");
                break;
            }
            Err(err) => {
                warn!("language server stream broke: {err}");
                break;
            }
        };

        let message: JsonRpcMessage = match serde_json::from_slice(&frame) {
            Ok(message) => message,
            Err(err) => {
                warn!("dropping unparseable frame: {err}");
                continue;
            }
        };

        if message.is_response() {
            dispatch_response(&registry, message);
            continue;
        }

        match message.method.as_deref() {
            Some("window/logMessage") => {
                if let Some(text) = param_str(&message.params, "message") {
                    let clipped: String = text.chars().take(LOG_MESSAGE_LIMIT).collect();
                    debug!(target: "language_server", "{clipped}");
                }
            }
            Some("language/status") => {
                let status = param_str(&message.params, "type").unwrap_or_default();
                let detail = param_str(&message.params, "message").unwrap_or_default();
                if status == "ServiceReady" {
                    info!("language server is ready");
                    let _ = ready.send(true);
                } else {
                    debug!(status = %status, "{detail}");
                }
            }
            Some(method) => trace!(method, "ignoring server message"),
            None => {}
        }
    }

    // The stream is gone; fail whatever is still waiting.
    let mut registry = registry.lock();
    for (_, slot) in registry.slots.drain() {
        let _ = slot.send(Err(RpcError::Closed));
    }
}

fn dispatch_response(registry: &Mutex<Registry>, message: JsonRpcMessage) {
    let Some(id) = message.id.map(|id| id.value()) else {
        return;
    };
    let slot = registry.lock().slots.remove(&id);
    let Some(slot) = slot else {
        trace!(id, "discarding response with no pending slot");
        return;
    };
    let outcome = match message.error {
        Some(error) => Err(RpcError::Server(error.to_string())),
        None => Ok(message.result.unwrap_or(Value::Null)),
    };
    let _ = slot.send(outcome);
}

fn param_str(params: &Option<Value>, key: &str) -> Option<String> {
    params
        .as_ref()
        .and_then(|params| params.get(key))
        .and_then(Value::as_str)
        .map(str::to_string)
}
