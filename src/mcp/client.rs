//! Line-delimited JSON-RPC client for a child MCP server.
//!
//! The session transport talks MCP to its children instead of forwarding
//! bytes, so it needs the client half of the stdio transport: write one
//! request line, then read lines until the matching response arrives.
//!
//! Lines that are not the awaited response are handled as follows:
//!
//! - notifications and stray responses are skipped;
//! - requests initiated by the child are answered with `Method not found`;
//! - non-JSON lines (banners, debug output) are skipped.

use std::io;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use super::protocol::{
    JsonRpcError, JsonRpcErrorData, Message, MessageKind, OutgoingNotification, OutgoingRequest,
    RequestId, MCP_PROTOCOL_VERSION, SERVER_NAME,
};
use crate::error::GatewayError;
use crate::process::{ChildProcess, Launcher};
use crate::session::{ClientFactory, SessionClient};

/// JSON-RPC over a pair of byte streams.
///
/// Requests are serialised: the reader lock is held from writing the
/// request until its response has been read.
#[derive(Debug)]
pub struct RpcClient<R, W> {
    reader: Mutex<R>,
    writer: Mutex<Option<W>>,
    next_id: AtomicI64,
    timeout: Duration,
}

impl<R, W> RpcClient<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Creates a client; every request must complete within `timeout`.
    pub fn new(reader: R, writer: W, timeout: Duration) -> Self {
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(Some(writer)),
            next_id: AtomicI64::new(1),
            timeout,
        }
    }

    /// Sends a request and waits for its result.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::Rpc`] if the child answered with an error object
    /// - [`GatewayError::ChildClosed`] if the child's output ended first
    /// - [`GatewayError::Timeout`] if no answer arrived in time
    /// - [`GatewayError::Transport`] if the request could not be written
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, GatewayError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = OutgoingRequest::new(RequestId::Number(id), method, params.as_ref());
        let line = serde_json::to_string(&request)
            .map_err(|e| GatewayError::Protocol(format!("failed to encode request: {e}")))?;

        let mut reader = self.reader.lock().await;
        trace!(id, method, "Sending request to child");
        self.write_line(&line).await?;

        tokio::time::timeout(self.timeout, self.read_response(&mut *reader, id))
            .await
            .map_err(|_| GatewayError::Timeout(self.timeout))?
    }

    /// Sends a notification. No answer is expected.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] if the line could not be written.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), GatewayError> {
        let line = serde_json::to_string(&OutgoingNotification::new(method, params))
            .map_err(|e| GatewayError::Protocol(format!("failed to encode notification: {e}")))?;
        self.write_line(&line).await
    }

    /// Drops the writer, closing the child's stdin.
    pub async fn close_writer(&self) {
        drop(self.writer.lock().await.take());
    }

    async fn write_line(&self, line: &str) -> Result<(), GatewayError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe: child stdin is closed")
        })?;

        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }

    async fn read_response(&self, reader: &mut R, id: i64) -> Result<Value, GatewayError> {
        let expected = json!(id);
        let mut line = String::new();

        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                return Err(GatewayError::ChildClosed);
            }

            let text = line.trim();
            if text.is_empty() {
                continue;
            }
            let Ok(message) = Message::parse(text) else {
                debug!(line = %text, "Skipping non JSON-RPC output from child");
                continue;
            };

            match message.kind {
                MessageKind::Response { id: ref got } if *got == expected => {
                    return into_result(message.body);
                }
                MessageKind::Request { id, method } => {
                    self.refuse_child_request(id, &method).await?;
                }
                MessageKind::Notification { method } => {
                    trace!(method = %method, "Ignoring notification from child");
                }
                MessageKind::Response { id } => {
                    debug!(id = %id, "Ignoring response to an unknown request");
                }
                MessageKind::NotificationResponse | MessageKind::Unclassified => {
                    debug!("Ignoring unclassified message from child");
                }
            }
        }
    }

    /// Answers a request initiated by the child; the gateway serves none.
    async fn refuse_child_request(&self, id: Value, method: &str) -> Result<(), GatewayError> {
        let Ok(id) = serde_json::from_value::<RequestId>(id) else {
            debug!(method, "Ignoring child request with an invalid id");
            return Ok(());
        };
        let error = JsonRpcError::method_not_found(id, method);
        let line = serde_json::to_string(&error)
            .map_err(|e| GatewayError::Protocol(format!("failed to encode error: {e}")))?;
        self.write_line(&line).await
    }
}

/// Turns a response object into its result or its error.
fn into_result(mut body: Map<String, Value>) -> Result<Value, GatewayError> {
    if let Some(error) = body.remove("error") {
        return match serde_json::from_value::<JsonRpcErrorData>(error) {
            Ok(data) => Err(GatewayError::Rpc {
                code: data.code,
                message: data.message,
                data: data.data,
            }),
            Err(e) => Err(GatewayError::Protocol(format!(
                "malformed error object from child: {e}"
            ))),
        };
    }
    Ok(body.remove("result").unwrap_or(Value::Null))
}

/// An initialized MCP session with one owned child process.
#[derive(Debug)]
pub struct ChildClient {
    rpc: RpcClient<BufReader<ChildStdout>, ChildStdin>,
    process: Mutex<ChildProcess>,
    initialize_result: Value,
}

impl ChildClient {
    /// Spawns a child and performs the MCP initialize handshake.
    ///
    /// # Errors
    ///
    /// Returns an error if the child cannot be spawned or the handshake
    /// fails. The child is terminated in the latter case.
    pub async fn connect(launcher: &Launcher, timeout: Duration) -> Result<Self, GatewayError> {
        let mut process = launcher.spawn()?;
        let (Some(stdin), Some(stdout)) = (process.take_stdin(), process.take_stdout()) else {
            process.terminate().await;
            return Err(GatewayError::Transport(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "child process has no stdio pipes",
            )));
        };

        let rpc = RpcClient::new(BufReader::new(stdout), stdin, timeout);
        match handshake(&rpc).await {
            Ok(initialize_result) => {
                debug!(pid = ?process.pid(), "Child session initialized");
                Ok(Self {
                    rpc,
                    process: Mutex::new(process),
                    initialize_result,
                })
            }
            Err(e) => {
                warn!(pid = ?process.pid(), error = %e, "Initialize handshake failed");
                rpc.close_writer().await;
                process.terminate().await;
                Err(e)
            }
        }
    }

    /// Returns the child's `initialize` result.
    #[must_use]
    pub const fn initialize_result(&self) -> &Value {
        &self.initialize_result
    }

    /// Sends a request to the child.
    ///
    /// # Errors
    ///
    /// See [`RpcClient::request`].
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, GatewayError> {
        self.rpc.request(method, params).await
    }

    /// Closes stdin, then terminates the child.
    pub async fn close(&self) {
        self.rpc.close_writer().await;
        self.process.lock().await.terminate().await;
    }
}

async fn handshake<R, W>(rpc: &RpcClient<R, W>) -> Result<Value, GatewayError>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let params = json!({
        "protocolVersion": MCP_PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": SERVER_NAME,
            "version": env!("CARGO_PKG_VERSION"),
        },
    });
    let result = rpc.request("initialize", Some(params)).await?;
    rpc.notify("notifications/initialized", None).await?;
    Ok(result)
}

impl SessionClient for ChildClient {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, GatewayError> {
        Self::request(self, method, params).await
    }

    async fn close(&self) {
        Self::close(self).await;
    }
}

/// Connects [`ChildClient`]s for the session manager.
#[derive(Debug, Clone)]
pub struct ProcessClientFactory {
    launcher: Launcher,
    timeout: Duration,
}

impl ProcessClientFactory {
    /// Creates a factory spawning children with `launcher`.
    #[must_use]
    pub const fn new(launcher: Launcher, timeout: Duration) -> Self {
        Self { launcher, timeout }
    }
}

impl ClientFactory for ProcessClientFactory {
    type Client = ChildClient;

    async fn connect(&self) -> Result<ChildClient, GatewayError> {
        ChildClient::connect(&self.launcher, self.timeout).await
    }
}
