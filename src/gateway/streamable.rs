//! Stateless MCP streamable HTTP transport.
//!
//! Every POST gets its own child, released when the response is complete.
//! A GET opens a dedicated child and streams everything it prints.
//!
//! ```text
//!   request ─▶ MCP-Protocol-Version? ──no──▶ 400
//!                 │
//!                 ├─ GET  ─▶ Accept SSE? ──no──▶ 400
//!                 │             └─ spawn ─▶ stream JSON lines
//!                 ├─ POST ─▶ Accept ok? ──no──▶ 400
//!                 │             ├─ body not one object ─▶ 400
//!                 │             ├─ response/notification response ─▶ 202
//!                 │             └─ acquire ─▶ write ─▶ SSE stream | single JSON
//!                 └─ other ─▶ 405
//! ```

use std::borrow::Cow;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{ChildStdin, ChildStdout};
use tracing::{debug, warn};

use super::{sse, GatewayContext, ProcessLease};
use crate::config::{AcceptPolicy, HttpConfig};
use crate::mcp::protocol::{is_json, Message, MessageKind, PROTOCOL_VERSION_HEADER};

const JSON: &str = "application/json";

/// Behaviour of the stateless HTTP transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamableSettings {
    /// Deadline for a single JSON response.
    pub response_timeout: Duration,
    /// How strictly POST `Accept` headers are checked.
    pub accept_policy: AcceptPolicy,
}

impl Default for StreamableSettings {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(30),
            accept_policy: AcceptPolicy::Strict,
        }
    }
}

impl From<&HttpConfig> for StreamableSettings {
    fn from(config: &HttpConfig) -> Self {
        Self {
            response_timeout: config.response_timeout(),
            accept_policy: config.accept_policy,
        }
    }
}

/// Media types named in the request's `Accept` headers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Accept {
    json: bool,
    event_stream: bool,
}

impl Accept {
    fn from_headers(headers: &HeaderMap) -> Self {
        let mut accept = Self::default();
        for value in headers.get_all(header::ACCEPT) {
            let Ok(value) = value.to_str() else {
                continue;
            };
            accept.json |= value.contains(JSON);
            accept.event_stream |= value.contains(sse::EVENT_STREAM);
        }
        accept
    }

    const fn allows_post(self, policy: AcceptPolicy) -> bool {
        match policy {
            AcceptPolicy::Strict => self.json && self.event_stream,
            AcceptPolicy::Lenient => self.json || self.event_stream,
        }
    }
}

/// Handles every method on the streamable HTTP path.
pub async fn handle(
    State(ctx): State<Arc<GatewayContext>>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let has_version = headers
        .get(PROTOCOL_VERSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| !v.trim().is_empty());
    if !has_version {
        return (StatusCode::BAD_REQUEST, "Missing MCP-Protocol-Version header").into_response();
    }

    let accept = Accept::from_headers(&headers);
    match method {
        Method::GET => open_stream(&ctx, accept),
        Method::POST => forward(&ctx, accept, &body).await,
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

/// GET: relay every JSON line of a dedicated child.
fn open_stream(ctx: &GatewayContext, accept: Accept) -> Response {
    if !accept.event_stream {
        return (StatusCode::BAD_REQUEST, "Accept header must include text/event-stream")
            .into_response();
    }

    let mut process = match ctx.spawn_dedicated() {
        Ok(process) => process,
        Err(e) => {
            warn!(error = %e, "Failed to start stream process");
            return internal_error("Failed to start MCP server process");
        }
    };
    let Some(stdout) = process.take_stdout() else {
        return internal_error("MCP server process has no stdout");
    };
    let lease = ProcessLease::new(process);
    debug!(pid = ?lease.pid(), "Opened server stream");

    let stream = async_stream::stream! {
        let _lease = lease;
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim_end();
                    if is_json(line) {
                        yield Ok::<Bytes, Infallible>(sse::data_frame(line));
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "Server stream read failed");
                    break;
                }
            }
        }
    };

    sse::response(Body::from_stream(stream))
}

/// POST: hand the body to a child and deliver its answer.
async fn forward(ctx: &GatewayContext, accept: Accept, body: &[u8]) -> Response {
    if !accept.allows_post(ctx.settings().accept_policy) {
        return (
            StatusCode::BAD_REQUEST,
            "Accept header must include application/json and text/event-stream",
        )
            .into_response();
    }

    let Some((text, message)) = std::str::from_utf8(body)
        .ok()
        .and_then(|text| Message::parse(text).ok().map(|m| (text, m)))
    else {
        return (StatusCode::BAD_REQUEST, "Invalid JSON-RPC message").into_response();
    };

    if message.kind.is_response() {
        return StatusCode::ACCEPTED.into_response();
    }

    let mut process = match ctx.acquire() {
        Ok(process) => process,
        Err(e) => {
            warn!(error = %e, "Failed to acquire process");
            return internal_error("Failed to start MCP server process");
        }
    };
    let (Some(mut stdin), Some(stdout)) = (process.take_stdin(), process.take_stdout()) else {
        return internal_error("MCP server process has no stdio");
    };
    let lease = ProcessLease::new(process);

    let line = single_line(text);
    if let Err(e) = write_line(&mut stdin, &line).await {
        warn!(pid = ?lease.pid(), error = %e, "Failed to write request to process");
        return internal_error("Failed to write request to MCP server process");
    }

    let lines = BufReader::new(stdout).lines();
    if accept.event_stream {
        relay_events(lease, stdin, lines)
    } else {
        single_response(lease, stdin, lines, ctx.settings().response_timeout).await
    }
}

/// Folds a validated JSON text onto one line.
///
/// JSON strings cannot hold raw line breaks, so every `\r` or `\n` is
/// whitespace between tokens and becomes a space. Nothing else changes.
fn single_line(text: &str) -> Cow<'_, str> {
    if text.contains(['\r', '\n']) {
        Cow::Owned(text.replace(['\r', '\n'], " "))
    } else {
        Cow::Borrowed(text)
    }
}

async fn write_line(stdin: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

/// Streams JSON lines until one lacks an `id`, then sends `done`.
fn relay_events(
    lease: ProcessLease,
    stdin: ChildStdin,
    mut lines: Lines<BufReader<ChildStdout>>,
) -> Response {
    let stream = async_stream::stream! {
        let _lease = lease;
        let _stdin = stdin;
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim_end();
                    if !is_json(line) {
                        continue;
                    }
                    yield Ok::<Bytes, Infallible>(sse::data_frame(line));
                    if Message::parse(line).is_ok_and(|m| !m.has_id()) {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "Process output read failed");
                    break;
                }
            }
        }
        yield Ok(sse::done_frame());
    };

    sse::response(Body::from_stream(stream))
}

/// Waits for the response line and returns it verbatim.
async fn single_response(
    lease: ProcessLease,
    stdin: ChildStdin,
    mut lines: Lines<BufReader<ChildStdout>>,
    timeout: Duration,
) -> Response {
    let outcome = tokio::time::timeout(timeout, async {
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return None,
                Err(e) => {
                    debug!(error = %e, "Process output read failed");
                    return None;
                }
            };
            let Ok(message) = Message::parse(line.trim()) else {
                continue;
            };
            match message.kind {
                MessageKind::Request { .. }
                | MessageKind::Notification { .. }
                | MessageKind::Unclassified => {}
                MessageKind::Response { .. } => return Some(Some(line)),
                MessageKind::NotificationResponse => return Some(None),
            }
        }
    })
    .await;

    drop(stdin);
    let pid = lease.pid();
    drop(lease);

    match outcome {
        Ok(Some(Some(line))) => {
            let mut response = Response::new(Body::from(line.trim().to_string()));
            response
                .headers_mut()
                .insert(header::CONTENT_TYPE, HeaderValue::from_static(JSON));
            response
        }
        Ok(Some(None)) => StatusCode::ACCEPTED.into_response(),
        Ok(None) => internal_error("Failed to read response"),
        Err(_) => {
            warn!(pid = ?pid, ?timeout, "Timed out waiting for response");
            (StatusCode::GATEWAY_TIMEOUT, "Request timeout").into_response()
        }
    }
}

fn internal_error(message: &'static str) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
}
