//! WebSocket transport bridge.
//!
//! One connection owns one child. Two pumps run until either side ends:
//!
//! ```text
//!   client ──text frame──▶ inbound pump ──line + \n──▶ child stdin
//!   client ◀──text frame── outbound pump ◀──4 KiB chunks── child stdout
//! ```
//!
//! The pumps share a cancellation token; whichever finishes first cancels
//! the other. The child is then terminated, a close frame is sent and the
//! socket is closed.

use std::fmt::Display;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, Utf8Bytes, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::GatewayContext;
use crate::process::{ChildProcess, Termination};

/// Bytes read from the child per outbound frame at most.
pub const CHUNK_SIZE: usize = 4096;

/// Client bytes allowed to wait for the child before the connection is
/// dropped.
pub const MAX_BACKLOG_BYTES: usize = 8 * 1024 * 1024;

/// Upgrades the connection and bridges it to a pooled or new child.
pub async fn handle_upgrade(
    ws: WebSocketUpgrade,
    State(ctx): State<Arc<GatewayContext>>,
) -> Response {
    let process = match ctx.acquire() {
        Ok(process) => process,
        Err(e) => {
            warn!(error = %e, "Failed to acquire process for WebSocket");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to start MCP server process",
            )
                .into_response();
        }
    };

    let connection_id = Uuid::new_v4();
    ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        run_bridge(sink, stream, process, connection_id).await;
    })
}

/// Pumps frames between a WebSocket and `process` until either side ends.
///
/// Always terminates the process, then sends a close frame and closes the
/// sink. Returns how the process ended.
pub async fn run_bridge<S, R>(
    mut sink: S,
    stream: R,
    mut process: ChildProcess,
    connection_id: Uuid,
) -> Termination
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin + Send + 'static,
{
    let pid = process.pid();
    info!(%connection_id, pid = ?pid, "WebSocket connected");

    let (Some(stdin), Some(stdout)) = (process.take_stdin(), process.take_stdout()) else {
        warn!(%connection_id, "Process has no stdio, closing connection");
        let termination = process.terminate().await;
        close_sink(&mut sink, connection_id).await;
        return termination;
    };

    let cancel = CancellationToken::new();
    let inbound = tokio::spawn(pump_inbound(stream, stdin, cancel.clone(), connection_id));
    let outbound = tokio::spawn(pump_outbound(sink, stdout, cancel.clone(), connection_id));

    // Either pump ending fires the token; the child goes first so that a
    // pump stuck on its pipes is released.
    cancel.cancelled().await;
    let termination = process.terminate().await;

    if let Err(e) = inbound.await {
        warn!(%connection_id, error = %e, "Inbound pump failed");
    }
    match outbound.await {
        Ok(mut sink) => close_sink(&mut sink, connection_id).await,
        Err(e) => warn!(%connection_id, error = %e, "Outbound pump failed"),
    }

    info!(%connection_id, pid = ?pid, ?termination, "WebSocket disconnected");
    termination
}

async fn close_sink<S>(sink: &mut S, connection_id: Uuid)
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    if let Err(e) = sink.send(Message::Close(None)).await {
        trace!(%connection_id, error = %e, "Close frame not delivered");
    }
    if let Err(e) = sink.close().await {
        trace!(%connection_id, error = %e, "Failed to close socket");
    }
}

/// Client frames to child stdin, one line per text frame.
///
/// The socket is read independently of the child's pace so a disconnect
/// is noticed even while a write is blocked on a full pipe.
async fn pump_inbound<R>(
    stream: R,
    stdin: ChildStdin,
    cancel: CancellationToken,
    connection_id: Uuid,
) where
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let _cancel_on_exit = cancel.clone().drop_guard();
    let (tx, rx) = mpsc::unbounded_channel();
    let backlog = AtomicUsize::new(0);

    tokio::select! {
        () = cancel.cancelled() => {}
        () = read_frames(stream, tx, &backlog, connection_id) => {}
        () = write_frames(rx, stdin, &backlog, connection_id) => {}
    }
}

/// Queues text frames for the child until the client goes away or the
/// backlog exceeds [`MAX_BACKLOG_BYTES`].
async fn read_frames<R>(
    mut stream: R,
    tx: mpsc::UnboundedSender<Utf8Bytes>,
    backlog: &AtomicUsize,
    connection_id: Uuid,
) where
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                let len = text.as_str().len();
                let queued = backlog.fetch_add(len, Ordering::AcqRel) + len;
                if queued > MAX_BACKLOG_BYTES {
                    warn!(%connection_id, queued, "Process is not reading its input, closing connection");
                    return;
                }
                if tx.send(text).is_err() {
                    return;
                }
            }
            Ok(Message::Binary(_)) => {
                trace!(%connection_id, "Ignoring binary frame");
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(%connection_id, error = %e, "WebSocket read failed");
                return;
            }
        }
    }
    debug!(%connection_id, "Client closed connection");
}

/// Writes queued frames to the child, one per line.
async fn write_frames(
    mut rx: mpsc::UnboundedReceiver<Utf8Bytes>,
    mut stdin: ChildStdin,
    backlog: &AtomicUsize,
    connection_id: Uuid,
) {
    while let Some(text) = rx.recv().await {
        if let Err(e) = write_frame(&mut stdin, text.as_str()).await {
            debug!(%connection_id, error = %e, "Failed to write to process");
            return;
        }
        backlog.fetch_sub(text.as_str().len(), Ordering::AcqRel);
    }
}

async fn write_frame(stdin: &mut ChildStdin, text: &str) -> std::io::Result<()> {
    stdin.write_all(text.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

/// Child stdout to client text frames. Hands the sink back when done.
async fn pump_outbound<S>(
    mut sink: S,
    mut stdout: ChildStdout,
    cancel: CancellationToken,
    connection_id: Uuid,
) -> S
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let _cancel_on_exit = cancel.clone().drop_guard();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut pending = Vec::with_capacity(CHUNK_SIZE);

    loop {
        let read = tokio::select! {
            () = cancel.cancelled() => break,
            read = stdout.read(&mut buf) => read,
        };

        let n = match read {
            Ok(0) => {
                debug!(%connection_id, "Process closed stdout");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                debug!(%connection_id, error = %e, "Failed to read from process");
                break;
            }
        };

        pending.extend_from_slice(&buf[..n]);
        let text = take_utf8(&mut pending);
        if text.is_empty() {
            continue;
        }
        let sent = tokio::select! {
            () = cancel.cancelled() => break,
            sent = sink.send(Message::Text(text.into())) => sent,
        };
        if let Err(e) = sent {
            debug!(%connection_id, error = %e, "WebSocket write failed");
            break;
        }
    }

    sink
}

/// Removes and returns the longest valid UTF-8 prefix of `pending`.
///
/// An incomplete multi-byte sequence at the end stays in `pending` for the
/// next read. Invalid bytes elsewhere are replaced.
fn take_utf8(pending: &mut Vec<u8>) -> String {
    match std::str::from_utf8(pending) {
        Ok(text) => {
            let text = text.to_string();
            pending.clear();
            text
        }
        Err(e) if e.error_len().is_none() => {
            let tail = pending.split_off(e.valid_up_to());
            let text = String::from_utf8_lossy(pending).into_owned();
            *pending = tail;
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            text
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf8_tail_is_carried_over() {
        // "é" is 0xC3 0xA9.
        let mut pending = b"caf\xC3".to_vec();
        assert_eq!(take_utf8(&mut pending), "caf");
        assert_eq!(pending, b"\xC3");

        pending.extend_from_slice(b"\xA9!");
        assert_eq!(take_utf8(&mut pending), "é!");
        assert!(pending.is_empty());
    }

    #[test]
    fn invalid_bytes_are_replaced() {
        let mut pending = b"a\xFFb".to_vec();
        assert_eq!(take_utf8(&mut pending), "a\u{FFFD}b");
        assert!(pending.is_empty());
    }

    #[test]
    fn incomplete_only_yields_nothing() {
        let mut pending = b"\xE2\x82".to_vec();
        assert_eq!(take_utf8(&mut pending), "");
        assert_eq!(pending.len(), 2);
    }

    #[cfg(unix)]
    mod unix {
        use super::super::*;
        use std::time::Duration;

        use futures::channel::mpsc;

        use crate::process::{Launcher, TerminationPolicy};

        type ClientTx = mpsc::UnboundedSender<Result<Message, axum::Error>>;
        type ClientRx = mpsc::UnboundedReceiver<Message>;

        fn spawn(command: &str) -> ChildProcess {
            let policy = TerminationPolicy {
                grace: Duration::from_millis(300),
                kill_timeout: Duration::from_millis(300),
            };
            Launcher::new(command, policy).unwrap().spawn().unwrap()
        }

        fn start(
            process: ChildProcess,
        ) -> (ClientTx, ClientRx, tokio::task::JoinHandle<Termination>) {
            let (client_tx, server_rx) = mpsc::unbounded();
            let (server_tx, client_rx) = mpsc::unbounded();
            let bridge = tokio::spawn(run_bridge(server_tx, server_rx, process, Uuid::new_v4()));
            (client_tx, client_rx, bridge)
        }

        async fn read_text_until_newline(rx: &mut ClientRx) -> String {
            let mut text = String::new();
            while !text.ends_with('\n') {
                let frame = tokio::time::timeout(Duration::from_secs(5), rx.next())
                    .await
                    .expect("frame in time")
                    .expect("socket open");
                match frame {
                    Message::Text(chunk) => text.push_str(chunk.as_str()),
                    other => panic!("unexpected frame: {other:?}"),
                }
            }
            text
        }

        #[tokio::test]
        async fn text_frames_round_trip_through_child() {
            let (client_tx, mut client_rx, bridge) = start(spawn("cat"));

            client_tx
                .unbounded_send(Ok(Message::Binary(vec![1, 2, 3].into())))
                .unwrap();
            client_tx
                .unbounded_send(Ok(Message::Text(r#"{"jsonrpc":"2.0","id":1}"#.into())))
                .unwrap();
            assert_eq!(
                read_text_until_newline(&mut client_rx).await,
                "{\"jsonrpc\":\"2.0\",\"id\":1}\n"
            );

            drop(client_tx);
            let termination = tokio::time::timeout(Duration::from_secs(5), bridge)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(termination, Termination::Exited);

            let last = client_rx.next().await;
            assert!(matches!(last, Some(Message::Close(None))));
            assert!(client_rx.next().await.is_none());
        }

        #[tokio::test]
        async fn close_frame_ends_bridge() {
            let (client_tx, mut client_rx, bridge) = start(spawn("cat"));
            client_tx.unbounded_send(Ok(Message::Close(None))).unwrap();

            let termination = tokio::time::timeout(Duration::from_secs(5), bridge)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(termination, Termination::Exited);
            assert!(matches!(client_rx.next().await, Some(Message::Close(None))));
        }

        fn assert_reaped(pid: u32) {
            let pid = nix::unistd::Pid::from_raw(i32::try_from(pid).unwrap());
            assert!(nix::sys::signal::kill(pid, None).is_err());
        }

        #[tokio::test]
        async fn disconnect_ends_bridge_while_child_ignores_input() {
            // `sleep` never reads stdin, so this frame fills the pipe.
            let process = spawn("sleep 100");
            let pid = process.pid().unwrap();
            let (client_tx, mut client_rx, bridge) = start(process);

            client_tx
                .unbounded_send(Ok(Message::Text("x".repeat(256 * 1024).into())))
                .unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            drop(client_tx);

            tokio::time::timeout(Duration::from_secs(5), bridge)
                .await
                .expect("bridge finished after client disconnect")
                .unwrap();
            assert!(matches!(client_rx.next().await, Some(Message::Close(None))));
            assert_reaped(pid);
        }

        #[tokio::test]
        async fn unread_backlog_closes_connection() {
            let process = spawn("sleep 100");
            let pid = process.pid().unwrap();
            let (client_tx, _client_rx, bridge) = start(process);

            let frame = "y".repeat(1024 * 1024);
            for _ in 0..=MAX_BACKLOG_BYTES / frame.len() {
                client_tx
                    .unbounded_send(Ok(Message::Text(frame.clone().into())))
                    .unwrap();
            }

            // The client stays connected; the backlog limit ends the bridge.
            tokio::time::timeout(Duration::from_secs(5), bridge)
                .await
                .expect("bridge finished")
                .unwrap();
            assert_reaped(pid);
        }

        #[tokio::test]
        async fn killed_child_ends_both_pumps() {
            let process = spawn("cat");
            let pid = nix::unistd::Pid::from_raw(i32::try_from(process.pid().unwrap()).unwrap());
            let (client_tx, mut client_rx, bridge) = start(process);

            nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL).unwrap();

            // The client never closes; the bridge must still finish.
            tokio::time::timeout(Duration::from_secs(3), bridge)
                .await
                .expect("bridge finished")
                .unwrap();
            assert!(matches!(client_rx.next().await, Some(Message::Close(None))));
            assert!(client_tx.is_closed());

            // Reaped: signal 0 no longer reaches it.
            assert!(nix::sys::signal::kill(pid, None).is_err());
        }
    }
}
