//! Integration tests for the stateless streamable HTTP transport.
//!
//! The router is driven with `tower::ServiceExt::oneshot`; children are real
//! processes (`cat` or the shell fixture in `tests/fixtures/`).

#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use futures::StreamExt;
use tower::ServiceExt;

use mcp_stdio_gateway::config::AcceptPolicy;
use mcp_stdio_gateway::gateway::server::streamable_router;
use mcp_stdio_gateway::gateway::{sse, GatewayContext, GatewayStats, StreamableSettings};
use mcp_stdio_gateway::process::{Launcher, PoolSettings, TerminationPolicy};

const BOTH: &str = "application/json, text/event-stream";

fn mock_server() -> String {
    format!("sh {}/tests/fixtures/mock_mcp.sh", env!("CARGO_MANIFEST_DIR"))
}

async fn gateway(command: &str, settings: StreamableSettings) -> (Router, Arc<GatewayContext>) {
    let policy = TerminationPolicy {
        grace: Duration::from_millis(300),
        kill_timeout: Duration::from_millis(300),
    };
    let launcher = Launcher::new(command, policy).unwrap();
    let ctx = Arc::new(GatewayContext::start(launcher, PoolSettings::default(), settings).await);
    (streamable_router(Arc::clone(&ctx), "/mcp"), ctx)
}

fn lenient() -> StreamableSettings {
    StreamableSettings {
        accept_policy: AcceptPolicy::Lenient,
        ..StreamableSettings::default()
    }
}

fn post(accept: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri("/mcp")
        .header("mcp-protocol-version", "2024-11-05")
        .header(header::ACCEPT, accept)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

// =============================================================================
// Rejections that never touch a process
// =============================================================================

#[tokio::test]
async fn get_without_event_stream_accept_is_rejected() {
    let (router, ctx) = gateway("cat", StreamableSettings::default()).await;

    let request = Request::builder()
        .method(Method::GET)
        .uri("/mcp")
        .header("mcp-protocol-version", "2024-11-05")
        .header(header::ACCEPT, "application/json")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(ctx.stats(), GatewayStats::default());
}

#[tokio::test]
async fn post_without_protocol_version_is_rejected() {
    let (router, ctx) = gateway("cat", StreamableSettings::default()).await;

    let request = Request::builder()
        .method(Method::POST)
        .uri("/mcp")
        .header(header::ACCEPT, BOTH)
        .body(Body::from(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(body_text(response).await.contains("MCP-Protocol-Version"));
    assert_eq!(ctx.stats(), GatewayStats::default());
}

#[tokio::test]
async fn client_response_is_accepted_without_process() {
    let (router, ctx) = gateway("cat", StreamableSettings::default()).await;

    let response = router.oneshot(post(BOTH, r#"{"result":1}"#)).await.unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(ctx.stats(), GatewayStats::default());
}

#[tokio::test]
async fn strict_policy_needs_both_media_types() {
    let (router, ctx) = gateway("cat", StreamableSettings::default()).await;

    let response = router
        .oneshot(post("application/json", r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(ctx.stats(), GatewayStats::default());
}

#[tokio::test]
async fn invalid_json_is_rejected() {
    let (router, ctx) = gateway("cat", StreamableSettings::default()).await;

    let response = router.oneshot(post(BOTH, "not json")).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(ctx.stats(), GatewayStats::default());
}

#[tokio::test]
async fn other_methods_are_not_allowed() {
    let (router, _ctx) = gateway("cat", StreamableSettings::default()).await;

    let request = Request::builder()
        .method(Method::PUT)
        .uri("/mcp")
        .header("mcp-protocol-version", "2024-11-05")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

// =============================================================================
// Single JSON responses
// =============================================================================

#[tokio::test]
async fn ping_returns_child_line_verbatim() {
    let (router, ctx) = gateway(&mock_server(), lenient()).await;

    let response = router
        .oneshot(post("application/json", r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/json"
    );
    // The notification printed before the response is skipped.
    assert_eq!(body_text(response).await, r#"{"jsonrpc":"2.0","id":1,"result":{}}"#);
    assert_eq!(ctx.stats().spawned, 1);
}

#[tokio::test]
async fn notification_response_is_accepted() {
    let command = format!(
        "sh {}/tests/fixtures/notification_ack.sh",
        env!("CARGO_MANIFEST_DIR")
    );
    let (router, ctx) = gateway(&command, lenient()).await;

    let response = router
        .oneshot(post(
            "application/json",
            r#"{"jsonrpc":"2.0","id":5,"method":"notifications/cancelled"}"#,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert!(body_text(response).await.is_empty());
    assert_eq!(ctx.stats().spawned, 1);
}

#[tokio::test]
async fn silent_child_times_out() {
    let settings = StreamableSettings {
        response_timeout: Duration::from_millis(300),
        accept_policy: AcceptPolicy::Lenient,
    };
    // `cat` echoes the request back, which is never a final response.
    let (router, _ctx) = gateway("cat", settings).await;

    let response = router
        .oneshot(post("application/json", r#"{"jsonrpc":"2.0","id":7,"method":"slow"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
}

#[tokio::test]
async fn exiting_child_is_an_internal_error() {
    let (router, _ctx) = gateway("true", lenient()).await;

    let response = router
        .oneshot(post("application/json", r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

// =============================================================================
// Event streams
// =============================================================================

#[tokio::test]
async fn event_stream_stops_after_line_without_id() {
    let (router, _ctx) = gateway(&mock_server(), StreamableSettings::default()).await;

    let response = router
        .oneshot(post(BOTH, r#"{"jsonrpc":"2.0","id":3,"method":"ping"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        sse::EVENT_STREAM
    );
    assert_eq!(response.headers().get(header::CACHE_CONTROL).unwrap(), "no-cache");

    let events = tokio::time::timeout(Duration::from_secs(5), body_text(response))
        .await
        .expect("stream finished");
    let events = sse::parse_events(&events);

    assert_eq!(events.len(), 2);
    assert!(events[0].data.contains("notifications/message"));
    assert_eq!(events[1].event.as_deref(), Some("done"));
    assert_eq!(events[1].data, "");
}

#[tokio::test]
async fn event_stream_skips_non_json_output() {
    let (router, _ctx) = gateway(&mock_server(), StreamableSettings::default()).await;

    let response = router
        .oneshot(post(BOTH, r#"{"jsonrpc":"2.0","id":4,"method":"tools/list"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // The response carries an id, so the stream stays open; read one frame.
    let mut frames = response.into_body().into_data_stream();
    let first = tokio::time::timeout(Duration::from_secs(5), frames.next())
        .await
        .expect("frame in time")
        .expect("stream open")
        .unwrap();
    let events = sse::parse_events(std::str::from_utf8(&first).unwrap());

    assert_eq!(events.len(), 1);
    assert!(events[0].data.starts_with(r#"{"jsonrpc":"2.0","id":4,"result":{"tools""#));
}

#[tokio::test]
async fn get_streams_child_output() {
    let command = r#"echo {"jsonrpc":"2.0","method":"hello"}"#;
    let (router, ctx) = gateway(command, StreamableSettings::default()).await;

    let request = Request::builder()
        .method(Method::GET)
        .uri("/mcp")
        .header("mcp-protocol-version", "2024-11-05")
        .header(header::ACCEPT, sse::EVENT_STREAM)
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let text = tokio::time::timeout(Duration::from_secs(5), body_text(response))
        .await
        .expect("stream finished");
    let events = sse::parse_events(&text);

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].data, r#"{"jsonrpc":"2.0","method":"hello"}"#);
    assert_eq!(ctx.stats().spawned, 1);
}
