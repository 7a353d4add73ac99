//! MCP streamable HTTP endpoint for the session transport.
//!
//! The gateway answers the protocol housekeeping itself (`initialize`,
//! `ping` and the list methods, from the captured [`CapabilitySet`]) and
//! forwards tool calls, resource reads and prompt fetches to the child
//! bound to the caller's `Mcp-Session-Id`.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use super::{ClientFactory, SessionManager};
use crate::mcp::protocol::{
    JsonRpcError, JsonRpcResponse, Message, MessageKind, RequestId, SESSION_ID_HEADER,
};
use crate::mcp::CapabilitySet;

/// Methods answered by the session's child.
const FORWARDED_METHODS: [&str; 3] = ["tools/call", "resources/read", "prompts/get"];

/// Shared state of the session endpoint.
pub struct SessionEndpoint<F: ClientFactory> {
    manager: Arc<SessionManager<F>>,
    capabilities: Arc<CapabilitySet>,
}

impl<F: ClientFactory> std::fmt::Debug for SessionEndpoint<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEndpoint")
            .field("manager", &self.manager)
            .finish_non_exhaustive()
    }
}

impl<F: ClientFactory> SessionEndpoint<F> {
    /// Creates the endpoint.
    pub const fn new(manager: Arc<SessionManager<F>>, capabilities: Arc<CapabilitySet>) -> Self {
        Self {
            manager,
            capabilities,
        }
    }

    /// Builds the router serving `path`. Methods other than POST and
    /// DELETE get 405.
    pub fn router(self: Arc<Self>, path: &str) -> Router {
        Router::new()
            .route(path, post(handle_post::<F>).delete(handle_delete::<F>))
            .with_state(self)
    }
}

async fn handle_post<F: ClientFactory>(
    State(endpoint): State<Arc<SessionEndpoint<F>>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let message = match std::str::from_utf8(&body)
        .ok()
        .and_then(|text| Message::parse(text).ok())
    {
        Some(message) => message,
        None => return json_response(StatusCode::BAD_REQUEST, &JsonRpcError::parse_error(), None),
    };

    let (id, method) = match message.kind {
        MessageKind::Request { ref id, ref method } => (id.clone(), method.clone()),
        MessageKind::Notification { .. }
        | MessageKind::Response { .. }
        | MessageKind::NotificationResponse => return StatusCode::ACCEPTED.into_response(),
        MessageKind::Unclassified => {
            return json_response(
                StatusCode::BAD_REQUEST,
                &JsonRpcError::invalid_request(None),
                None,
            );
        }
    };
    let Ok(id) = serde_json::from_value::<RequestId>(id) else {
        return json_response(
            StatusCode::BAD_REQUEST,
            &JsonRpcError::invalid_request(None),
            None,
        );
    };

    if method == "initialize" {
        let session_id = Uuid::new_v4().to_string();
        endpoint.manager.register(&session_id);
        info!(session_id = %session_id, "Session initialized");
        let response = JsonRpcResponse::success(id, endpoint.capabilities.initialize_result());
        return json_response(StatusCode::OK, &response, Some(&session_id));
    }

    let Some(session_id) = header_str(&headers, SESSION_ID_HEADER) else {
        return (StatusCode::BAD_REQUEST, "missing mcp-session-id").into_response();
    };
    if !endpoint.manager.policy().durable && !endpoint.manager.contains(session_id) {
        return (StatusCode::NOT_FOUND, "unknown mcp-session-id").into_response();
    }

    debug!(session_id, method = %method, "Handling session request");
    let outcome = match method.as_str() {
        "ping" => Ok(json!({})),
        "tools/list" | "resources/list" | "prompts/list" => {
            match endpoint.capabilities.list_result(&method) {
                Some(result) => Ok(result),
                None => return method_not_found(id, &method, session_id),
            }
        }
        m if FORWARDED_METHODS.contains(&m) => {
            endpoint
                .manager
                .dispatch(session_id, m, message.params().cloned())
                .await
        }
        _ => return method_not_found(id, &method, session_id),
    };

    match outcome {
        Ok(result) => json_response(
            StatusCode::OK,
            &JsonRpcResponse::success(id, result),
            Some(session_id),
        ),
        Err(e) => {
            debug!(session_id, error = %e, "Session request failed");
            json_response(
                StatusCode::OK,
                &JsonRpcError::from_gateway_error(id, &e),
                Some(session_id),
            )
        }
    }
}

async fn handle_delete<F: ClientFactory>(
    State(endpoint): State<Arc<SessionEndpoint<F>>>,
    headers: HeaderMap,
) -> Response {
    let Some(session_id) = header_str(&headers, SESSION_ID_HEADER) else {
        return (StatusCode::BAD_REQUEST, "missing mcp-session-id").into_response();
    };

    let known = endpoint.manager.unregister(session_id).await;
    if !known && !endpoint.manager.policy().durable {
        return (StatusCode::NOT_FOUND, "unknown mcp-session-id").into_response();
    }
    StatusCode::ACCEPTED.into_response()
}

fn method_not_found(id: RequestId, method: &str, session_id: &str) -> Response {
    json_response(
        StatusCode::OK,
        &JsonRpcError::method_not_found(id, method),
        Some(session_id),
    )
}

fn json_response<T: Serialize>(status: StatusCode, body: &T, session_id: Option<&str>) -> Response {
    let mut response = (status, Json(body)).into_response();
    if let Some(value) = session_id.and_then(|id| HeaderValue::from_str(id).ok()) {
        response.headers_mut().insert(SESSION_ID_HEADER, value);
    }
    response
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|h| h.to_str().ok())
        .filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::error::GatewayError;
    use crate::session::{RestartPolicy, SessionClient};

    struct EchoClient;

    impl SessionClient for EchoClient {
        async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, GatewayError> {
            Ok(json!({ "method": method, "params": params }))
        }

        async fn close(&self) {}
    }

    #[derive(Default)]
    struct EchoFactory {
        connects: AtomicU32,
    }

    impl ClientFactory for EchoFactory {
        type Client = EchoClient;

        async fn connect(&self) -> Result<EchoClient, GatewayError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(EchoClient)
        }
    }

    fn app(durable: bool) -> Router {
        let policy = RestartPolicy {
            durable,
            ..RestartPolicy::default()
        };
        let manager = Arc::new(SessionManager::new(EchoFactory::default(), policy));
        let capabilities = CapabilitySet::from_initialize_result(&json!({
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "echo", "version": "1"},
        }));
        Arc::new(SessionEndpoint::new(manager, Arc::new(capabilities))).router("/mcp")
    }

    fn post(body: &str, session_id: Option<&str>) -> Request<Body> {
        let mut builder = Request::post("/mcp").header("content-type", "application/json");
        if let Some(id) = session_id {
            builder = builder.header(SESSION_ID_HEADER, id);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn result_of(body: &Value) -> Option<&Value> {
        body.get("result")
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn initialize_assigns_session_id() {
        let response = app(false)
            .oneshot(post(r#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#, None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let session_id = response.headers().get(SESSION_ID_HEADER).unwrap();
        assert!(Uuid::parse_str(session_id.to_str().unwrap()).is_ok());

        let body = body_json(response).await;
        assert_eq!(result_of(&body).unwrap()["serverInfo"]["name"], "echo");
    }

    #[tokio::test]
    async fn missing_session_header_is_rejected() {
        let response = app(true)
            .oneshot(post(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found_unless_durable() {
        let request = r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#;

        let response = app(false)
            .oneshot(post(request, Some("nope")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app(true)
            .oneshot(post(request, Some("nope")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(result_of(&body_json(response).await), Some(&json!({})));
    }

    #[tokio::test]
    async fn list_methods_follow_capabilities() {
        let router = app(true);

        let response = router
            .clone()
            .oneshot(post(
                r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#,
                Some("s"),
            ))
            .await
            .unwrap();
        assert_eq!(
            result_of(&body_json(response).await),
            Some(&json!({"tools": []}))
        );

        let response = router
            .oneshot(post(
                r#"{"jsonrpc":"2.0","id":3,"method":"prompts/list"}"#,
                Some("s"),
            ))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn tool_calls_reach_the_session_client() {
        let response = app(true)
            .oneshot(post(
                r#"{"jsonrpc":"2.0","id":"a","method":"tools/call","params":{"name":"echo","arguments":{"x":1}}}"#,
                Some("s"),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["id"], "a");
        assert_eq!(body["result"]["method"], "tools/call");
        assert_eq!(body["result"]["params"]["arguments"]["x"], 1);
    }

    #[tokio::test]
    async fn notifications_and_responses_are_accepted() {
        let router = app(false);
        for body in [
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            r#"{"jsonrpc":"2.0","id":5,"result":{}}"#,
        ] {
            let response = router.clone().oneshot(post(body, None)).await.unwrap();
            assert_eq!(response.status(), StatusCode::ACCEPTED);
        }
    }

    #[tokio::test]
    async fn malformed_bodies_are_rejected() {
        let router = app(false);
        for body in ["{not json", "[1]", r#"{"jsonrpc":"2.0"}"#] {
            let response = router.clone().oneshot(post(body, None)).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }
    }

    #[tokio::test]
    async fn delete_unregisters_session() {
        let router = app(false);
        let response = router
            .clone()
            .oneshot(post(r#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#, None))
            .await
            .unwrap();
        let session_id = response
            .headers()
            .get(SESSION_ID_HEADER)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();

        let delete = Request::delete("/mcp")
            .header(SESSION_ID_HEADER, &session_id)
            .body(Body::empty())
            .unwrap();
        let response = router.clone().oneshot(delete).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let response = router
            .oneshot(post(
                r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#,
                Some(&session_id),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn get_is_not_allowed() {
        let request = Request::get("/mcp").body(Body::empty()).unwrap();
        let response = app(true).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
