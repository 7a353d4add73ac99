//! JSON-RPC 2.0 message types for the MCP protocol.
//!
//! The gateway forwards child traffic verbatim, so most of the time it only
//! needs to know what *shape* a message has. [`Message::parse`] decodes a
//! line once and [`classify`] turns the decoded object into a
//! [`MessageKind`]:
//!
//! | Shape                                | Kind                   |
//! |--------------------------------------|------------------------|
//! | `method` + `id`                      | `Request`              |
//! | `method`, no `id`                    | `Notification`         |
//! | `result`/`error` + non-null `id`     | `Response`             |
//! | `result`/`error`, `id` null/absent   | `NotificationResponse` |
//! | anything else                        | `Unclassified`         |
//!
//! The typed request/response structs below are used where the gateway
//! speaks MCP itself: the session endpoint and the stdio client.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::GatewayError;

/// The MCP protocol version this implementation speaks to children.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// Server name reported when a child does not provide one.
pub const SERVER_NAME: &str = "mcp-stdio-gateway";

/// Header carrying the negotiated protocol version.
pub const PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";

/// Header carrying the session identifier.
pub const SESSION_ID_HEADER: &str = "mcp-session-id";

/// A JSON-RPC 2.0 request ID.
///
/// Per the MCP specification, IDs must be strings or integers, never `null`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric request ID.
    Number(i64),
    /// String request ID.
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

/// The shape of one JSON-RPC envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    /// Has a method and an id: expects an answer.
    Request {
        /// The id, as sent.
        id: Value,
        /// The method name.
        method: String,
    },
    /// Has a method and no id.
    Notification {
        /// The method name.
        method: String,
    },
    /// Has a result or error and a non-null id.
    Response {
        /// The id of the request being answered.
        id: Value,
    },
    /// Has a result or error and a null or missing id.
    NotificationResponse,
    /// None of the above.
    Unclassified,
}

impl MessageKind {
    /// Returns `true` for responses, with or without an id.
    #[must_use]
    pub const fn is_response(&self) -> bool {
        matches!(self, Self::Response { .. } | Self::NotificationResponse)
    }
}

/// Classifies a decoded JSON object by its JSON-RPC shape.
#[must_use]
pub fn classify(object: &Map<String, Value>) -> MessageKind {
    let id = object.get("id");

    if let Some(method) = object.get("method") {
        let method = method
            .as_str()
            .map_or_else(|| method.to_string(), str::to_string);
        return match id {
            Some(id) => MessageKind::Request {
                id: id.clone(),
                method,
            },
            None => MessageKind::Notification { method },
        };
    }

    if object.contains_key("result") || object.contains_key("error") {
        return match id {
            Some(id) if !id.is_null() => MessageKind::Response { id: id.clone() },
            _ => MessageKind::NotificationResponse,
        };
    }

    MessageKind::Unclassified
}

/// A JSON-RPC message decoded once, together with its classification.
#[derive(Debug, Clone)]
pub struct Message {
    /// The classification of `body`.
    pub kind: MessageKind,
    /// The decoded object.
    pub body: Map<String, Value>,
}

impl Message {
    /// Decodes one JSON object.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Protocol`] if `text` is not JSON or not an object.
    pub fn parse(text: &str) -> Result<Self, GatewayError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| GatewayError::Protocol(format!("invalid JSON: {e}")))?;
        let Value::Object(body) = value else {
            return Err(GatewayError::Protocol(
                "expected a single JSON-RPC object".to_string(),
            ));
        };
        Ok(Self {
            kind: classify(&body),
            body,
        })
    }

    /// Returns `true` if the object carries an `id` field (even `null`).
    #[must_use]
    pub fn has_id(&self) -> bool {
        self.body.contains_key("id")
    }

    /// Returns the `params` member, if any.
    #[must_use]
    pub fn params(&self) -> Option<&Value> {
        self.body.get("params")
    }
}

/// Returns `true` if `line` is syntactically valid JSON of any kind.
#[must_use]
pub fn is_json(line: &str) -> bool {
    serde_json::from_str::<serde::de::IgnoredAny>(line).is_ok()
}

/// An outgoing JSON-RPC 2.0 request (gateway to child).
#[derive(Debug, Clone, Serialize)]
pub struct OutgoingRequest<'a> {
    /// Always "2.0".
    pub jsonrpc: &'static str,

    /// Request identifier chosen by the gateway.
    pub id: RequestId,

    /// The method to invoke.
    pub method: &'a str,

    /// Optional parameters for the method.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<&'a Value>,
}

impl<'a> OutgoingRequest<'a> {
    /// Creates a new outgoing request.
    #[must_use]
    pub const fn new(id: RequestId, method: &'a str, params: Option<&'a Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

/// An outgoing JSON-RPC 2.0 notification.
#[derive(Debug, Clone, Serialize)]
pub struct OutgoingNotification {
    /// Always "2.0".
    pub jsonrpc: &'static str,

    /// The notification method.
    pub method: String,

    /// Optional parameters for the notification.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl OutgoingNotification {
    /// Creates a new outgoing notification.
    #[must_use]
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.into(),
            params,
        }
    }
}

/// A successful JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponse {
    /// Always "2.0".
    pub jsonrpc: &'static str,

    /// The request ID this response corresponds to.
    pub id: RequestId,

    /// The result of the method call.
    pub result: Value,
}

impl JsonRpcResponse {
    /// Creates a new success response.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // Value is not const-compatible
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result,
        }
    }
}

/// Standard JSON-RPC 2.0 error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Invalid JSON was received by the server.
    ParseError,
    /// The JSON sent is not a valid Request object.
    InvalidRequest,
    /// The method does not exist or is not available.
    MethodNotFound,
    /// Internal JSON-RPC error.
    InternalError,
}

impl ErrorCode {
    /// Returns the numeric code for this error.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InternalError => -32603,
        }
    }

    /// Returns the default message for this error code.
    #[must_use]
    pub const fn default_message(self) -> &'static str {
        match self {
            Self::ParseError => "Parse error",
            Self::InvalidRequest => "Invalid Request",
            Self::MethodNotFound => "Method not found",
            Self::InternalError => "Internal error",
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcErrorData {
    /// The error code.
    pub code: i32,

    /// A short description of the error.
    pub message: String,

    /// Additional information about the error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcErrorData {
    /// Creates a new error from an error code.
    #[must_use]
    pub fn from_code(code: ErrorCode) -> Self {
        Self {
            code: code.code(),
            message: code.default_message().to_string(),
            data: None,
        }
    }

    /// Creates a new error with a custom message.
    #[must_use]
    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            data: None,
        }
    }
}

/// A JSON-RPC 2.0 error response.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcError {
    /// Always "2.0".
    pub jsonrpc: &'static str,

    /// The request ID this error corresponds to (if known).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,

    /// The error details.
    pub error: JsonRpcErrorData,
}

impl JsonRpcError {
    /// Creates a new error response.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // JsonRpcErrorData contains String
    pub fn new(id: Option<RequestId>, error: JsonRpcErrorData) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            error,
        }
    }

    /// Creates a parse error response (ID cannot be determined).
    #[must_use]
    pub fn parse_error() -> Self {
        Self::new(None, JsonRpcErrorData::from_code(ErrorCode::ParseError))
    }

    /// Creates an invalid request error response.
    #[must_use]
    pub fn invalid_request(id: Option<RequestId>) -> Self {
        Self::new(id, JsonRpcErrorData::from_code(ErrorCode::InvalidRequest))
    }

    /// Creates a method not found error response.
    #[must_use]
    pub fn method_not_found(id: RequestId, method: &str) -> Self {
        Self::new(
            Some(id),
            JsonRpcErrorData::with_message(
                ErrorCode::MethodNotFound,
                format!("Method not found: {method}"),
            ),
        )
    }

    /// Creates an internal error response.
    #[must_use]
    pub fn internal_error(id: RequestId, message: impl Into<String>) -> Self {
        Self::new(
            Some(id),
            JsonRpcErrorData::with_message(ErrorCode::InternalError, message),
        )
    }

    /// Converts a gateway error into a response for request `id`.
    ///
    /// Errors returned by the child keep their code, message and data.
    #[must_use]
    pub fn from_gateway_error(id: RequestId, error: &GatewayError) -> Self {
        match error {
            GatewayError::Rpc {
                code,
                message,
                data,
            } => Self::new(
                Some(id),
                JsonRpcErrorData {
                    code: *code,
                    message: message.clone(),
                    data: data.clone(),
                },
            ),
            other => Self::internal_error(id, other.to_string()),
        }
    }
}
