//! Error types for mcp-stdio-gateway.
//!
//! Two families live here:
//!
//! - [`ConfigError`] for loading and validating the configuration file.
//! - [`GatewayError`] for everything that can go wrong while serving a
//!   client: spawning children, validating requests, pumping bytes and
//!   recovering sessions.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file could not be read.
    #[error("failed to read configuration file: {path}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Configuration file could not be parsed.
    #[error("failed to parse configuration file: {path}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Configuration file not found.
    #[error("configuration file not found: {path}")]
    NotFound {
        /// Path where the configuration file was expected.
        path: PathBuf,
    },

    /// Configuration validation failed.
    #[error("configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation failure.
        message: String,
    },
}

/// Message returned to callers when their session's child was recreated.
pub const SESSION_RESTARTED_MESSAGE: &str =
    "MCP session restarted. Some context may be lost. Please retry with the same parameters.";

/// Message returned to callers when no restart is attempted.
pub const TEMPORARY_FAILURE_MESSAGE: &str =
    "Temporary connection issue. Please retry immediately with the same parameters.";

/// Substrings that identify an error caused by a dead or unreachable child.
///
/// Matching is done on the rendered message, case-insensitively.
const RETRIABLE_SIGNATURES: &[&str] = &[
    "broken pipe",
    "eof",
    "process exited",
    "connection reset",
    "i/o timeout",
];

/// Errors raised while serving clients.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// The command line is empty or otherwise unusable.
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// The child process could not be started.
    #[error("failed to spawn `{command}`")]
    Spawn {
        /// The command line that failed.
        command: String,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The boot command did not succeed.
    #[error("boot command `{command}` failed: {reason}")]
    Boot {
        /// The shell command that was run.
        command: String,
        /// Exit status or spawn error.
        reason: String,
    },

    /// The client sent a malformed request or headers.
    #[error("protocol validation failed: {0}")]
    Protocol(String),

    /// Reading from or writing to a pipe or socket failed.
    #[error("transport I/O error: {0}")]
    Transport(#[from] std::io::Error),

    /// The child closed its output stream.
    #[error("unexpected EOF: child process closed its output")]
    ChildClosed,

    /// No complete response arrived in time.
    #[error("i/o timeout: no response within {0:?}")]
    Timeout(Duration),

    /// Non-durable mode and the session has no bound process.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// The child answered with a JSON-RPC error object.
    #[error("{message}")]
    Rpc {
        /// JSON-RPC error code from the child.
        code: i32,
        /// Error message from the child.
        message: String,
        /// Optional error data from the child.
        data: Option<serde_json::Value>,
    },

    /// The session's child was recreated; the caller should retry.
    #[error("{}", SESSION_RESTARTED_MESSAGE)]
    SessionRestarted,

    /// The session is temporarily unusable; the caller should retry.
    #[error("{}", TEMPORARY_FAILURE_MESSAGE)]
    TemporaryFailure,
}

impl GatewayError {
    /// Returns `true` if this error looks like a dead child process.
    ///
    /// Classification is by message content, not by variant, so that I/O
    /// errors surfaced through any layer are recognised the same way.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        if matches!(self, Self::SessionRestarted | Self::TemporaryFailure) {
            return false;
        }
        let message = self.to_string().to_lowercase();
        RETRIABLE_SIGNATURES
            .iter()
            .any(|signature| message.contains(signature))
    }
}
