//! Configuration structures for deserialisation.
//!
//! These structures map directly to the JSON configuration file format.
//! Every section is optional; missing values fall back to the defaults the
//! gateway has always shipped with.

use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Hard upper bound on the number of pre-spawned idle processes.
pub const MAX_POOL_SIZE: usize = 10;

/// Root configuration structure.
///
/// This is the top-level structure that matches the JSON config file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Optional JSON schema reference (ignored during parsing).
    #[serde(rename = "$schema", default)]
    _schema: Option<String>,

    /// Optional comment field (ignored during parsing).
    #[serde(rename = "_comment", default)]
    _comment: Option<String>,

    /// Command line of the stdio MCP server to wrap.
    #[serde(default)]
    pub command: String,

    /// Shell command run once before the server starts.
    #[serde(default)]
    pub boot_command: Option<String>,

    /// Which transport to expose.
    #[serde(default)]
    pub transport: Transport,

    /// Listener settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Warm process pool settings.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Child termination settings.
    #[serde(default)]
    pub process: ProcessConfig,

    /// Stateless HTTP transport settings.
    #[serde(default)]
    pub http: HttpConfig,

    /// Session transport settings.
    #[serde(default)]
    pub session: SessionConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any validation checks fail.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command.split_whitespace().next().is_none() {
            return Err(ConfigError::ValidationError {
                message: "command must not be empty (set it in the config file, --command or MCP_COMMAND)"
                    .to_string(),
            });
        }

        for (name, path) in [
            ("server.http_path", &self.server.http_path),
            ("server.websocket_path", &self.server.websocket_path),
        ] {
            if !path.starts_with('/') {
                return Err(ConfigError::ValidationError {
                    message: format!("{name} must start with '/', got '{path}'"),
                });
            }
        }

        if self.pool.maintenance_interval_secs == 0 {
            return Err(ConfigError::ValidationError {
                message: "pool.maintenance_interval_secs must be greater than 0".to_string(),
            });
        }

        if self.http.response_timeout_secs == 0 {
            return Err(ConfigError::ValidationError {
                message: "http.response_timeout_secs must be greater than 0".to_string(),
            });
        }

        if self.session.restart_window_secs == 0 {
            return Err(ConfigError::ValidationError {
                message: "session.restart_window_secs must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

/// Transport exposed by the gateway.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Persistent WebSocket connection bridged to one child.
    Websocket,
    /// Stateless streamable HTTP, one child per request.
    Http,
    /// Streamable HTTP with one initialised child per MCP session.
    #[default]
    Session,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Websocket => f.write_str("websocket"),
            Self::Http => f.write_str("http"),
            Self::Session => f.write_str("session"),
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Socket address to bind.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Route for the streamable HTTP endpoint.
    #[serde(default = "default_http_path")]
    pub http_path: String,

    /// Route for the WebSocket endpoint.
    #[serde(default = "default_websocket_path")]
    pub websocket_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            http_path: default_http_path(),
            websocket_path: default_websocket_path(),
        }
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_http_path() -> String {
    "/mcp".to_string()
}

fn default_websocket_path() -> String {
    "/ws".to_string()
}

/// Warm process pool configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    /// Number of idle processes to keep ready. Clamped to [0, 10].
    #[serde(default)]
    pub size: usize,

    /// Seconds between replenishment passes.
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,
}

impl PoolConfig {
    /// Returns the configured size clamped to [`MAX_POOL_SIZE`].
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.size.min(MAX_POOL_SIZE)
    }

    /// Returns the maintenance interval.
    #[must_use]
    pub const fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 0,
            maintenance_interval_secs: default_maintenance_interval(),
        }
    }
}

const fn default_maintenance_interval() -> u64 {
    5
}

/// Child termination configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessConfig {
    /// How long to wait for a natural exit after closing stdin.
    #[serde(default = "default_grace_period")]
    pub grace_period_ms: u64,

    /// How long to wait after SIGTERM before SIGKILL.
    #[serde(default = "default_kill_timeout")]
    pub kill_timeout_ms: u64,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period(),
            kill_timeout_ms: default_kill_timeout(),
        }
    }
}

const fn default_grace_period() -> u64 {
    2000
}

const fn default_kill_timeout() -> u64 {
    1000
}

/// How strictly the POST `Accept` header is checked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcceptPolicy {
    /// Both `application/json` and `text/event-stream` must be listed.
    #[default]
    Strict,
    /// Either of the two media types is enough.
    Lenient,
}

/// Stateless HTTP transport configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpConfig {
    /// Seconds to wait for a complete single-JSON response.
    #[serde(default = "default_response_timeout")]
    pub response_timeout_secs: u64,

    /// POST `Accept` header policy.
    #[serde(default)]
    pub accept_policy: AcceptPolicy,
}

impl HttpConfig {
    /// Returns the response wait timeout.
    #[must_use]
    pub const fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            response_timeout_secs: default_response_timeout(),
            accept_policy: AcceptPolicy::default(),
        }
    }
}

const fn default_response_timeout() -> u64 {
    30
}

/// Session transport configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Recreate dead session processes automatically.
    #[serde(default = "default_true")]
    pub durable: bool,

    /// Restarts allowed inside one restart window.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Length of the restart window in seconds.
    #[serde(default = "default_restart_window")]
    pub restart_window_secs: u64,
}

impl SessionConfig {
    /// Returns the restart window.
    #[must_use]
    pub const fn restart_window(&self) -> Duration {
        Duration::from_secs(self.restart_window_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            durable: default_true(),
            max_restarts: default_max_restarts(),
            restart_window_secs: default_restart_window(),
        }
    }
}

const fn default_true() -> bool {
    true
}

const fn default_max_restarts() -> u32 {
    3
}

const fn default_restart_window() -> u64 {
    300
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
