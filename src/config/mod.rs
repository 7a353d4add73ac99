//! Configuration file loading and parsing.
//!
//! This module handles loading the configuration file from disk and parsing
//! it into type-safe structures. Command-line flags are layered on top by
//! the binary, after which [`Config::validate`] is called.
//!
//! # Configuration File Locations
//!
//! The configuration file is searched in the following order:
//!
//! 1. Path specified via the `CONFIG_FILE` CLI argument
//! 2. Default location:
//!    - **Linux/macOS:** `~/.mcp-stdio-gateway/config.json`
//!    - **Windows:** `%USERPROFILE%\.mcp-stdio-gateway\config.json`
//!
//! A missing file at the default location is not an error: every field has
//! a default and the wrapped command can come from the command line.

mod settings;

pub use settings::{
    AcceptPolicy, Config, HttpConfig, LoggingConfig, PoolConfig, ProcessConfig, ServerConfig,
    SessionConfig, Transport, MAX_POOL_SIZE,
};

use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Returns the default configuration directory.
///
/// - **Linux/macOS:** `~/.mcp-stdio-gateway/`
/// - **Windows:** `%USERPROFILE%\.mcp-stdio-gateway\`
#[must_use]
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|p| p.join(".mcp-stdio-gateway"))
}

/// Returns the platform-specific default configuration file path.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    default_config_dir().map(|p| p.join("config.json"))
}

/// Loads and parses the configuration file.
///
/// If `path` is `None`, uses the platform-specific default location and
/// falls back to [`Config::default`] when nothing is there.
///
/// # Errors
///
/// Returns an error if:
/// - An explicitly given configuration file cannot be found
/// - The file cannot be read
/// - The JSON is malformed or contains unknown fields
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let config_path = match path {
        Some(p) => {
            if !p.exists() {
                return Err(ConfigError::NotFound {
                    path: p.to_path_buf(),
                });
            }
            p.to_path_buf()
        }
        None => match default_config_path() {
            Some(p) if p.exists() => p,
            _ => return Ok(Config::default()),
        },
    };

    let contents = std::fs::read_to_string(&config_path).map_err(|e| ConfigError::ReadError {
        path: config_path.clone(),
        source: e,
    })?;

    serde_json::from_str(&contents).map_err(|e| ConfigError::ParseError {
        path: config_path,
        source: e,
    })
}
