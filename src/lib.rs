//! mcp-stdio-gateway: expose a stdio MCP server over the network
//!
//! Many MCP servers only speak JSON-RPC over their standard input and
//! output. This library runs such a server as a child process, one per
//! client, and exposes it over WebSocket or MCP streamable HTTP.
//!
//! # Architecture
//!
//! ```text
//!   client ─┬─ WebSocket ──────────▶ bridge ─────────┐
//!           ├─ HTTP (stateless) ───▶ streamable ─────┼──▶ pool / launcher ──▶ child
//!           └─ HTTP (session) ─────▶ session manager ┘
//! ```
//!
//! # Modules
//!
//! - [`config`] — Configuration loading and validation
//! - [`error`] — Error types
//! - [`process`] — Child lifecycle and the warm pool
//! - [`mcp`] — JSON-RPC types, stdio client and introspection
//! - [`gateway`] — WebSocket and stateless HTTP transports, server
//! - [`session`] — Session transport with automatic recovery

pub mod config;
pub mod error;
pub mod gateway;
pub mod mcp;
pub mod process;
pub mod session;
