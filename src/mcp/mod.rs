//! Model Context Protocol (MCP) plumbing.
//!
//! The gateway mostly forwards MCP traffic without looking inside it. This
//! module holds the parts that do look:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          mcp                                 │
//! │                                                              │
//! │   ┌─────────────┐    ┌─────────────┐    ┌────────────────┐   │
//! │   │  protocol   │◀───│   client    │◀───│  capabilities  │   │
//! │   │ (classify)  │    │  (stdio)    │    │ (introspection)│   │
//! │   └─────────────┘    └─────────────┘    └────────────────┘   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! - [`protocol`]: JSON-RPC types and message classification, used by every
//!   transport.
//! - [`client`]: line-delimited JSON-RPC client for one child, used by the
//!   session transport.
//! - [`capabilities`]: what the wrapped server offers, captured at startup.
//!
//! # Protocol Version
//!
//! Children are initialized with MCP protocol version 2024-11-05.

pub mod capabilities;
pub mod client;
pub mod protocol;

pub use capabilities::CapabilitySet;
pub use client::{ChildClient, ProcessClientFactory, RpcClient};
pub use protocol::{
    classify, JsonRpcError, JsonRpcResponse, Message, MessageKind,
    MCP_PROTOCOL_VERSION,
};
