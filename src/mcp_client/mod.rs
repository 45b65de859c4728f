//! MCP Client: JSON-RPC tool servers over stdio and HTTP.
//!
//! This module handles:
//! - Loading the server registry (`mcpServers`) and client settings
//! - Spawning and supervising stdio server processes
//! - JSON-RPC 2.0 over process pipes and over HTTP POST with `Mcp-Session-Id`
//! - Per-server login sessions with expiry
//! - Tool discovery, `{server}_{tool}` naming and dispatch
//!
//! [`McpClient`] is the entry point; [`BlockingMcpClient`] wraps it for
//! synchronous hosts. Every dispatched call yields a [`ToolCallResult`]:
//! a success, a failure, or a login prompt the caller shows to the user.

pub mod blocking;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod http;
pub mod lifecycle;
pub mod registry;
pub mod session;
pub mod stdio;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use blocking::BlockingMcpClient;
pub use client::McpClient;
pub use config::{
    find_config_path, load_config, ClientSettings, McpServersConfig, ServerConfig,
    ServerTransport, TransportKind,
};
pub use errors::{FailureKind, McpError};
pub use registry::{ServerNameIndex, ToolRegistry};
pub use session::{AuthStatus, Clock, ManualClock, PendingAuth, Session, SystemClock};
pub use types::{
    AuthCallbackResult, AuthRequired, FunctionDeclaration, ToolCallOutcome, ToolCallResult,
    ToolDescriptor,
};
