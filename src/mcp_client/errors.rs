//! MCP client error types.

use serde::Serialize;
use thiserror::Error;

/// Errors that can occur during MCP client operations.
///
/// None of these cross the dispatcher boundary as-is: `McpClient::call_tool`
/// folds them into a failed [`ToolCallResult`](super::types::ToolCallResult).
#[derive(Debug, Error)]
pub enum McpError {
    /// Server registry missing, unreadable or malformed. Fatal at startup.
    #[error("config error: {reason}")]
    ConfigError { reason: String },

    /// A stdio server process could not be started or died during startup.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },

    /// The HTTP endpoint could not be reached.
    #[error("connection to server '{server}' failed: {reason}")]
    ConnectionFailed { server: String, reason: String },

    /// The initialize handshake failed.
    #[error("server '{name}' initialization failed: {reason}")]
    InitFailed { name: String, reason: String },

    /// Pipe I/O or framing failure before the request was handed over.
    #[error("transport error for server '{server}': {reason}")]
    TransportError { server: String, reason: String },

    /// The request went out but no reply came back. The server may have
    /// acted on it.
    #[error("lost reply from server '{server}': {reason}")]
    ResponseLost { server: String, reason: String },

    /// JSON-RPC `error` member, or an envelope we cannot interpret.
    #[error("protocol error [{code}]: {message}")]
    ProtocolError {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Non-success HTTP status that is not an auth signal.
    #[error("HTTP {status} from server '{server}': {body}")]
    HttpStatus {
        server: String,
        status: u16,
        body: String,
    },

    /// The call did not complete within its budget.
    #[error("'{operation}' on server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        operation: String,
        timeout_ms: u64,
    },

    /// The caller cancelled the call.
    #[error("'{operation}' on server '{server}' was cancelled")]
    Cancelled { server: String, operation: String },

    /// Name does not belong to any configured server.
    #[error("unknown server: '{name}'")]
    UnknownServer { name: String },

    /// Prefixed tool name could not be resolved.
    #[error("unknown tool: '{name}'")]
    UnknownTool { name: String },

    /// Tool call arguments failed schema validation.
    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    /// The async runtime behind the blocking facade could not start.
    #[error("failed to start async runtime: {reason}")]
    Runtime { reason: String },

    /// The server has no URL to derive a login page from.
    #[error("server '{server}' does not support session authentication")]
    AuthNotSupported { server: String },
}

/// Coarse failure class surfaced to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Config,
    Connection,
    Protocol,
    Timeout,
    Cancelled,
    UnknownTool,
    InvalidArguments,
}

impl McpError {
    /// Broken connection: the cached handle is dropped and read-only
    /// operations may be retried.
    ///
    /// Protocol errors, auth signals and timeouts are never transient.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            McpError::ConnectionFailed { .. }
                | McpError::TransportError { .. }
                | McpError::ResponseLost { .. }
        )
    }

    /// Whether the request may have reached the server before failing.
    ///
    /// Side-effecting calls are only retried when this is false.
    pub fn may_have_reached_server(&self) -> bool {
        !matches!(
            self,
            McpError::ConnectionFailed { .. }
                | McpError::TransportError { .. }
                | McpError::SpawnFailed { .. }
                | McpError::InitFailed { .. }
        )
    }

    /// The failure class reported in a failed `ToolCallResult`.
    pub fn kind(&self) -> FailureKind {
        match self {
            McpError::ConfigError { .. }
            | McpError::AuthNotSupported { .. }
            | McpError::Runtime { .. } => FailureKind::Config,
            McpError::SpawnFailed { .. }
            | McpError::ConnectionFailed { .. }
            | McpError::InitFailed { .. }
            | McpError::TransportError { .. }
            | McpError::ResponseLost { .. } => FailureKind::Connection,
            McpError::ProtocolError { .. } | McpError::HttpStatus { .. } => FailureKind::Protocol,
            McpError::Timeout { .. } => FailureKind::Timeout,
            McpError::Cancelled { .. } => FailureKind::Cancelled,
            McpError::UnknownServer { .. } | McpError::UnknownTool { .. } => {
                FailureKind::UnknownTool
            }
            McpError::InvalidArguments { .. } => FailureKind::InvalidArguments,
        }
    }

    pub(crate) fn config(reason: impl Into<String>) -> Self {
        McpError::ConfigError {
            reason: reason.into(),
        }
    }
}
