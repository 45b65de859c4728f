//! Transport contract shared by the stdio and HTTP transports.
//!
//! Also home to the response helpers both transports use to turn a JSON-RPC
//! `result` into a [`RawResult`]. Remote content is loosely typed: a `text`
//! item may hold embedded JSON or plain prose, and decoding must never fail
//! on it.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use super::config::TransportKind;
use super::errors::McpError;
use super::types::{JsonRpcResponse, McpToolSchema, ToolDescriptor};

/// Body substring a server uses to reject an unknown `Mcp-Session-Id`.
pub const INVALID_SESSION_SENTINEL: &str = "Invalid session ID";

/// Decoded `status` value meaning the user must log in first.
const LOGIN_REQUIRED_STATUS: &str = "login_required";

// ─── Request ID Generator ────────────────────────────────────────────────────

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide monotonic JSON-RPC request id.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Contract ────────────────────────────────────────────────────────────────

/// What a transport got back from a successful exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum RawResult {
    /// Decoded first content item (object, array, or plain string).
    Success(serde_json::Value),
    /// The server ran the tool and reported `isError`.
    ToolError(String),
    /// No valid session: the user must complete a login first.
    AuthRequired {
        /// Login page supplied by the server, if it sent one.
        login_url: Option<String>,
        message: Option<String>,
    },
}

/// A connected server.
///
/// `connect` is the constructor of each implementation; once built a handle
/// is shared behind an `Arc` and may be called from concurrent tasks.
#[async_trait]
pub trait Transport: Send + Sync {
    fn server_name(&self) -> &str;

    fn kind(&self) -> TransportKind;

    /// `tools/list`, normalized into descriptors tagged with this server.
    async fn list_tools(&self, session_id: Option<&str>) -> Result<Vec<ToolDescriptor>, McpError>;

    /// `tools/call`. `session_id` is ignored by transports without sessions.
    async fn call(
        &self,
        tool: &str,
        arguments: &serde_json::Value,
        session_id: Option<&str>,
    ) -> Result<RawResult, McpError>;

    /// Best-effort reachability check. Never errors.
    async fn probe(&self) -> bool;

    /// Tell the server a session finished its external login.
    async fn register_session(&self, _session_id: &str, _owner: Option<&str>) -> Result<(), McpError> {
        Ok(())
    }
}

// ─── HTTP error classification ───────────────────────────────────────────────

/// Typed meaning of a non-success HTTP reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpErrorClass {
    /// The session header was rejected; surface a login prompt.
    AuthRequired,
    /// Anything else; reported as a protocol failure.
    Protocol,
}

/// The single place that inspects error bodies for the session sentinel.
pub fn classify_http_error(status: u16, body: &str) -> HttpErrorClass {
    if status == 400 && body.contains(INVALID_SESSION_SENTINEL) {
        HttpErrorClass::AuthRequired
    } else {
        HttpErrorClass::Protocol
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ProtocolError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ProtocolError {
        code: super::types::error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

/// Decode embedded JSON, falling back to the raw string.
pub fn decode_text(text: &str) -> serde_json::Value {
    serde_json::from_str(text).unwrap_or_else(|_| serde_json::Value::String(text.to_string()))
}

/// Turn a `tools/call` result into a [`RawResult`].
///
/// Only the first content item is decoded. A result without text content is
/// returned whole.
pub fn decode_tool_result(result: serde_json::Value) -> RawResult {
    let is_error = result
        .get("isError")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);

    let first_text = result
        .get("content")
        .and_then(serde_json::Value::as_array)
        .and_then(|items| items.first())
        .filter(|item| item.get("type").and_then(|t| t.as_str()) == Some("text"))
        .map(|item| item.get("text").and_then(|t| t.as_str()).unwrap_or_default());

    if is_error {
        return RawResult::ToolError(first_text.unwrap_or("tool reported an error").to_string());
    }

    let Some(text) = first_text else {
        return RawResult::Success(result);
    };

    let decoded = decode_text(text);
    if decoded.get("status").and_then(|s| s.as_str()) == Some(LOGIN_REQUIRED_STATUS) {
        return RawResult::AuthRequired {
            login_url: decoded
                .get("login_url")
                .and_then(|u| u.as_str())
                .map(str::to_string),
            message: decoded
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string),
        };
    }

    RawResult::Success(decoded)
}

/// Parse a `tools/list` result into descriptors for `server_name`.
pub fn parse_tools_list(
    server_name: &str,
    result: serde_json::Value,
) -> Result<Vec<ToolDescriptor>, McpError> {
    let tools = result
        .get("tools")
        .cloned()
        .unwrap_or_else(|| serde_json::json!([]));

    let schemas: Vec<McpToolSchema> =
        serde_json::from_value(tools).map_err(|e| McpError::ProtocolError {
            code: super::types::error_codes::PARSE_ERROR,
            message: format!("malformed tools/list reply from '{server_name}': {e}"),
            data: None,
        })?;

    Ok(schemas
        .into_iter()
        .map(|schema| ToolDescriptor::from_schema(server_name, schema))
        .collect())
}

/// `initialize` params this client sends to every server.
pub fn initialize_params() -> serde_json::Value {
    serde_json::json!({
        "protocolVersion": "2024-11-05",
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
        "capabilities": {},
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
