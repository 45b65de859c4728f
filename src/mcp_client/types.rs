//! Shared types for the MCP client.
//!
//! JSON-RPC 2.0 message types, MCP tool structures, and the result envelopes
//! handed back to the orchestrator.

use serde::{Deserialize, Serialize};

use super::errors::FailureKind;

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
///
/// `id` is kept loose: some servers echo it as a string.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Whether this response answers request `id`.
    pub fn answers(&self, id: u64) -> bool {
        match &self.id {
            Some(serde_json::Value::Number(n)) => n.as_u64() == Some(id),
            Some(serde_json::Value::String(s)) => s.parse::<u64>().ok() == Some(id),
            _ => false,
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const INTERNAL_ERROR: i64 = -32603;
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// One entry of a `tools/list` reply, as the server sends it.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct McpToolSchema {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "inputSchema", alias = "input_schema")]
    pub input_schema: Option<serde_json::Value>,
}

/// A tool exposed by a configured server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Tool name as the server knows it (unprefixed).
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    pub server_name: String,
}

impl ToolDescriptor {
    pub(crate) fn from_schema(server_name: &str, schema: McpToolSchema) -> Self {
        Self {
            name: schema.name,
            description: schema.description.unwrap_or_default(),
            input_schema: schema
                .input_schema
                .unwrap_or_else(|| serde_json::json!({"type": "object", "properties": {}})),
            server_name: server_name.to_string(),
        }
    }

    /// Name exposed to the LLM: `{server_name}_{name}`.
    pub fn exposed_name(&self) -> String {
        format!("{}_{}", self.server_name, self.name)
    }
}

/// Function declaration in the shape the LLM orchestrator consumes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl From<&ToolDescriptor> for FunctionDeclaration {
    fn from(tool: &ToolDescriptor) -> Self {
        Self {
            name: tool.exposed_name(),
            description: tool.description.clone(),
            parameters: tool.input_schema.clone(),
        }
    }
}

// ─── Result Envelopes ────────────────────────────────────────────────────────

/// Outcome of a dispatched tool call.
///
/// Serializes untagged, so the orchestrator sees either the plain
/// `{success, result|error, server, tool}` object or the login prompt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ToolCallResult {
    Completed(ToolCallOutcome),
    AuthRequired(AuthRequired),
}

impl ToolCallResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ToolCallResult::Completed(o) if o.success)
    }

    pub fn is_auth_required(&self) -> bool {
        matches!(self, ToolCallResult::AuthRequired(_))
    }

    /// The login prompt, if this call needs an external login first.
    pub fn auth_required(&self) -> Option<&AuthRequired> {
        match self {
            ToolCallResult::AuthRequired(auth) => Some(auth),
            ToolCallResult::Completed(_) => None,
        }
    }

    /// The completed outcome, if the call reached a verdict.
    pub fn outcome(&self) -> Option<&ToolCallOutcome> {
        match self {
            ToolCallResult::Completed(outcome) => Some(outcome),
            ToolCallResult::AuthRequired(_) => None,
        }
    }
}

/// Success or failure of a tool call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCallOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<FailureKind>,
    pub server: String,
    pub tool: String,
    pub execution_time_ms: u64,
}

/// Marker serialized as `"login_required"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginRequired {
    LoginRequired,
}

/// The caller must send the user through `login_url` before retrying.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthRequired {
    pub status: LoginRequired,
    pub login_url: String,
    pub session_id: String,
    pub message: String,
    pub server: String,
    pub tool: String,
}

/// Reply to the web layer's auth callback.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthCallbackResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuthCallbackResult {
    pub(crate) fn ok(session_id: &str) -> Self {
        Self {
            success: true,
            session_id: Some(session_id.to_string()),
            error: None,
        }
    }

    pub(crate) fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            session_id: None,
            error: Some(error.into()),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
