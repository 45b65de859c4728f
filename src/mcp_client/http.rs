//! Stateless JSON-RPC over HTTP POST.
//!
//! Every exchange is a single POST carrying the `Mcp-Session-Id` header.
//! Replies come back either as a plain JSON body or framed as server-sent
//! events; both are accepted.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client as HttpClient;

use super::config::{ClientSettings, ServerConfig, ServerTransport, TransportKind};
use super::errors::McpError;
use super::transport::{
    classify_http_error, decode_tool_result, extract_result, next_request_id, parse_tools_list,
    HttpErrorClass, RawResult, Transport,
};
use super::types::{error_codes, JsonRpcRequest, JsonRpcResponse, ToolDescriptor};

/// Header carrying the session id on every request.
pub const SESSION_HEADER: &str = "Mcp-Session-Id";

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Owner value sent to the login endpoint when none is known.
const UNKNOWN_OWNER: &str = "unknown";

/// What one POST produced.
#[derive(Debug)]
enum HttpReply {
    Rpc(JsonRpcResponse),
    /// 400 with the invalid-session sentinel.
    SessionRejected,
}

/// Handle for one HTTP MCP endpoint.
pub struct HttpTransport {
    server_name: String,
    url: String,
    http: HttpClient,
    call_timeout: Duration,
    probe_timeout: Duration,
    register_session: bool,
}

impl HttpTransport {
    /// Build a handle for `config`. No request is made.
    pub fn connect(config: &ServerConfig, settings: &ClientSettings) -> Result<Self, McpError> {
        let ServerTransport::Http {
            url,
            register_session,
            ..
        } = &config.transport
        else {
            return Err(McpError::config(format!(
                "server '{}' is not an http server",
                config.name
            )));
        };

        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(settings.call_timeout())
            .build()
            .map_err(|e| McpError::ConnectionFailed {
                server: config.name.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            server_name: config.name.clone(),
            url: url.clone(),
            http,
            call_timeout: settings.call_timeout(),
            probe_timeout: settings.probe_timeout(),
            register_session: *register_session,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn post_rpc(
        &self,
        method: &str,
        params: serde_json::Value,
        session_id: Option<&str>,
    ) -> Result<HttpReply, McpError> {
        let id = next_request_id();
        let request = JsonRpcRequest::new(id, method, Some(params));

        let mut builder = self.http.post(&self.url).json(&request);
        if let Some(session_id) = session_id {
            builder = builder.header(SESSION_HEADER, session_id);
        }

        tracing::debug!(server = %self.server_name, method, id, "POST JSON-RPC");

        let response = builder
            .send()
            .await
            .map_err(|e| self.map_send_error(e, method))?;

        let status = response.status();
        let is_sse = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        let body = response.text().await.map_err(|e| McpError::ResponseLost {
            server: self.server_name.clone(),
            reason: format!("failed to read response body: {e}"),
        })?;

        if !status.is_success() {
            return match classify_http_error(status.as_u16(), &body) {
                HttpErrorClass::AuthRequired => {
                    tracing::info!(server = %self.server_name, method, "session rejected by server");
                    Ok(HttpReply::SessionRejected)
                }
                HttpErrorClass::Protocol => Err(McpError::HttpStatus {
                    server: self.server_name.clone(),
                    status: status.as_u16(),
                    body: truncate_body(&body),
                }),
            };
        }

        let parsed = if is_sse {
            parse_sse_body(&body)
        } else {
            serde_json::from_str::<JsonRpcResponse>(&body).ok()
        };

        parsed.map(HttpReply::Rpc).ok_or_else(|| McpError::ProtocolError {
            code: error_codes::PARSE_ERROR,
            message: format!(
                "unparseable reply from '{}': {}",
                self.server_name,
                truncate_body(&body)
            ),
            data: None,
        })
    }

    fn map_send_error(&self, e: reqwest::Error, operation: &str) -> McpError {
        if e.is_timeout() {
            McpError::Timeout {
                server: self.server_name.clone(),
                operation: operation.to_string(),
                timeout_ms: self.call_timeout.as_millis() as u64,
            }
        } else if e.is_connect() {
            McpError::ConnectionFailed {
                server: self.server_name.clone(),
                reason: e.to_string(),
            }
        } else if e.is_builder() {
            McpError::TransportError {
                server: self.server_name.clone(),
                reason: e.to_string(),
            }
        } else {
            // Connected, so the request may already be on the wire.
            McpError::ResponseLost {
                server: self.server_name.clone(),
                reason: e.to_string(),
            }
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn server_name(&self) -> &str {
        &self.server_name
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn list_tools(&self, session_id: Option<&str>) -> Result<Vec<ToolDescriptor>, McpError> {
        match self
            .post_rpc("tools/list", serde_json::json!({}), session_id)
            .await?
        {
            HttpReply::Rpc(response) => parse_tools_list(&self.server_name, extract_result(response)?),
            // Discovery without a session yields an empty catalog.
            HttpReply::SessionRejected => {
                tracing::warn!(server = %self.server_name, "tools/list rejected for missing session");
                Ok(Vec::new())
            }
        }
    }

    async fn call(
        &self,
        tool: &str,
        arguments: &serde_json::Value,
        session_id: Option<&str>,
    ) -> Result<RawResult, McpError> {
        let params = serde_json::json!({
            "name": tool,
            "arguments": arguments,
        });
        match self.post_rpc("tools/call", params, session_id).await? {
            HttpReply::Rpc(response) => Ok(decode_tool_result(extract_result(response)?)),
            HttpReply::SessionRejected => Ok(RawResult::AuthRequired {
                login_url: None,
                message: None,
            }),
        }
    }

    async fn probe(&self) -> bool {
        let url = health_url(&self.url);
        match self.http.get(&url).timeout(self.probe_timeout).send().await {
            Ok(resp) => {
                let healthy = resp.status().is_success();
                tracing::debug!(server = %self.server_name, %url, status = resp.status().as_u16(), "health probe");
                healthy
            }
            Err(e) => {
                tracing::debug!(server = %self.server_name, %url, error = %e, "health probe failed");
                false
            }
        }
    }

    async fn register_session(&self, session_id: &str, owner: Option<&str>) -> Result<(), McpError> {
        if !self.register_session {
            return Ok(());
        }

        let url = login_endpoint(&self.url);
        let form = [
            ("sessionId", session_id),
            ("phoneNumber", owner.unwrap_or(UNKNOWN_OWNER)),
        ];

        tracing::info!(server = %self.server_name, %url, session_id, "registering session");

        let response = self
            .http
            .post(&url)
            .form(&form)
            .send()
            .await
            .map_err(|e| self.map_send_error(e, "register_session"))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(McpError::HttpStatus {
                server: self.server_name.clone(),
                status: status.as_u16(),
                body: truncate_body(&body),
            });
        }
        Ok(())
    }
}

// ─── URL and body helpers ────────────────────────────────────────────────────

/// `.../mcp/stream` → `.../mcp/health`. Other URLs are probed as-is.
pub fn health_url(url: &str) -> String {
    match url.strip_suffix("/stream") {
        Some(base) => format!("{base}/health"),
        None => url.to_string(),
    }
}

/// `.../mcp/stream` → `.../login`.
pub fn login_endpoint(url: &str) -> String {
    let base = url
        .strip_suffix("/mcp/stream")
        .unwrap_or_else(|| url.trim_end_matches('/'));
    format!("{base}/login")
}

/// First JSON-RPC message in a `text/event-stream` body.
fn parse_sse_body(body: &str) -> Option<JsonRpcResponse> {
    body.lines()
        .filter_map(|line| {
            line.strip_prefix("data: ")
                .or_else(|| line.strip_prefix("data:"))
        })
        .find_map(|data| serde_json::from_str::<JsonRpcResponse>(data.trim()).ok())
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 500;
    if body.len() <= MAX {
        return body.to_string();
    }
    let mut end = MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

// ─── Tests ───────────────────────────────────────────────────────────────────
