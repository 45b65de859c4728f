//! JSON-RPC over a stdio server's pipes.
//!
//! Line-delimited JSON, one message per line. A handle carries a single
//! in-flight request at a time: the pipe lock is held from the request write
//! until the matching reply is read. Replies for other ids (left behind by a
//! cancelled caller) and non-JSON log lines are skipped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use super::config::{ServerConfig, TransportKind};
use super::errors::McpError;
use super::lifecycle::ProcessSupervisor;
use super::transport::{
    decode_tool_result, extract_result, initialize_params, next_request_id, parse_tools_list,
    RawResult, Transport,
};
use super::types::{JsonRpcRequest, JsonRpcResponse, ToolDescriptor};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type BoxedReader = BufReader<Box<dyn AsyncRead + Send + Unpin>>;

struct Pipes {
    writer: BoxedWriter,
    reader: BoxedReader,
}

/// Server identity from the `initialize` reply.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

/// Persistent JSON-RPC session with one stdio server.
pub struct StdioTransport {
    server_name: String,
    pipes: Mutex<Pipes>,
    supervisor: Option<Arc<ProcessSupervisor>>,
}

impl StdioTransport {
    /// Spawn `config`'s process and run the initialize handshake.
    ///
    /// The process is stopped again if the handshake fails or exceeds
    /// `handshake_timeout`.
    pub async fn connect(
        config: &ServerConfig,
        supervisor: Arc<ProcessSupervisor>,
        handshake_timeout: Duration,
    ) -> Result<Self, McpError> {
        let pipes = supervisor.spawn(config).await?;
        let mut transport = Self::from_pipes(&config.name, pipes.stdin, pipes.stdout);
        transport.supervisor = Some(Arc::clone(&supervisor));

        match tokio::time::timeout(handshake_timeout, transport.initialize()).await {
            Ok(Ok(info)) => {
                tracing::info!(
                    server = %config.name,
                    remote_name = ?info.name,
                    remote_version = ?info.version,
                    "stdio MCP session initialized"
                );
                Ok(transport)
            }
            Ok(Err(e)) => {
                supervisor.shutdown(&config.name).await;
                Err(McpError::InitFailed {
                    name: config.name.clone(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                supervisor.shutdown(&config.name).await;
                Err(McpError::InitFailed {
                    name: config.name.clone(),
                    reason: format!(
                        "initialization timed out after {}ms",
                        handshake_timeout.as_millis()
                    ),
                })
            }
        }
    }

    /// Wrap already-open pipes. No handshake is performed.
    pub fn from_pipes<W, R>(server_name: &str, writer: W, reader: R) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(reader);
        Self {
            server_name: server_name.to_string(),
            pipes: Mutex::new(Pipes {
                writer: Box::new(writer),
                reader: BufReader::new(reader),
            }),
            supervisor: None,
        }
    }

    /// `initialize` followed by the `notifications/initialized` notification.
    pub async fn initialize(&self) -> Result<ServerInfo, McpError> {
        let response = self.request("initialize", Some(initialize_params())).await?;
        let result = extract_result(response)?;

        let info = result
            .get("serverInfo")
            .cloned()
            .map(serde_json::from_value::<ServerInfo>)
            .transpose()
            .map_err(|e| McpError::InitFailed {
                name: self.server_name.clone(),
                reason: format!("failed to parse initialize response: {e}"),
            })?
            .unwrap_or_default();

        self.notify("notifications/initialized", None).await?;
        Ok(info)
    }

    /// Send a request and wait for the reply carrying the same id.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = next_request_id();
        let line = self.encode(&JsonRpcRequest::new(id, method, params))?;

        let mut pipes = self.pipes.lock().await;
        self.write_line(&mut pipes.writer, &line).await?;

        let mut line_buf = String::new();
        loop {
            line_buf.clear();
            let bytes_read = pipes
                .reader
                .read_line(&mut line_buf)
                .await
                .map_err(|e| self.response_lost(format!("failed to read from stdout: {e}")))?;

            if bytes_read == 0 {
                return Err(self.response_lost("server stdout closed (process may have exited)"));
            }

            let trimmed = line_buf.trim();
            if trimmed.is_empty() {
                continue;
            }

            match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                Ok(resp) if resp.answers(id) => return Ok(resp),
                Ok(_) => {
                    tracing::debug!(server = %self.server_name, expected_id = id, "skipping unrelated message");
                }
                Err(_) => {
                    tracing::debug!(server = %self.server_name, line = trimmed, "skipping non-JSON-RPC output");
                }
            }
        }
    }

    /// Send a notification (no reply expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params.unwrap_or_else(|| serde_json::json!({})),
        });
        let line = self.encode(&notification)?;

        let mut pipes = self.pipes.lock().await;
        self.write_line(&mut pipes.writer, &line).await
    }

    fn encode<T: serde::Serialize>(&self, message: &T) -> Result<String, McpError> {
        let mut json = serde_json::to_string(message)
            .map_err(|e| self.transport_error(format!("failed to serialize message: {e}")))?;
        json.push('\n');
        Ok(json)
    }

    async fn write_line(&self, writer: &mut BoxedWriter, line: &str) -> Result<(), McpError> {
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| self.transport_error(format!("failed to write to stdin: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| self.transport_error(format!("failed to flush stdin: {e}")))
    }

    fn transport_error(&self, reason: impl Into<String>) -> McpError {
        McpError::TransportError {
            server: self.server_name.clone(),
            reason: reason.into(),
        }
    }

    fn response_lost(&self, reason: impl Into<String>) -> McpError {
        McpError::ResponseLost {
            server: self.server_name.clone(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn server_name(&self) -> &str {
        &self.server_name
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn list_tools(&self, _session_id: Option<&str>) -> Result<Vec<ToolDescriptor>, McpError> {
        let response = self
            .request("tools/list", Some(serde_json::json!({})))
            .await?;
        parse_tools_list(&self.server_name, extract_result(response)?)
    }

    async fn call(
        &self,
        tool: &str,
        arguments: &serde_json::Value,
        _session_id: Option<&str>,
    ) -> Result<RawResult, McpError> {
        let params = serde_json::json!({
            "name": tool,
            "arguments": arguments,
        });
        let response = self.request("tools/call", Some(params)).await?;
        Ok(decode_tool_result(extract_result(response)?))
    }

    async fn probe(&self) -> bool {
        match &self.supervisor {
            Some(supervisor) => supervisor.is_alive(&self.server_name).await,
            None => true,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
