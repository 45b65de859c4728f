//! Synchronous facade over [`McpClient`].
//!
//! For request handlers that are not async. One multi-threaded runtime is
//! owned for the facade's lifetime, so stdio sessions and their background
//! tasks survive between calls while each call still runs to completion on
//! its own. Must not be used from inside another tokio runtime.

use std::sync::Arc;

use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

use super::client::McpClient;
use super::config::McpServersConfig;
use super::errors::McpError;
use super::session::{AuthStatus, Clock, PendingAuth, SystemClock};
use super::types::{AuthCallbackResult, FunctionDeclaration, ToolCallResult, ToolDescriptor};

pub struct BlockingMcpClient {
    inner: Arc<McpClient>,
    runtime: Runtime,
}

impl BlockingMcpClient {
    pub fn from_config(config: McpServersConfig) -> Result<Self, McpError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: McpServersConfig, clock: Arc<dyn Clock>) -> Result<Self, McpError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("fi-mcp-worker")
            .build()
            .map_err(|e| McpError::Runtime {
                reason: e.to_string(),
            })?;
        let inner = Arc::new(McpClient::with_clock(config, clock)?);
        Ok(Self { inner, runtime })
    }

    /// The async client this facade drives.
    pub fn inner(&self) -> &Arc<McpClient> {
        &self.inner
    }

    pub fn list_tools(&self) -> Vec<ToolDescriptor> {
        self.runtime.block_on(self.inner.list_tools())
    }

    pub fn get_tools(&self) -> Vec<FunctionDeclaration> {
        self.runtime.block_on(self.inner.get_tools())
    }

    pub fn call_tool(&self, name: &str, arguments: serde_json::Value) -> ToolCallResult {
        self.runtime.block_on(self.inner.call_tool(name, arguments))
    }

    pub fn call_tool_with_cancel(
        &self,
        name: &str,
        arguments: serde_json::Value,
        cancel: &CancellationToken,
    ) -> ToolCallResult {
        self.runtime
            .block_on(self.inner.call_tool_with_cancel(name, arguments, cancel))
    }

    pub fn call_server_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: serde_json::Value,
    ) -> ToolCallResult {
        self.runtime
            .block_on(self.inner.call_server_tool(server, tool, arguments))
    }

    pub fn generate_auth_session(
        &self,
        server: &str,
        owner: Option<&str>,
    ) -> Result<PendingAuth, McpError> {
        self.runtime
            .block_on(self.inner.generate_auth_session(server, owner))
    }

    pub fn mark_session_authenticated(&self, server: &str, session_id: &str) -> AuthCallbackResult {
        self.runtime
            .block_on(self.inner.mark_session_authenticated(server, session_id))
    }

    pub fn is_authenticated(&self, server: &str) -> bool {
        self.inner.is_authenticated(server)
    }

    pub fn authentication_status(&self, server: &str) -> Result<AuthStatus, McpError> {
        self.inner.authentication_status(server)
    }

    pub fn reset_session(&self, server: &str) {
        self.inner.reset_session(server);
    }

    pub fn cleanup_expired_sessions(&self) -> usize {
        self.inner.cleanup_expired_sessions()
    }

    pub fn probe(&self, server: &str) -> bool {
        self.runtime.block_on(self.inner.probe(server))
    }

    pub fn shutdown(&self) {
        self.runtime.block_on(self.inner.shutdown());
    }
}

impl Drop for BlockingMcpClient {
    fn drop(&mut self) {
        // Inside another runtime block_on would panic; kill_on_drop covers it.
        if tokio::runtime::Handle::try_current().is_err() {
            self.runtime.block_on(self.inner.shutdown());
        }
    }
}
