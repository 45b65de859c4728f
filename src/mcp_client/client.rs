//! MCP Client: high-level interface for tool discovery and execution.
//!
//! Owns the process supervisor, one lazily built connection per server, the
//! session store and the latest tool snapshot. This is the surface the LLM
//! orchestrator and the web layer's auth callback talk to.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::join_all;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::config::{ClientSettings, McpServersConfig, ServerConfig, ServerTransport, TransportKind};
use super::dispatch::{with_retry, CallTimer, Idempotency};
use super::errors::McpError;
use super::http::HttpTransport;
use super::lifecycle::ProcessSupervisor;
use super::registry::{ServerNameIndex, ToolRegistry};
use super::session::{
    AuthRequiredAction, AuthStatus, CallSession, Clock, PendingAuth, SessionStore, SystemClock,
};
use super::stdio::StdioTransport;
use super::transport::{RawResult, Transport};
use super::types::{
    error_codes, AuthCallbackResult, FunctionDeclaration, ToolCallResult, ToolDescriptor,
};

type ConnectionSlot = Mutex<Option<Arc<dyn Transport>>>;

// ─── McpClient ───────────────────────────────────────────────────────────────

/// Multi-server MCP client.
///
/// All methods take `&self`; share it behind an `Arc` across request tasks.
pub struct McpClient {
    servers: HashMap<String, ServerConfig>,
    settings: ClientSettings,
    index: ServerNameIndex,
    supervisor: Arc<ProcessSupervisor>,
    connections: HashMap<String, ConnectionSlot>,
    sessions: SessionStore,
    registry: RwLock<Arc<ToolRegistry>>,
}

impl McpClient {
    /// Build a client for `config`. No server is contacted yet.
    pub fn from_config(config: McpServersConfig) -> Result<Self, McpError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Like [`from_config`](Self::from_config) with an explicit session clock.
    pub fn with_clock(config: McpServersConfig, clock: Arc<dyn Clock>) -> Result<Self, McpError> {
        for (key, server) in &config.servers {
            if key != &server.name {
                return Err(McpError::config(format!(
                    "server entry '{key}' is named '{}'",
                    server.name
                )));
            }
        }

        let settings = config.settings.clone();
        let supervisor = Arc::new(ProcessSupervisor::new(
            settings.startup_grace(),
            settings.shutdown_timeout(),
        ));
        let sessions = SessionStore::new(config.servers.values(), settings.session_ttl(), clock);
        let index = ServerNameIndex::new(config.servers.keys().cloned());
        let connections = config
            .servers
            .keys()
            .map(|name| (name.clone(), Mutex::new(None)))
            .collect();

        tracing::info!(
            servers = ?config.server_names(),
            session_ttl_secs = settings.session_ttl_secs,
            "MCP client configured"
        );

        Ok(Self {
            servers: config.servers.into_iter().collect(),
            settings,
            index,
            supervisor,
            connections,
            sessions,
            registry: RwLock::new(Arc::new(ToolRegistry::new())),
        })
    }

    /// Names of all configured servers, sorted.
    pub fn configured_servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.servers.keys().cloned().collect();
        names.sort();
        names
    }

    /// The last discovered catalog.
    pub fn registry(&self) -> Arc<ToolRegistry> {
        Arc::clone(&self.registry.read().unwrap_or_else(PoisonError::into_inner))
    }

    // ─── Discovery ───────────────────────────────────────────────────────

    /// Discover tools on every server concurrently.
    ///
    /// A server that cannot be reached contributes no tools; the failure is
    /// logged and retried fresh on the next discovery.
    pub async fn list_tools(&self) -> Vec<ToolDescriptor> {
        let names = self.configured_servers();
        let discovered = join_all(names.iter().map(|name| self.discover_server(name))).await;

        let mut registry = ToolRegistry::new();
        let mut all = Vec::new();
        for (name, result) in names.iter().zip(discovered) {
            match result {
                Ok(tools) => {
                    tracing::info!(server = %name, tool_count = tools.len(), "discovered tools");
                    all.extend(tools.iter().cloned());
                    registry.register_server_tools(name, tools);
                }
                Err(e) => {
                    tracing::warn!(server = %name, error = %e, "tool discovery failed");
                }
            }
        }

        *self.registry.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(registry);
        all
    }

    /// Prefixed function declarations for the LLM, from a fresh discovery.
    pub async fn get_tools(&self) -> Vec<FunctionDeclaration> {
        self.list_tools().await;
        self.registry().function_declarations()
    }

    async fn discover_server(&self, server: &str) -> Result<Vec<ToolDescriptor>, McpError> {
        let active = self.sessions.active_session(server);
        let session_id = active.as_deref();
        with_retry(
            server,
            "tools/list",
            self.settings.retry_backoff(),
            Idempotency::ReadOnly,
            || async move {
                let transport = self.connection(server).await?;
                let listed = tokio::time::timeout(
                    self.settings.call_timeout(),
                    transport.list_tools(session_id),
                )
                .await
                .map_err(|_| self.timeout_error(server, "tools/list"))?;
                self.forget_if_broken(server, listed).await
            },
        )
        .await
    }

    // ─── Dispatch ────────────────────────────────────────────────────────

    /// Dispatch a prefixed tool name (`{server}_{tool}`).
    pub async fn call_tool(&self, name: &str, arguments: serde_json::Value) -> ToolCallResult {
        self.dispatch_prefixed(name, arguments, None).await
    }

    /// [`call_tool`](Self::call_tool) that gives up when `cancel` fires.
    pub async fn call_tool_with_cancel(
        &self,
        name: &str,
        arguments: serde_json::Value,
        cancel: &CancellationToken,
    ) -> ToolCallResult {
        self.dispatch_prefixed(name, arguments, Some(cancel)).await
    }

    /// Dispatch to an explicit `(server, tool)` pair.
    pub async fn call_server_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: serde_json::Value,
    ) -> ToolCallResult {
        self.dispatch(server, tool, arguments, None).await
    }

    async fn dispatch_prefixed(
        &self,
        name: &str,
        arguments: serde_json::Value,
        cancel: Option<&CancellationToken>,
    ) -> ToolCallResult {
        match self.index.resolve(name) {
            Some((server, tool)) => self.dispatch(server, tool, arguments, cancel).await,
            None => CallTimer::start("", name).failure(&McpError::UnknownTool {
                name: name.to_string(),
            }),
        }
    }

    async fn dispatch(
        &self,
        server: &str,
        tool: &str,
        arguments: serde_json::Value,
        cancel: Option<&CancellationToken>,
    ) -> ToolCallResult {
        let timer = CallTimer::start(server, tool);

        if !self.servers.contains_key(server) {
            return timer.failure(&McpError::UnknownServer {
                name: server.to_string(),
            });
        }
        if let Err(e) = self.registry().validate_tool_call(server, tool, &arguments) {
            return timer.failure(&e);
        }

        let mut session = self.sessions.session_for_call(server);
        let mut replayed = false;

        loop {
            let session_id = session.as_ref().map(CallSession::id);
            tracing::debug!(server, tool, has_session = session_id.is_some(), "dispatching tool call");

            let outcome = self
                .attempt_call(server, tool, &arguments, session_id, cancel)
                .await;

            let (login_url, message) = match outcome {
                Ok(RawResult::Success(value)) => return timer.success(value),
                Ok(RawResult::ToolError(message)) => return timer.tool_error(message),
                Ok(RawResult::AuthRequired { login_url, message }) => (login_url, message),
                Err(e) => return timer.failure(&e),
            };

            match self
                .sessions
                .on_auth_required(server, session.as_ref(), login_url.as_deref())
            {
                Ok(AuthRequiredAction::Login(pending)) => return timer.auth_required(&pending, message),
                Ok(AuthRequiredAction::RetryWith(live)) if !replayed => {
                    replayed = true;
                    session = Some(CallSession::Authenticated(live));
                }
                Ok(AuthRequiredAction::RetryWith(_)) => {
                    return timer.failure(&McpError::ProtocolError {
                        code: error_codes::INVALID_REQUEST,
                        message: "server rejected the current session".into(),
                        data: None,
                    })
                }
                Err(e) => return timer.failure(&e),
            }
        }
    }

    /// One `tools/call` with the transient retry, raced against `cancel`.
    async fn attempt_call(
        &self,
        server: &str,
        tool: &str,
        arguments: &serde_json::Value,
        session_id: Option<&str>,
        cancel: Option<&CancellationToken>,
    ) -> Result<RawResult, McpError> {
        let attempt = with_retry(
            server,
            "tools/call",
            self.settings.retry_backoff(),
            Idempotency::SideEffecting,
            || self.call_once(server, tool, arguments, session_id),
        );

        match cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => Err(McpError::Cancelled {
                    server: server.to_string(),
                    operation: "tools/call".into(),
                }),
                result = attempt => result,
            },
            None => attempt.await,
        }
    }

    async fn call_once(
        &self,
        server: &str,
        tool: &str,
        arguments: &serde_json::Value,
        session_id: Option<&str>,
    ) -> Result<RawResult, McpError> {
        let transport = self.connection(server).await?;
        let called = tokio::time::timeout(
            self.settings.call_timeout(),
            transport.call(tool, arguments, session_id),
        )
        .await
        .map_err(|_| self.timeout_error(server, "tools/call"))?;
        self.forget_if_broken(server, called).await
    }

    // ─── Connections ─────────────────────────────────────────────────────

    /// Cached handle for `server`, connecting on first use.
    ///
    /// A stdio handle whose process has exited is replaced.
    async fn connection(&self, server: &str) -> Result<Arc<dyn Transport>, McpError> {
        let config = self.server_config(server)?;
        let slot = self.slot(server)?;
        let mut slot = slot.lock().await;

        if let Some(existing) = slot.as_ref() {
            if existing.kind() == TransportKind::Http || existing.probe().await {
                return Ok(Arc::clone(existing));
            }
            tracing::warn!(server, "stdio server exited, reconnecting");
        }

        let transport: Arc<dyn Transport> = match config.kind() {
            TransportKind::Stdio => Arc::new(
                StdioTransport::connect(
                    config,
                    Arc::clone(&self.supervisor),
                    self.settings.call_timeout(),
                )
                .await?,
            ),
            TransportKind::Http => {
                let http = HttpTransport::connect(config, &self.settings)?;
                if !http.probe().await {
                    tracing::warn!(server, url = http.url(), "health probe failed, using endpoint anyway");
                }
                Arc::new(http)
            }
        };

        tracing::debug!(server = transport.server_name(), kind = ?transport.kind(), "connection ready");
        *slot = Some(Arc::clone(&transport));
        Ok(transport)
    }

    /// Drop the cached handle after a transient failure so the next call
    /// reconnects.
    async fn forget_if_broken<T>(
        &self,
        server: &str,
        result: Result<T, McpError>,
    ) -> Result<T, McpError> {
        if let Err(e) = &result {
            if e.is_transient() {
                if let Ok(slot) = self.slot(server) {
                    slot.lock().await.take();
                }
            }
        }
        result
    }

    fn server_config(&self, server: &str) -> Result<&ServerConfig, McpError> {
        self.servers.get(server).ok_or_else(|| McpError::UnknownServer {
            name: server.to_string(),
        })
    }

    fn slot(&self, server: &str) -> Result<&ConnectionSlot, McpError> {
        self.connections
            .get(server)
            .ok_or_else(|| McpError::UnknownServer {
                name: server.to_string(),
            })
    }

    fn timeout_error(&self, server: &str, operation: &str) -> McpError {
        McpError::Timeout {
            server: server.to_string(),
            operation: operation.to_string(),
            timeout_ms: self.settings.call_timeout().as_millis() as u64,
        }
    }

    // ─── Authentication ──────────────────────────────────────────────────

    /// Pending login for `server`; repeated calls return the same session.
    pub async fn generate_auth_session(
        &self,
        server: &str,
        owner: Option<&str>,
    ) -> Result<PendingAuth, McpError> {
        self.sessions.generate_auth_session(server, owner)
    }

    /// Auth callback from the web layer once the external login finished.
    ///
    /// Registers the session with HTTP servers that expect it before the
    /// session is promoted. Any mismatch leaves the pending entry untouched.
    pub async fn mark_session_authenticated(
        &self,
        server: &str,
        session_id: &str,
    ) -> AuthCallbackResult {
        let pending = match self.sessions.pending_matching(server, session_id) {
            Ok(pending) => pending,
            Err(reason) => {
                tracing::warn!(server, session_id, %reason, "auth callback rejected");
                return AuthCallbackResult::failed(reason);
            }
        };

        let registers = self.server_config(server).is_ok_and(|c| {
            matches!(
                c.transport,
                ServerTransport::Http {
                    register_session: true,
                    ..
                }
            )
        });
        if registers {
            let registered = match self.connection(server).await {
                Ok(transport) => {
                    transport
                        .register_session(session_id, pending.owner.as_deref())
                        .await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = registered {
                tracing::error!(server, session_id, error = %e, "failed to register session with server");
                return AuthCallbackResult::failed(format!(
                    "Failed to register session with server: {e}"
                ));
            }
        }

        match self.sessions.promote(server, session_id) {
            Ok(session) => AuthCallbackResult::ok(&session.session_id),
            Err(reason) => AuthCallbackResult::failed(reason),
        }
    }

    pub fn is_authenticated(&self, server: &str) -> bool {
        self.sessions.is_authenticated(server)
    }

    pub fn authentication_status(&self, server: &str) -> Result<AuthStatus, McpError> {
        self.sessions.authentication_status(server)
    }

    /// Forget any pending or authenticated session for `server` (logout).
    pub fn reset_session(&self, server: &str) {
        self.sessions.reset(server);
    }

    /// Evict expired sessions on every server. Call periodically.
    pub fn cleanup_expired_sessions(&self) -> usize {
        self.sessions.cleanup_expired_sessions()
    }

    // ─── Status and lifecycle ────────────────────────────────────────────

    /// Best-effort reachability of `server`.
    ///
    /// Stdio servers are not spawned by a probe; they report whether their
    /// process is currently running.
    pub async fn probe(&self, server: &str) -> bool {
        let Ok(config) = self.server_config(server) else {
            return false;
        };
        match config.kind() {
            TransportKind::Stdio => self.supervisor.is_alive(server).await,
            TransportKind::Http => {
                let transport = match self.connection(server).await {
                    Ok(transport) => transport,
                    Err(e) => {
                        tracing::debug!(server, error = %e, "probe could not connect");
                        return false;
                    }
                };
                tokio::time::timeout(self.settings.probe_timeout(), transport.probe())
                    .await
                    .unwrap_or(false)
            }
        }
    }

    /// Drop every connection and stop every supervised process.
    pub async fn shutdown(&self) {
        for slot in self.connections.values() {
            slot.lock().await.take();
        }
        self.supervisor.shutdown_all().await;
        tracing::info!("MCP client shut down");
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
