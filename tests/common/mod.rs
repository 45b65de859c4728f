//! Common test utilities.
//!
//! An in-process mock of the Fi MCP HTTP server and helpers to point a client
//! at it.

pub mod mock_server;

use fi_mcp_client::mcp_client::{ClientSettings, McpServersConfig, ServerConfig, ServerTransport};

/// HTTP server entry for `url`.
pub fn http_server(name: &str, url: &str, login_base: Option<&str>) -> ServerConfig {
    ServerConfig {
        name: name.into(),
        transport: ServerTransport::Http {
            url: url.into(),
            login_base: login_base.map(str::to_string),
            register_session: true,
        },
    }
}

/// Registry with fast retries.
pub fn config(servers: Vec<ServerConfig>) -> McpServersConfig {
    McpServersConfig {
        servers: servers.into_iter().map(|s| (s.name.clone(), s)).collect(),
        settings: ClientSettings {
            retry_backoff_ms: 10,
            ..ClientSettings::default()
        },
    }
}
