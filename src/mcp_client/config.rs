//! Server registry loading and validation.
//!
//! Reads `mcp_config.json` (or a YAML equivalent) once at startup and resolves
//! environment variables. The result is immutable for the lifetime of the
//! client.
//!
//! ```json
//! {
//!   "mcpServers": {
//!     "fi_mcp": { "url": "https://mcp.fi.money:8080/mcp/stream" },
//!     "local_tools": { "command": "python3", "args": ["-m", "tools.server"] }
//!   },
//!   "settings": { "session_ttl_secs": 3600 }
//! }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use super::errors::McpError;

/// File name searched for when no explicit path is given.
pub const DEFAULT_CONFIG_FILE: &str = "mcp_config.json";

/// Environment variable that points at the config file.
pub const CONFIG_PATH_ENV: &str = "FI_MCP_CONFIG";

// ─── Public Types ────────────────────────────────────────────────────────────

/// Which transport a server is reached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stdio,
    Http,
}

/// Transport-specific connection details.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerTransport {
    /// Local subprocess spoken to over stdin/stdout.
    Stdio {
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
        cwd: Option<String>,
    },
    /// Remote endpoint taking one JSON-RPC POST per call.
    Http {
        url: String,
        /// Overrides the origin of the human-facing login page.
        login_base: Option<String>,
        /// POST the session to `<base>/login` when the auth callback fires.
        register_session: bool,
    },
}

/// One entry of the server registry.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub name: String,
    pub transport: ServerTransport,
}

impl ServerConfig {
    pub fn kind(&self) -> TransportKind {
        match self.transport {
            ServerTransport::Stdio { .. } => TransportKind::Stdio,
            ServerTransport::Http { .. } => TransportKind::Http,
        }
    }

    /// The endpoint URL, for HTTP servers.
    pub fn url(&self) -> Option<&str> {
        match &self.transport {
            ServerTransport::Http { url, .. } => Some(url),
            ServerTransport::Stdio { .. } => None,
        }
    }
}

/// Tunables shared by every server. All optional in the file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClientSettings {
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// How long a freshly spawned process must survive before it counts as started.
    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

fn default_session_ttl_secs() -> u64 {
    3600
}
fn default_call_timeout_secs() -> u64 {
    30
}
fn default_probe_timeout_secs() -> u64 {
    5
}
fn default_retry_backoff_ms() -> u64 {
    500
}
fn default_startup_grace_ms() -> u64 {
    500
}
fn default_shutdown_timeout_secs() -> u64 {
    5
}
fn default_true() -> bool {
    true
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            session_ttl_secs: default_session_ttl_secs(),
            call_timeout_secs: default_call_timeout_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            retry_backoff_ms: default_retry_backoff_ms(),
            startup_grace_ms: default_startup_grace_ms(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl ClientSettings {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// The loaded server registry.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct McpServersConfig {
    pub servers: BTreeMap<String, ServerConfig>,
    pub settings: ClientSettings,
}

impl McpServersConfig {
    /// Configured server names, sorted.
    pub fn server_names(&self) -> Vec<String> {
        self.servers.keys().cloned().collect()
    }
}

/// On-disk encoding of the registry file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
}

impl ConfigFormat {
    /// `.yaml`/`.yml` → YAML, anything else → JSON.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => ConfigFormat::Yaml,
            _ => ConfigFormat::Json,
        }
    }
}

// ─── Raw File Shape ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawConfigFile {
    #[serde(rename = "mcpServers", alias = "mcp_servers", default)]
    servers: Option<BTreeMap<String, RawServerEntry>>,
    #[serde(default)]
    settings: ClientSettings,
}

#[derive(Debug, Deserialize)]
struct RawServerEntry {
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    login_base: Option<String>,
    #[serde(default = "default_true")]
    register_session: bool,
}

impl RawServerEntry {
    fn into_server_config(self, name: &str) -> Result<ServerConfig, McpError> {
        let transport = match (self.command, self.url) {
            (Some(command), None) => {
                if command.trim().is_empty() {
                    return Err(McpError::config(format!(
                        "server '{name}' has an empty command"
                    )));
                }
                ServerTransport::Stdio {
                    command: expand_tilde(&command),
                    args: self.args,
                    env: self.env,
                    cwd: self.cwd.as_deref().map(expand_tilde),
                }
            }
            (None, Some(url)) => {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(McpError::config(format!(
                        "server '{name}' url must be http(s): '{url}'"
                    )));
                }
                ServerTransport::Http {
                    url,
                    login_base: self.login_base,
                    register_session: self.register_session,
                }
            }
            (Some(_), Some(_)) => {
                return Err(McpError::config(format!(
                    "server '{name}' must have either 'command' or 'url', not both"
                )))
            }
            (None, None) => {
                return Err(McpError::config(format!(
                    "server '{name}' must have either 'command' or 'url'"
                )))
            }
        };

        Ok(ServerConfig {
            name: name.to_string(),
            transport,
        })
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the registry file.
///
/// `FI_MCP_CONFIG` wins when set; otherwise walks upward from `start` looking
/// for `mcp_config.json`.
pub fn find_config_path(start: &Path) -> Result<PathBuf, McpError> {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        let candidate = PathBuf::from(expand_tilde(&path));
        if candidate.exists() {
            return Ok(candidate);
        }
        return Err(McpError::config(format!(
            "{CONFIG_PATH_ENV} points at missing file {}",
            candidate.display()
        )));
    }

    search_upward(start).ok_or_else(|| {
        McpError::config(format!(
            "could not find {DEFAULT_CONFIG_FILE} above {}",
            start.display()
        ))
    })
}

fn search_upward(start: &Path) -> Option<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(DEFAULT_CONFIG_FILE);
        if candidate.exists() {
            return Some(candidate);
        }
        if !dir.pop() {
            return None;
        }
    }
}

/// Load and validate the registry file. A missing file is a `ConfigError`.
pub fn load_config(path: &Path) -> Result<McpServersConfig, McpError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| McpError::config(format!("failed to read {}: {e}", path.display())))?;

    let config = parse_config(&raw, ConfigFormat::from_path(path))?;

    tracing::info!(
        path = %path.display(),
        servers = ?config.servers.keys().collect::<Vec<_>>(),
        "loaded MCP server registry"
    );

    Ok(config)
}

/// Parse registry text after `${VAR}` interpolation.
pub fn parse_config(raw: &str, format: ConfigFormat) -> Result<McpServersConfig, McpError> {
    let interpolated = interpolate_env_vars(raw);

    let file: RawConfigFile = match format {
        ConfigFormat::Json => serde_json::from_str(&interpolated)
            .map_err(|e| McpError::config(format!("failed to parse config: {e}")))?,
        ConfigFormat::Yaml => serde_yaml::from_str(&interpolated)
            .map_err(|e| McpError::config(format!("failed to parse config: {e}")))?,
    };

    let entries = file.servers.unwrap_or_else(|| {
        tracing::warn!("config has no 'mcpServers' section; no servers configured");
        BTreeMap::new()
    });

    let mut servers = BTreeMap::new();
    for (name, entry) in entries {
        if name.trim().is_empty() {
            return Err(McpError::config("server names must not be empty"));
        }
        let server = entry.into_server_config(&name)?;
        servers.insert(name, server);
    }

    Ok(McpServersConfig {
        servers,
        settings: file.settings,
    })
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

fn resolve_var_expr(expr: &str) -> String {
    if let Some(idx) = expr.find(":-") {
        let var_name = &expr[..idx];
        let default = &expr[idx + 2..];
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    } else {
        std::env::var(expr).unwrap_or_default()
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "mcpServers": {
            "fi_mcp": { "url": "https://mcp.fi.money:8080/mcp/stream" },
            "local_tools": {
                "command": "python3",
                "args": ["-m", "tools.server"],
                "env": { "LOG_LEVEL": "debug" }
            }
        }
    }"#;

    #[test]
    fn test_parse_both_transport_kinds() {
        let config = parse_config(SAMPLE, ConfigFormat::Json).unwrap();
        assert_eq!(config.server_names(), vec!["fi_mcp", "local_tools"]);

        let fi = &config.servers["fi_mcp"];
        assert_eq!(fi.kind(), TransportKind::Http);
        assert_eq!(fi.url(), Some("https://mcp.fi.money:8080/mcp/stream"));
        match &fi.transport {
            ServerTransport::Http {
                register_session, ..
            } => assert!(*register_session),
            other => panic!("expected http transport, got {other:?}"),
        }

        let local = &config.servers["local_tools"];
        assert_eq!(local.kind(), TransportKind::Stdio);
        match &local.transport {
            ServerTransport::Stdio { command, args, env, .. } => {
                assert_eq!(command, "python3");
                assert_eq!(args, &vec!["-m".to_string(), "tools.server".to_string()]);
                assert_eq!(env["LOG_LEVEL"], "debug");
            }
            other => panic!("expected stdio transport, got {other:?}"),
        }
    }

    #[test]
    fn test_settings_default_when_absent() {
        let config = parse_config(SAMPLE, ConfigFormat::Json).unwrap();
        assert_eq!(config.settings, ClientSettings::default());
        assert_eq!(config.settings.session_ttl(), Duration::from_secs(3600));
        assert_eq!(config.settings.probe_timeout(), Duration::from_secs(5));
        assert_eq!(config.settings.call_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_partial_settings_keep_other_defaults() {
        let raw = r#"{"mcpServers": {}, "settings": {"session_ttl_secs": 60}}"#;
        let config = parse_config(raw, ConfigFormat::Json).unwrap();
        assert_eq!(config.settings.session_ttl_secs, 60);
        assert_eq!(config.settings.retry_backoff_ms, 500);
    }

    #[test]
    fn test_entry_with_both_command_and_url_rejected() {
        let raw = r#"{"mcpServers": {"bad": {"command": "x", "url": "http://h/mcp/stream"}}}"#;
        let err = parse_config(raw, ConfigFormat::Json).unwrap_err();
        assert!(matches!(err, McpError::ConfigError { .. }));
        assert!(err.to_string().contains("not both"));
    }

    #[test]
    fn test_entry_with_neither_rejected() {
        let raw = r#"{"mcpServers": {"bad": {"args": []}}}"#;
        let err = parse_config(raw, ConfigFormat::Json).unwrap_err();
        assert!(err.to_string().contains("either 'command' or 'url'"));
    }

    #[test]
    fn test_non_http_url_rejected() {
        let raw = r#"{"mcpServers": {"bad": {"url": "ftp://example.com"}}}"#;
        assert!(parse_config(raw, ConfigFormat::Json).is_err());
    }

    #[test]
    fn test_malformed_json_is_config_error() {
        let err = parse_config("{ not json", ConfigFormat::Json).unwrap_err();
        assert!(matches!(err, McpError::ConfigError { .. }));
    }

    #[test]
    fn test_missing_servers_section_is_empty() {
        let config = parse_config("{}", ConfigFormat::Json).unwrap();
        assert!(config.servers.is_empty());
    }

    #[test]
    fn test_yaml_config() {
        let yaml = r#"
            mcpServers:
              fi_mcp:
                url: "http://localhost:8080/mcp/stream"
                login_base: "http://localhost:8080"
                register_session: false
        "#;
        let config = parse_config(yaml, ConfigFormat::Yaml).unwrap();
        match &config.servers["fi_mcp"].transport {
            ServerTransport::Http {
                login_base,
                register_session,
                ..
            } => {
                assert_eq!(login_base.as_deref(), Some("http://localhost:8080"));
                assert!(!register_session);
            }
            other => panic!("expected http transport, got {other:?}"),
        }
    }

    #[test]
    fn test_load_missing_file_is_config_error() {
        let err = load_config(Path::new("/nonexistent/mcp_config.json")).unwrap_err();
        assert!(matches!(err, McpError::ConfigError { .. }));
    }

    #[test]
    fn test_load_from_disk() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(&path, SAMPLE).unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.servers.len(), 2);
    }

    #[test]
    fn test_search_upward_finds_parent_config() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join(DEFAULT_CONFIG_FILE), SAMPLE).unwrap();
        let nested = tmp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let found = search_upward(&nested).unwrap();
        assert_eq!(found, tmp.path().join(DEFAULT_CONFIG_FILE));
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(ConfigFormat::from_path(Path::new("a.yaml")), ConfigFormat::Yaml);
        assert_eq!(ConfigFormat::from_path(Path::new("a.yml")), ConfigFormat::Yaml);
        assert_eq!(ConfigFormat::from_path(Path::new("a.json")), ConfigFormat::Json);
    }

    #[test]
    fn test_interpolate_env_vars_with_default() {
        std::env::remove_var("__FI_MCP_TEST_MISSING__");
        let input = "${__FI_MCP_TEST_MISSING__:-http://localhost:8080/mcp/stream}";
        assert_eq!(interpolate_env_vars(input), "http://localhost:8080/mcp/stream");
    }

    #[test]
    fn test_interpolate_env_vars_with_value() {
        std::env::set_var("__FI_MCP_TEST_URL__", "https://mcp.fi.money/mcp/stream");
        let raw = r#"{"mcpServers": {"fi_mcp": {"url": "${__FI_MCP_TEST_URL__:-http://x}"}}}"#;
        let config = parse_config(raw, ConfigFormat::Json).unwrap();
        assert_eq!(
            config.servers["fi_mcp"].url(),
            Some("https://mcp.fi.money/mcp/stream")
        );
        std::env::remove_var("__FI_MCP_TEST_URL__");
    }

    #[test]
    fn test_interpolate_no_vars() {
        let input = "plain text with no variables";
        assert_eq!(interpolate_env_vars(input), input);
    }

    #[test]
    fn test_expand_tilde() {
        let result = expand_tilde("~/servers/fi");
        assert!(!result.starts_with('~'));
        assert!(result.ends_with("/servers/fi"));
    }
}
