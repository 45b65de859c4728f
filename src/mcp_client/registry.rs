//! Tool registry: aggregates tool descriptors across all MCP servers.
//!
//! Tools are exposed as `{server_name}_{tool_name}`. Since both halves may
//! contain underscores, a prefixed name is split by matching the longest
//! configured server name, never by splitting on the first `_`.

use std::collections::BTreeMap;

use super::errors::McpError;
use super::types::{FunctionDeclaration, ToolDescriptor};

// ─── ServerNameIndex ─────────────────────────────────────────────────────────

/// Configured server names, longest first.
#[derive(Debug, Clone, Default)]
pub struct ServerNameIndex {
    names: Vec<String>,
}

impl ServerNameIndex {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut names: Vec<String> = names.into_iter().map(Into::into).collect();
        names.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        names.dedup();
        Self { names }
    }

    /// Split `prefixed` into `(server, tool)`.
    ///
    /// `None` when no configured server name followed by `_` prefixes it, or
    /// the tool part would be empty.
    pub fn resolve<'a>(&self, prefixed: &'a str) -> Option<(&str, &'a str)> {
        self.names.iter().find_map(|server| {
            let tool = prefixed.strip_prefix(server.as_str())?.strip_prefix('_')?;
            (!tool.is_empty()).then_some((server.as_str(), tool))
        })
    }
}

// ─── ToolRegistry ────────────────────────────────────────────────────────────

/// Snapshot of the last discovery pass.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    /// `exposed_name → descriptor`.
    tools: BTreeMap<String, ToolDescriptor>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register tools discovered on one server.
    pub fn register_server_tools(&mut self, server_name: &str, tools: Vec<ToolDescriptor>) {
        for tool in tools {
            let exposed = tool.exposed_name();
            if let Some(previous) = self.tools.insert(exposed.clone(), tool) {
                tracing::warn!(
                    server = server_name,
                    tool = %exposed,
                    shadowed_server = %previous.server_name,
                    "duplicate prefixed tool name, keeping the later one"
                );
            }
        }
    }

    /// Look up a tool by its exposed name.
    pub fn get_tool(&self, exposed_name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(exposed_name)
    }

    /// Exposed names can collide across servers whose names share a prefix,
    /// so the owning server is checked too.
    pub fn get_server_tool(&self, server: &str, tool: &str) -> Option<&ToolDescriptor> {
        self.tools
            .get(&format!("{server}_{tool}"))
            .filter(|descriptor| descriptor.server_name == server)
    }

    /// All descriptors, ordered by exposed name.
    pub fn tools(&self) -> Vec<&ToolDescriptor> {
        self.tools.values().collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn tools_for_server(&self, server_name: &str) -> usize {
        self.tools
            .values()
            .filter(|t| t.server_name == server_name)
            .count()
    }

    /// Check arguments against the tool's schema.
    ///
    /// Arguments must be a JSON object. Required top-level fields are only
    /// enforced for tools in this snapshot; unknown tools are left to the
    /// server.
    pub fn validate_tool_call(
        &self,
        server: &str,
        tool: &str,
        arguments: &serde_json::Value,
    ) -> Result<(), McpError> {
        let Some(args_obj) = arguments.as_object() else {
            return Err(McpError::InvalidArguments {
                tool: format!("{server}_{tool}"),
                reason: "arguments must be a JSON object".into(),
            });
        };

        let Some(def) = self.get_server_tool(server, tool) else {
            return Ok(());
        };

        if let Some(required) = def.input_schema.get("required").and_then(|r| r.as_array()) {
            for field_name in required.iter().filter_map(|f| f.as_str()) {
                if !args_obj.contains_key(field_name) {
                    return Err(McpError::InvalidArguments {
                        tool: def.exposed_name(),
                        reason: format!("missing required field: '{field_name}'"),
                    });
                }
            }
        }

        Ok(())
    }

    /// Flat `[{name, description, parameters}]` list for the LLM.
    pub fn function_declarations(&self) -> Vec<FunctionDeclaration> {
        self.tools.values().map(FunctionDeclaration::from).collect()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
