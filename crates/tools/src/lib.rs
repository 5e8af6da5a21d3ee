//! Tool registry: holds tool definitions and dispatches invocations.
//!
//! Tools self-register into a name-keyed registry. The registry exposes the
//! currently enabled schemas to the provider and executes invocations
//! synchronously from the caller's perspective (each tool's `invoke` is an
//! async fn awaited by the provider's worker pool).

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use mira_domain::message::UserContext;
use mira_domain::tool::{ToolDefinition, TOOL_LOADER_NAME};
use mira_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A callable tool. Implementations receive the caller's [`UserContext`]
/// explicitly — ambient identity never crosses a worker boundary implicitly.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn definition(&self) -> ToolDefinition;

    /// Optional usage hint surfaced by the tool-guidance trinket.
    fn hint(&self) -> Option<String> {
        None
    }

    async fn invoke(&self, input: Value, ctx: &UserContext) -> Result<Value>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Name-keyed tool registry with an enabled set.
///
/// Disabled tools stay registered (so the loader can enable them on demand)
/// but are absent from the schemas sent to the model.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
    enabled: RwLock<HashSet<String>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            enabled: RwLock::new(HashSet::new()),
        }
    }

    /// Create a registry pre-populated with the tool-loader meta-tool.
    pub fn with_loader() -> Arc<Self> {
        let registry = Arc::new(Self::new());
        let loader = ToolLoader { registry: Arc::downgrade(&registry) };
        registry.register(Arc::new(loader), true);
        registry
    }

    pub fn register(&self, tool: Arc<dyn Tool>, enabled: bool) {
        let name = tool.name().to_string();
        if enabled {
            self.enabled.write().insert(name.clone());
        }
        tracing::debug!(tool = %name, enabled, "registered tool");
        self.tools.write().insert(name, tool);
    }

    pub fn enable(&self, name: &str) -> bool {
        if self.tools.read().contains_key(name) {
            self.enabled.write().insert(name.to_string());
            true
        } else {
            false
        }
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.enabled.read().contains(name)
    }

    /// Registered tool names matching a substring query (loader lookup).
    pub fn find(&self, query: &str) -> Vec<String> {
        let q = query.to_lowercase();
        let mut names: Vec<String> = self
            .tools
            .read()
            .keys()
            .filter(|n| n.to_lowercase().contains(&q))
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Schemas of currently enabled tools, as raw values so callers can
    /// append server-side tool entries.
    pub fn definitions(&self) -> Vec<Value> {
        let tools = self.tools.read();
        let enabled = self.enabled.read();
        let mut defs: Vec<(String, Value)> = tools
            .iter()
            .filter(|(name, _)| enabled.contains(*name))
            .map(|(name, tool)| {
                (name.clone(), serde_json::to_value(tool.definition()).unwrap_or(Value::Null))
            })
            .collect();
        defs.sort_by(|a, b| a.0.cmp(&b.0));
        defs.into_iter().map(|(_, v)| v).collect()
    }

    pub fn get_tool_definition(&self, name: &str) -> Option<ToolDefinition> {
        self.tools.read().get(name).map(|t| t.definition())
    }

    /// Usage hints from enabled tools, keyed by tool name.
    pub fn hints(&self) -> HashMap<String, String> {
        let tools = self.tools.read();
        let enabled = self.enabled.read();
        tools
            .iter()
            .filter(|(name, _)| enabled.contains(*name))
            .filter_map(|(name, tool)| tool.hint().map(|h| (name.clone(), h)))
            .collect()
    }

    /// Execute a tool and return its result.
    pub async fn invoke_tool(&self, name: &str, input: Value, ctx: &UserContext) -> Result<Value> {
        let tool = self
            .tools
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Tool {
                tool: name.to_string(),
                message: "unknown tool".into(),
            })?;
        tool.invoke(input, ctx).await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool loader meta-tool
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Enables tools that are registered but not currently in the request.
/// The orchestrator auto-continues the turn after this tool runs with
/// mode `load`, `fallback`, or `prepare_code_execution`.
struct ToolLoader {
    registry: Weak<ToolRegistry>,
}

#[async_trait]
impl Tool for ToolLoader {
    fn name(&self) -> &str {
        TOOL_LOADER_NAME
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: TOOL_LOADER_NAME.into(),
            description: "Load a tool that is not currently available, then continue the task."
                .into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "mode": {
                        "type": "string",
                        "enum": ["load", "fallback", "prepare_code_execution"],
                        "description": "What kind of loading to perform."
                    },
                    "query": {
                        "type": "string",
                        "description": "Name or description of the tool needed."
                    }
                },
                "required": ["mode", "query"]
            }),
        }
    }

    async fn invoke(&self, input: Value, _ctx: &UserContext) -> Result<Value> {
        let mode = input
            .get("mode")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Validation("missing required parameter: mode".into()))?;
        let query = input
            .get("query")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Validation("missing required parameter: query".into()))?;

        let registry = self.registry.upgrade().ok_or_else(|| Error::Tool {
            tool: TOOL_LOADER_NAME.into(),
            message: "registry gone".into(),
        })?;

        let matches = registry.find(query);
        let loaded: Vec<&String> = matches
            .iter()
            .filter(|name| registry.enable(name))
            .collect();

        tracing::info!(mode, query, loaded = loaded.len(), "tool loader invoked");

        Ok(serde_json::json!({
            "status": if loaded.is_empty() { "no_match" } else { "loaded" },
            "mode": mode,
            "query": query,
            "loaded": loaded,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo_tool"
        }

        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "echo_tool".into(),
                description: "Echoes its input.".into(),
                input_schema: serde_json::json!({
                    "type": "object",
                    "properties": {"message": {"type": "string"}},
                    "required": ["message"]
                }),
            }
        }

        fn hint(&self) -> Option<String> {
            Some("Use for testing round-trips.".into())
        }

        async fn invoke(&self, input: Value, _ctx: &UserContext) -> Result<Value> {
            let msg = input
                .get("message")
                .and_then(|v| v.as_str())
                .ok_or_else(|| Error::Validation("missing required parameter: message".into()))?;
            Ok(serde_json::json!({"result": msg}))
        }
    }

    #[tokio::test]
    async fn invoke_registered_tool() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool), true);
        let out = registry
            .invoke_tool(
                "echo_tool",
                serde_json::json!({"message": "42"}),
                &UserContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(out["result"], "42");
    }

    #[tokio::test]
    async fn unknown_tool_is_error() {
        let registry = ToolRegistry::new();
        let err = registry
            .invoke_tool("nope", Value::Null, &UserContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Tool { .. }));
    }

    #[test]
    fn disabled_tools_hidden_from_definitions() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool), false);
        assert!(registry.definitions().is_empty());
        assert!(registry.enable("echo_tool"));
        assert_eq!(registry.definitions().len(), 1);
    }

    #[test]
    fn hints_from_enabled_tools() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool), true);
        let hints = registry.hints();
        assert_eq!(hints.len(), 1);
        assert!(hints["echo_tool"].contains("round-trips"));
    }

    #[tokio::test]
    async fn loader_enables_matching_tool() {
        let registry = ToolRegistry::with_loader();
        registry.register(Arc::new(EchoTool), false);
        assert!(!registry.is_enabled("echo_tool"));

        let out = registry
            .invoke_tool(
                TOOL_LOADER_NAME,
                serde_json::json!({"mode": "load", "query": "echo"}),
                &UserContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(out["status"], "loaded");
        assert!(registry.is_enabled("echo_tool"));
    }

    #[tokio::test]
    async fn loader_missing_mode_is_validation_error() {
        let registry = ToolRegistry::with_loader();
        let err = registry
            .invoke_tool(
                TOOL_LOADER_NAME,
                serde_json::json!({"query": "x"}),
                &UserContext::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
