//! Tool shapes shared between the registry and provider adapters.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tool definition exposed to the LLM (Anthropic-style `input_schema`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's parameters.
    pub input_schema: Value,
}

/// A tool invocation extracted from an assistant response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub tool_name: String,
    pub input: Value,
}

/// Server-side tool type marker. Tools of this type run on the provider;
/// their presence alone never requires local tool_result injection.
pub const CODE_EXECUTION_TOOL_TYPE: &str = "code_execution_20250825";
pub const CODE_EXECUTION_TOOL_NAME: &str = "code_execution";

/// The meta-tool the model calls to load tools outside the current request.
/// The orchestrator keys auto-continuation on executions of this tool with
/// mode `load`, `fallback`, or `prepare_code_execution`.
pub const TOOL_LOADER_NAME: &str = "invokeother_tool";

/// Check whether a raw tool definition value describes a server-side tool.
pub fn is_server_side_tool(tool: &Value) -> bool {
    tool.get("type").and_then(|t| t.as_str()) == Some(CODE_EXECUTION_TOOL_TYPE)
}
