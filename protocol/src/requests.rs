use serde::Deserialize;
use serde::Serialize;

use crate::limits::ResourceLimitsOverride;
use crate::tools::ToolStub;

/// Method names accepted on the agent-facing channel. The sandbox-facing
/// channel admits only the discovery/call subset; the pipeline enforces
/// that at authentication time.
pub mod methods {
    pub const DISCOVER_TOOLS: &str = "mcp.discoverTools";
    pub const CALL_TOOL: &str = "mcp.callTool";
    pub const EXECUTE_TYPESCRIPT: &str = "mcp.executeTypeScript";
    pub const EXECUTE_PYTHON: &str = "mcp.executePython";
    pub const EXECUTE_ISOLATE: &str = "mcp.executeIsolate";

    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const PING: &str = "ping";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteParams {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceLimitsOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallToolParams {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoverToolsResult {
    pub tools: Vec<ToolStub>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    pub server_info: ServerInfo,
    pub capabilities: serde_json::Value,
}
