use serde::Deserialize;
use serde::Serialize;

/// Minimal tool description exchanged during discovery: a qualified name, an
/// optional one-line description and, when the upstream provided one, the
/// JSON Schema fragment for its input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolStub {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(
        rename = "inputSchema",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub input_schema: Option<serde_json::Value>,
}

/// Upstream-served tool listing, a cheaper alternative to a full RPC
/// discovery round-trip.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolManifest {
    #[serde(default)]
    pub tools: Vec<ToolStub>,
}
