//! Wire-level types for the Conduit RPC surface.
//!
//! Everything in this crate is plain data: the JSON-RPC 2.0 envelope used on
//! both the agent-facing channel and the sandbox reverse-IPC channel, the
//! stable error codes, resource limits, and the tool-stub shapes exchanged
//! during discovery. No I/O happens here.

pub mod error_code;
mod jsonrpc;
mod limits;
mod requests;
mod tools;

pub use jsonrpc::AuthPayload;
pub use jsonrpc::ErrorObject;
pub use jsonrpc::JSONRPC_VERSION;
pub use jsonrpc::JsonRpcRequest;
pub use jsonrpc::JsonRpcResponse;
pub use jsonrpc::RequestId;
pub use limits::ResourceLimits;
pub use limits::ResourceLimitsOverride;
pub use requests::CallToolParams;
pub use requests::DiscoverToolsResult;
pub use requests::ExecuteParams;
pub use requests::ExecuteResult;
pub use requests::InitializeResult;
pub use requests::ServerInfo;
pub use requests::methods;
pub use tools::ToolManifest;
pub use tools::ToolStub;
