//! Root of the `conduit-core` library.

// Prevent accidental direct writes to stdout/stderr in library code: on the
// stdio transport, stdout *is* the wire. Everything else goes through the
// tracing stack.
#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod auth;
pub mod config;
pub mod context;
pub mod error;
pub mod gate;
pub mod gateway;
pub mod network_policy;
pub mod pipeline;
pub mod policy;
pub mod reverse_ipc;
pub mod sandbox;
pub mod schema_cache;
pub mod sdk;
pub mod session_store;
pub mod supervisor;
pub mod upstream;

pub use context::ExecutionContext;
pub use context::Principal;
pub use error::ConduitErr;
pub use error::Result;
pub use gateway::Gateway;
pub use pipeline::PeerInfo;
pub use pipeline::RequestPipeline;
pub use reverse_ipc::ReverseIpcEndpoint;
pub use session_store::SessionStore;
pub use supervisor::ExecutionKind;
pub use supervisor::ExecutionSupervisor;
