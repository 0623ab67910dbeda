//! Connectors to federated tool providers.
//!
//! One connector instance per configured upstream. The transport is a tagged
//! variant with a narrow operation set: `call` (one JSON-RPC request, one
//! matched response) and `get_manifest` (HTTP-backed upstreams only).
//! Connectors never retry; failures surface as error envelopes and the
//! gateway decides what to do with them.

mod http_rpc;
mod http_streaming;
mod subprocess;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use conduit_protocol::ErrorObject;
use conduit_protocol::JsonRpcResponse;
use conduit_protocol::ToolManifest;
use conduit_protocol::ToolStub;
use conduit_protocol::error_code;

use crate::auth::AuthBroker;
use crate::config::UpstreamConfig;
use crate::config::UpstreamCredential;
use crate::config::UpstreamTransportConfig;
use crate::config::split_command;
use crate::context::ExecutionContext;
use crate::error::ConduitErr;
use crate::error::Result;
use crate::network_policy::NetworkPolicy;

pub(crate) use http_rpc::HttpRpcTransport;
pub(crate) use http_streaming::StreamingTransport;
pub(crate) use subprocess::SubprocessTransport;

/// Fixed upstream call timeout.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(10);
/// Shorter budget for the manifest probe.
pub const MANIFEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Correlation-id header attached to HTTP-backed upstream requests.
pub const CORRELATION_HEADER: &str = "x-conduit-correlation-id";

/// Well-known manifest location relative to the upstream base URL.
pub const MANIFEST_SUFFIX: &str = ".well-known/conduit/manifest.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamStatus {
    Active,
    Degraded,
    Error,
}

enum Transport {
    Subprocess(SubprocessTransport),
    HttpRpc(HttpRpcTransport),
    HttpStreaming(StreamingTransport),
}

pub struct UpstreamConnector {
    id: String,
    credential: Option<UpstreamCredential>,
    auth: Arc<AuthBroker>,
    transport: Transport,
}

impl UpstreamConnector {
    pub fn from_config(
        config: UpstreamConfig,
        auth: Arc<AuthBroker>,
        network: Arc<NetworkPolicy>,
    ) -> anyhow::Result<Self> {
        let transport = match config.transport {
            UpstreamTransportConfig::Subprocess { command, env } => {
                let argv = split_command(&command)?;
                Transport::Subprocess(SubprocessTransport::new(argv, env))
            }
            UpstreamTransportConfig::HttpRpc { url } => {
                Transport::HttpRpc(HttpRpcTransport::new(url, network)?)
            }
            UpstreamTransportConfig::HttpStreaming { url } => {
                Transport::HttpStreaming(StreamingTransport::new(url, network)?)
            }
        };
        Ok(Self {
            id: config.id,
            credential: config.credential,
            auth,
            transport,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// One JSON-RPC request/response round-trip with the fixed call timeout.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        context: &ExecutionContext,
    ) -> Result<Value> {
        let headers = self.auth_headers().await?;
        match &self.transport {
            Transport::Subprocess(transport) => {
                transport.call(method, params, CALL_TIMEOUT).await
            }
            Transport::HttpRpc(transport) => {
                transport
                    .call(method, params, &headers, context, CALL_TIMEOUT)
                    .await
            }
            Transport::HttpStreaming(transport) => {
                transport
                    .call(method, params, &headers, context, CALL_TIMEOUT)
                    .await
            }
        }
    }

    /// `tools/list` convenience; stubs come back with upstream-local names.
    pub async fn list_tools(&self, context: &ExecutionContext) -> Result<Vec<ToolStub>> {
        let result = self.call("tools/list", None, context).await?;
        let tools = result
            .get("tools")
            .cloned()
            .ok_or_else(|| ConduitErr::Transport("tools/list result had no tools".to_string()))?;
        Ok(serde_json::from_value(tools)?)
    }

    /// Probe the well-known manifest document. Absence (or any probe
    /// failure) is non-fatal and reported as `None`.
    pub async fn get_manifest(&self, _context: &ExecutionContext) -> Option<ToolManifest> {
        let headers = match self.auth_headers().await {
            Ok(headers) => headers,
            Err(_) => return None,
        };
        match &self.transport {
            Transport::Subprocess(_) => None,
            Transport::HttpRpc(transport) => {
                transport.get_manifest(&headers, MANIFEST_TIMEOUT).await
            }
            Transport::HttpStreaming(transport) => {
                transport.get_manifest(&headers, MANIFEST_TIMEOUT).await
            }
        }
    }

    pub async fn shutdown(&self) {
        if let Transport::Subprocess(transport) = &self.transport {
            transport.shutdown().await;
        }
    }

    async fn auth_headers(&self) -> Result<Vec<(String, String)>> {
        match &self.credential {
            Some(credential) => self.auth.headers(credential).await,
            None => Ok(Vec::new()),
        }
    }
}

/// Convert an upstream response envelope into a result, translating the
/// upstream's error codes into our taxonomy where they line up.
pub(crate) fn response_into_result(response: JsonRpcResponse) -> Result<Value> {
    if let Some(ErrorObject { code, message, .. }) = response.error {
        return Err(match code {
            error_code::REQUEST_TIMEOUT => ConduitErr::UpstreamTimeout(message),
            error_code::INVALID_PARAMS => ConduitErr::InvalidParams(message),
            error_code::METHOD_NOT_FOUND => ConduitErr::MethodNotFound(message),
            error_code::FORBIDDEN => ConduitErr::Forbidden(message),
            _ => ConduitErr::Transport(format!("upstream error {code}: {message}")),
        });
    }
    response
        .result
        .ok_or_else(|| ConduitErr::Transport("upstream response had no result".to_string()))
}

/// `<base>/<MANIFEST_SUFFIX>` with exactly one slash in between.
pub(crate) fn manifest_url(base: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), MANIFEST_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_protocol::RequestId;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn error_envelopes_map_onto_the_taxonomy() {
        let response = JsonRpcResponse::err(
            Some(RequestId::Integer(1)),
            ErrorObject::new(error_code::REQUEST_TIMEOUT, "slow"),
        );
        let err = response_into_result(response).expect_err("must fail");
        assert!(err.is_upstream_timeout());

        let response = JsonRpcResponse::err(
            Some(RequestId::Integer(2)),
            ErrorObject::new(-1, "odd code"),
        );
        let err = response_into_result(response).expect_err("must fail");
        assert_eq!(err.code(), error_code::INTERNAL_ERROR);
    }

    #[test]
    fn result_envelopes_pass_through() {
        let response = JsonRpcResponse::ok(Some(RequestId::Integer(1)), json!({"ok": true}));
        let value = response_into_result(response).expect("result");
        assert_eq!(value, json!({"ok": true}));
    }

    #[test]
    fn manifest_url_is_slash_safe() {
        assert_eq!(
            manifest_url("https://x.example/mcp/"),
            "https://x.example/mcp/.well-known/conduit/manifest.json"
        );
        assert_eq!(
            manifest_url("https://x.example"),
            "https://x.example/.well-known/conduit/manifest.json"
        );
    }
}
