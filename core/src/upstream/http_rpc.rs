//! HTTP-RPC upstream: one POST of the JSON-RPC envelope per call.
//!
//! Every call revalidates the configured URL against the network policy.
//! When a resolved address comes back, the request is dispatched to that
//! address with the original hostname echoed in the `Host` header so that a
//! later DNS answer cannot redirect the connection. Redirects are disabled.

use std::sync::Arc;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use reqwest::header::HOST;
use reqwest::redirect::Policy;
use serde_json::Value;
use url::Url;

use conduit_protocol::JsonRpcRequest;
use conduit_protocol::JsonRpcResponse;
use conduit_protocol::RequestId;
use conduit_protocol::ToolManifest;

use crate::context::ExecutionContext;
use crate::error::ConduitErr;
use crate::error::Result;
use crate::network_policy::NetworkPolicy;
use crate::upstream::CORRELATION_HEADER;
use crate::upstream::manifest_url;
use crate::upstream::response_into_result;

pub(crate) struct HttpRpcTransport {
    url: String,
    network: Arc<NetworkPolicy>,
    client: reqwest::Client,
    next_id: AtomicI64,
}

impl HttpRpcTransport {
    pub(crate) fn new(url: String, network: Arc<NetworkPolicy>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(Policy::none())
            .build()?;
        Ok(Self {
            url,
            network,
            client,
            next_id: AtomicI64::new(1),
        })
    }

    pub(crate) async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        headers: &[(String, String)],
        context: &ExecutionContext,
        timeout: Duration,
    ) -> Result<Value> {
        let (target, host_header) = self.pinned_target(&self.url).await?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let envelope = JsonRpcRequest::new(RequestId::Integer(id), method, params);

        let mut request = self
            .client
            .post(target)
            .timeout(timeout)
            .header(CORRELATION_HEADER, &context.correlation_id)
            .json(&envelope);
        if let Some(host) = host_header {
            request = request.header(HOST, host);
        }
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| transport_error("request failed", e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ConduitErr::Transport(format!(
                "upstream returned HTTP {status}"
            )));
        }
        let envelope: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| transport_error("invalid response body", e))?;
        response_into_result(envelope)
    }

    pub(crate) async fn get_manifest(
        &self,
        headers: &[(String, String)],
        timeout: Duration,
    ) -> Option<ToolManifest> {
        let (target, host_header) = self.pinned_target(&manifest_url(&self.url)).await.ok()?;
        let mut request = self.client.get(target).timeout(timeout);
        if let Some(host) = host_header {
            request = request.header(HOST, host);
        }
        for (name, value) in headers {
            request = request.header(name, value);
        }
        let response = request.send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.json::<ToolManifest>().await.ok()
    }

    /// Validate the URL; on a resolved address, rewrite the target host to
    /// that address and return the original authority for the Host header.
    async fn pinned_target(&self, url: &str) -> Result<(Url, Option<String>)> {
        let validation = self.network.validate_url(url).await;
        if !validation.valid {
            return Err(ConduitErr::Forbidden(
                validation
                    .message
                    .unwrap_or_else(|| format!("URL '{url}' is not permitted")),
            ));
        }
        let parsed =
            Url::parse(url).map_err(|e| ConduitErr::Internal(format!("invalid URL: {e}")))?;
        match validation.resolved_ip {
            Some(ip) => {
                let original_authority = authority_of(&parsed);
                let mut pinned = parsed;
                pinned
                    .set_ip_host(ip)
                    .map_err(|_| ConduitErr::Internal("could not pin resolved IP".to_string()))?;
                Ok((pinned, Some(original_authority)))
            }
            None => Ok((parsed, None)),
        }
    }
}

fn authority_of(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

fn transport_error(what: &str, e: reqwest::Error) -> ConduitErr {
    if e.is_timeout() {
        ConduitErr::UpstreamTimeout(format!("{what}: {e}"))
    } else {
        ConduitErr::Transport(format!("{what}: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Principal;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::ResponseTemplate;
    use wiremock::matchers::header_exists;
    use wiremock::matchers::method;
    use wiremock::matchers::path;

    fn permissive_network() -> Arc<NetworkPolicy> {
        Arc::new(NetworkPolicy::new(1000, Duration::from_secs(60), true))
    }

    fn context() -> ExecutionContext {
        ExecutionContext::new(Principal::Master, false)
    }

    #[tokio::test]
    async fn posts_envelope_and_returns_result() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rpc"))
            .and(header_exists(CORRELATION_HEADER))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "result": {"tools": []},
            })))
            .mount(&server)
            .await;

        let transport =
            HttpRpcTransport::new(format!("{}/rpc", server.uri()), permissive_network())
                .expect("build");
        let result = transport
            .call("tools/list", None, &[], &context(), Duration::from_secs(5))
            .await
            .expect("call");
        assert_eq!(result, json!({"tools": []}));
    }

    #[tokio::test]
    async fn private_targets_are_forbidden() {
        // Default policy: loopback upstreams are refused before any dial.
        let network = Arc::new(NetworkPolicy::default());
        let transport =
            HttpRpcTransport::new("http://localhost:8080/rpc".to_string(), network).expect("build");
        let err = transport
            .call("tools/list", None, &[], &context(), Duration::from_secs(5))
            .await
            .expect_err("must be blocked");
        assert_eq!(err.code(), -32003);
        assert!(err.to_string().contains("private network"));
    }

    #[tokio::test]
    async fn manifest_probe_failure_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let transport =
            HttpRpcTransport::new(server.uri(), permissive_network()).expect("build");
        assert!(
            transport
                .get_manifest(&[], Duration::from_secs(2))
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn manifest_probe_success_parses_stubs() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("/{}", crate::upstream::MANIFEST_SUFFIX)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "tools": [{"name": "hello", "description": "greets"}],
            })))
            .mount(&server)
            .await;
        let transport =
            HttpRpcTransport::new(server.uri(), permissive_network()).expect("build");
        let manifest = transport
            .get_manifest(&[], Duration::from_secs(2))
            .await
            .expect("manifest");
        assert_eq!(manifest.tools.len(), 1);
        assert_eq!(manifest.tools[0].name, "hello");
    }
}
