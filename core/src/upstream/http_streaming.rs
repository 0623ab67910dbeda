//! Streaming HTTP upstream: a persistent provider session with origin and
//! DNS pinning.
//!
//! The session is established lazily on first call. A dedicated client is
//! built per session whose resolver is overridden to return the address
//! pinned at validation time; later DNS answers are never consulted again.
//! Any outbound operation whose scheme/host/port differ from the pinned
//! origin is refused outright, and redirects are disabled.

use std::net::IpAddr;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::redirect::Policy;
use serde_json::Value;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::debug;
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

const SESSION_ID_HEADER: &str = "mcp-session-id";

#[derive(Debug, Clone, PartialEq, Eq)]
struct PinnedOrigin {
    scheme: String,
    host: String,
    port: u16,
}

impl PinnedOrigin {
    fn of(url: &Url) -> Result<Self> {
        let host = url
            .host_str()
            .ok_or_else(|| ConduitErr::Internal("upstream URL has no host".to_string()))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| ConduitErr::Internal("upstream URL has no port".to_string()))?;
        Ok(Self {
            scheme: url.scheme().to_string(),
            host,
            port,
        })
    }
}

struct Session {
    client: reqwest::Client,
    origin: PinnedOrigin,
    session_id: Option<String>,
}

pub(crate) struct StreamingTransport {
    url: String,
    network: Arc<NetworkPolicy>,
    session: Mutex<Option<Session>>,
    next_id: AtomicI64,
}

impl StreamingTransport {
    pub(crate) fn new(url: String, network: Arc<NetworkPolicy>) -> anyhow::Result<Self> {
        Ok(Self {
            url,
            network,
            session: Mutex::new(None),
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
        self.ensure_session(headers).await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let envelope = JsonRpcRequest::new(RequestId::Integer(id), method, params);
        tokio::time::timeout(
            timeout,
            self.post_and_read(&envelope, RequestId::Integer(id), headers, context),
        )
        .await
        .map_err(|_| {
            ConduitErr::UpstreamTimeout(format!(
                "no response from streaming upstream within {} ms",
                timeout.as_millis()
            ))
        })?
    }

    pub(crate) async fn get_manifest(
        &self,
        headers: &[(String, String)],
        timeout: Duration,
    ) -> Option<ToolManifest> {
        self.ensure_session(headers).await.ok()?;
        let target = manifest_url(&self.url);
        let session = self.session.lock().await;
        let session = session.as_ref()?;
        // The manifest shares the provider origin by construction; keep the
        // check anyway so every outbound operation goes through it.
        ensure_same_origin(&session.origin, &target).ok()?;
        let response = session
            .client
            .get(&target)
            .timeout(timeout)
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.json::<ToolManifest>().await.ok()
    }

    async fn post_and_read(
        &self,
        envelope: &JsonRpcRequest,
        expected_id: RequestId,
        headers: &[(String, String)],
        context: &ExecutionContext,
    ) -> Result<Value> {
        let session = self.session.lock().await;
        let Some(session) = session.as_ref() else {
            return Err(ConduitErr::Transport(
                "streaming session unavailable".to_string(),
            ));
        };
        ensure_same_origin(&session.origin, &self.url)?;

        let mut request = session
            .client
            .post(&self.url)
            .header("accept", "application/json, text/event-stream")
            .header(CORRELATION_HEADER, &context.correlation_id)
            .json(envelope);
        if let Some(session_id) = &session.session_id {
            request = request.header(SESSION_ID_HEADER, session_id);
        }
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ConduitErr::Transport(format!("streaming request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ConduitErr::Transport(format!(
                "streaming upstream returned HTTP {status}"
            )));
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        if content_type.starts_with("text/event-stream") {
            let mut events = response.bytes_stream().eventsource();
            while let Some(event) = events.next().await {
                let event = event
                    .map_err(|e| ConduitErr::Transport(format!("event stream error: {e}")))?;
                let Ok(parsed) = serde_json::from_str::<JsonRpcResponse>(&event.data) else {
                    debug!("skipping non-response event frame");
                    continue;
                };
                if parsed.id.as_ref() == Some(&expected_id) {
                    return response_into_result(parsed);
                }
            }
            Err(ConduitErr::Transport(
                "event stream ended before a response arrived".to_string(),
            ))
        } else {
            let parsed: JsonRpcResponse = response
                .json()
                .await
                .map_err(|e| ConduitErr::Transport(format!("invalid response body: {e}")))?;
            response_into_result(parsed)
        }
    }

    /// Establish the provider session on first use: validate + pin, build
    /// the pinned client, then run the initialize handshake.
    async fn ensure_session(&self, headers: &[(String, String)]) -> Result<()> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            return Ok(());
        }

        let validation = self.network.validate_url(&self.url).await;
        if !validation.valid {
            return Err(ConduitErr::Forbidden(validation.message.unwrap_or_else(
                || format!("URL '{}' is not permitted", self.url),
            )));
        }
        let parsed = Url::parse(&self.url)
            .map_err(|e| ConduitErr::Internal(format!("invalid URL: {e}")))?;
        let origin = PinnedOrigin::of(&parsed)?;

        let client = build_pinned_client(&origin, validation.resolved_ip)?;
        let mut new_session = Session {
            client,
            origin,
            session_id: None,
        };
        self.initialize_session(&mut new_session, headers).await?;
        *session = Some(new_session);
        Ok(())
    }

    async fn initialize_session(
        &self,
        session: &mut Session,
        headers: &[(String, String)],
    ) -> Result<()> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let envelope = JsonRpcRequest::new(
            RequestId::Integer(id),
            "initialize",
            Some(json!({
                "protocolVersion": "2025-03-26",
                "capabilities": {},
                "clientInfo": {"name": "conduit", "version": env!("CARGO_PKG_VERSION")},
            })),
        );
        let mut request = session
            .client
            .post(&self.url)
            .header("accept", "application/json, text/event-stream")
            .json(&envelope);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        let response = request
            .send()
            .await
            .map_err(|e| ConduitErr::Transport(format!("session handshake failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ConduitErr::Transport(format!(
                "session handshake returned HTTP {status}"
            )));
        }
        session.session_id = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        // Fire-and-forget initialized notification; providers that do not
        // require it simply ignore the extra POST.
        let initialized = JsonRpcRequest::new(None, "notifications/initialized", None);
        let mut request = session.client.post(&self.url).json(&initialized);
        if let Some(session_id) = &session.session_id {
            request = request.header(SESSION_ID_HEADER, session_id);
        }
        let _ = request.send().await;
        Ok(())
    }
}

/// Build a client whose resolver always answers with the pinned address for
/// the pinned hostname and never follows redirects.
fn build_pinned_client(origin: &PinnedOrigin, pinned_ip: Option<IpAddr>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().redirect(Policy::none());
    if let Some(ip) = pinned_ip {
        builder = builder.resolve(&origin.host, SocketAddr::new(ip, origin.port));
    }
    builder
        .build()
        .map_err(|e| ConduitErr::Internal(format!("could not build pinned client: {e}")))
}

fn ensure_same_origin(origin: &PinnedOrigin, target: &str) -> Result<()> {
    let parsed =
        Url::parse(target).map_err(|e| ConduitErr::Internal(format!("invalid URL: {e}")))?;
    let target_origin = PinnedOrigin::of(&parsed)?;
    if *origin != target_origin {
        return Err(ConduitErr::Forbidden(format!(
            "cross-origin request to '{target}' refused; session is pinned to {}://{}:{}",
            origin.scheme, origin.host, origin.port
        )));
    }
    Ok(())
}
