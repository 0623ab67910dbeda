//! Shared harness: a fully wired host (gateway, supervisor, pipeline,
//! reverse IPC) with an in-memory transport.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use conduit_core::Gateway;
use conduit_core::PeerInfo;
use conduit_core::RequestPipeline;
use conduit_core::ReverseIpcEndpoint;
use conduit_core::SessionStore;
use conduit_core::auth::AuthBroker;
use conduit_core::config::UpstreamConfig;
use conduit_core::gate::ConcurrencyGate;
use conduit_core::network_policy::NetworkPolicy;
use conduit_core::sandbox::IsolateBackend;
use conduit_core::sandbox::PythonPoolBackend;
use conduit_core::sandbox::SubprocessBackend;
use conduit_core::schema_cache::SchemaCache;
use conduit_core::supervisor::ExecutionSupervisor;
use conduit_protocol::JsonRpcRequest;
use conduit_protocol::JsonRpcResponse;
use conduit_protocol::RequestId;
use conduit_protocol::ResourceLimits;

pub struct TestHost {
    pub pipeline: Arc<RequestPipeline>,
    pub sessions: Arc<SessionStore>,
    pub gateway: Arc<Gateway>,
    pub peer: PeerInfo,
}

pub struct TestHostOptions {
    pub upstreams: Vec<UpstreamConfig>,
    pub master_token: Option<String>,
    pub rate_limit: u32,
    pub limits: ResourceLimits,
}

impl Default for TestHostOptions {
    fn default() -> Self {
        Self {
            upstreams: Vec::new(),
            master_token: None,
            rate_limit: 10_000,
            limits: ResourceLimits::default(),
        }
    }
}

pub async fn build_host(options: TestHostOptions) -> TestHost {
    let shutdown = Arc::new(Notify::new());
    let network = Arc::new(NetworkPolicy::new(
        options.rate_limit,
        Duration::from_secs(60),
        false,
    ));
    let auth = Arc::new(AuthBroker::new());
    let schema_cache = Arc::new(SchemaCache::default());
    let sessions = Arc::new(SessionStore::default());
    let gateway = Arc::new(
        Gateway::from_configs(options.upstreams, auth, network.clone(), schema_cache)
            .expect("gateway must build"),
    );

    let ipc = ReverseIpcEndpoint::bind_loopback().await.expect("bind ipc");
    let ipc_addr = ipc.address().to_string();

    let isolate = IsolateBackend::new(gateway.clone(), network.clone());
    let subprocess =
        SubprocessBackend::new("deno".to_string(), 4, shutdown.clone());
    let python = PythonPoolBackend::new("python3".to_string(), 2, shutdown.clone());

    let supervisor = Arc::new(ExecutionSupervisor::new(
        gateway.clone(),
        sessions.clone(),
        options.limits,
        Some(ipc_addr),
        Some(isolate),
        subprocess,
        python,
    ));
    let gate = Arc::new(ConcurrencyGate::new(8, 16));
    let pipeline = Arc::new(RequestPipeline::new(
        gateway.clone(),
        supervisor,
        sessions.clone(),
        network,
        gate,
        options.master_token,
        false,
    ));

    tokio::spawn(ipc.serve(pipeline.clone(), shutdown));

    TestHost {
        pipeline,
        sessions,
        gateway,
        peer: PeerInfo::new("test-peer"),
    }
}

pub fn request(
    id: i64,
    method: &str,
    params: Option<serde_json::Value>,
) -> JsonRpcRequest {
    JsonRpcRequest::new(RequestId::Integer(id), method, params)
}

impl TestHost {
    pub async fn call(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> JsonRpcResponse {
        self.pipeline
            .handle_request(request(1, method, params), &self.peer)
            .await
            .expect("request with id must produce a response")
    }
}

/// A line-oriented JSON-RPC tool provider written in python, used as a
/// stand-in upstream for federation tests.
pub const MOCK_UPSTREAM: &str = r#"
import json, sys

def handle(req):
    method = req.get("method")
    if method == "tools/list":
        return {"tools": [{
            "name": "hello",
            "description": "greets the caller",
            "inputSchema": {
                "type": "object",
                "properties": {"name": {"type": "string"}},
                "required": ["name"],
            },
        }]}
    if method == "tools/call":
        params = req.get("params") or {}
        args = params.get("arguments") or {}
        return {
            "message": "Hello " + str(args.get("name")),
            "received": params,
        }
    return {}

for line in sys.stdin:
    req = json.loads(line)
    resp = {"jsonrpc": "2.0", "id": req["id"], "result": handle(req)}
    sys.stdout.write(json.dumps(resp) + "\n")
    sys.stdout.flush()
"#;

pub fn mock_upstream_config(id: &str) -> UpstreamConfig {
    UpstreamConfig {
        id: id.to_string(),
        transport: conduit_core::config::UpstreamTransportConfig::Subprocess {
            command: format!("python3 -c {}", shell_quote(MOCK_UPSTREAM)),
            env: std::collections::HashMap::new(),
        },
        credential: None,
    }
}

fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

pub fn python_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .is_ok()
}

pub fn deno_available() -> bool {
    std::process::Command::new("deno")
        .arg("--version")
        .output()
        .is_ok()
}
