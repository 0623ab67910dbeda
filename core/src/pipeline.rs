//! The agent-facing request pipeline.
//!
//! A fixed middleware order: error capture → logging/metrics →
//! authentication → rate limit → dispatch. The same pipeline is re-entered
//! by sandbox callbacks over the reverse IPC endpoint, where the session
//! token confines the caller to the discovery/call subset.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Instant;

use metrics::counter;
use metrics::histogram;
use serde_json::Value;
use serde_json::json;
use tracing::debug;
use tracing::warn;

use conduit_protocol::CallToolParams;
use conduit_protocol::DiscoverToolsResult;
use conduit_protocol::ErrorObject;
use conduit_protocol::ExecuteParams;
use conduit_protocol::ExecuteResult;
use conduit_protocol::InitializeResult;
use conduit_protocol::JsonRpcRequest;
use conduit_protocol::JsonRpcResponse;
use conduit_protocol::RequestId;
use conduit_protocol::ServerInfo;
use conduit_protocol::error_code;
use conduit_protocol::methods;

use crate::context::ExecutionContext;
use crate::context::Principal;
use crate::error::ConduitErr;
use crate::gate::ConcurrencyGate;
use crate::gateway::Gateway;
use crate::gateway::ToolCallOutput;
use crate::network_policy::NetworkPolicy;
use crate::sandbox::ExecutionOutcome;
use crate::session_store::SessionStore;
use crate::supervisor::ExecutionKind;
use crate::supervisor::ExecutionSupervisor;

const REQUESTS_METRIC: &str = "conduit_rpc_requests_total";
const DURATION_METRIC: &str = "conduit_rpc_request_duration_seconds";

pub const PROTOCOL_VERSION: &str = "2025-03-26";

const SESSION_RESTRICTED_MESSAGE: &str =
    "Session tokens are restricted to tool discovery and tool calls";

/// Methods a live session token may invoke.
const SESSION_METHODS: &[&str] = &[
    methods::INITIALIZE,
    methods::INITIALIZED,
    methods::DISCOVER_TOOLS,
    methods::CALL_TOOL,
    methods::PING,
    methods::TOOLS_LIST,
    methods::TOOLS_CALL,
];

/// Per-connection state handed in by the transport.
#[derive(Debug)]
pub struct PeerInfo {
    /// Stable identifier for the remote end, used as the rate-limit key
    /// when no bearer token is present.
    pub peer_id: String,
    initialized: AtomicBool,
}

impl PeerInfo {
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            initialized: AtomicBool::new(false),
        }
    }
}

enum PipelineError {
    Classified(ConduitErr),
    Envelope(ErrorObject),
}

impl From<ConduitErr> for PipelineError {
    fn from(err: ConduitErr) -> Self {
        PipelineError::Classified(err)
    }
}

impl PipelineError {
    fn into_error_object(self) -> ErrorObject {
        match self {
            PipelineError::Classified(err) => err.to_error_object(),
            PipelineError::Envelope(envelope) => envelope,
        }
    }
}

type PipelineResult = std::result::Result<Option<Value>, PipelineError>;

pub struct RequestPipeline {
    gateway: Arc<Gateway>,
    supervisor: Arc<ExecutionSupervisor>,
    sessions: Arc<SessionStore>,
    network: Arc<NetworkPolicy>,
    gate: Arc<ConcurrencyGate>,
    master_token: Option<String>,
    strict_validation: bool,
}

impl RequestPipeline {
    pub fn new(
        gateway: Arc<Gateway>,
        supervisor: Arc<ExecutionSupervisor>,
        sessions: Arc<SessionStore>,
        network: Arc<NetworkPolicy>,
        gate: Arc<ConcurrencyGate>,
        master_token: Option<String>,
        strict_validation: bool,
    ) -> Self {
        Self {
            gateway,
            supervisor,
            sessions,
            network,
            gate,
            master_token,
            strict_validation,
        }
    }

    /// Parse one wire line. Non-JSON yields a parse-error envelope whose id
    /// is salvaged from the raw value when possible, `null` otherwise.
    pub fn parse_line(line: &str) -> std::result::Result<JsonRpcRequest, JsonRpcResponse> {
        match serde_json::from_str::<JsonRpcRequest>(line) {
            Ok(request) => Ok(request),
            Err(e) => {
                let salvaged_id = serde_json::from_str::<Value>(line)
                    .ok()
                    .and_then(|value| value.get("id").cloned())
                    .and_then(|id| serde_json::from_value::<RequestId>(id).ok());
                Err(JsonRpcResponse::err(
                    salvaged_id,
                    ErrorObject::new(error_code::PARSE_ERROR, format!("Parse error: {e}")),
                ))
            }
        }
    }

    pub async fn handle_line(&self, line: &str, peer: &PeerInfo) -> Option<JsonRpcResponse> {
        match Self::parse_line(line) {
            Ok(request) => self.handle_request(request, peer).await,
            Err(response) => Some(response),
        }
    }

    /// Full middleware chain. Returns `None` for notifications.
    pub async fn handle_request(
        &self,
        request: JsonRpcRequest,
        peer: &PeerInfo,
    ) -> Option<JsonRpcResponse> {
        let id = request.id.clone();
        let method = request.method.clone();
        let is_notification = request.is_notification();

        // Logging/metrics middleware.
        let started = Instant::now();
        counter!(REQUESTS_METRIC, "method" => method.clone()).increment(1);
        debug!(method = %method, id = ?id, "request received");

        // Error capture: everything below reports through a Result and is
        // rewritten into an envelope that preserves the request id.
        let result = self.process(request, peer).await;

        histogram!(DURATION_METRIC, "method" => method.clone())
            .record(started.elapsed().as_secs_f64());

        match result {
            Ok(Some(value)) => {
                if is_notification {
                    None
                } else {
                    Some(JsonRpcResponse::ok(id, value))
                }
            }
            Ok(None) => None,
            Err(e) => {
                let envelope = e.into_error_object();
                if is_notification {
                    warn!(method = %method, code = envelope.code, "notification failed: {}", envelope.message);
                    None
                } else {
                    Some(JsonRpcResponse::err(id, envelope))
                }
            }
        }
    }

    async fn process(&self, request: JsonRpcRequest, peer: &PeerInfo) -> PipelineResult {
        let bearer = request
            .auth
            .as_ref()
            .and_then(|auth| auth.bearer_token.clone());

        // Authentication middleware.
        let (principal, session_allowed_tools) =
            self.authenticate(bearer.as_deref(), &request.method).await?;

        // Rate-limit middleware: key on the token when present, otherwise
        // the transport peer.
        let rate_key = bearer.as_deref().unwrap_or(peer.peer_id.as_str());
        if !self.network.check_rate_limit(rate_key) {
            return Err(ConduitErr::RateLimited.into());
        }

        let context = ExecutionContext::new(principal, self.strict_validation)
            .with_allowed_tools(session_allowed_tools);

        self.dispatch(request, peer, context).await
    }

    async fn authenticate(
        &self,
        bearer: Option<&str>,
        method: &str,
    ) -> std::result::Result<(Principal, Option<Vec<String>>), PipelineError> {
        match (self.master_token.as_deref(), bearer) {
            (Some(master), Some(token)) if constant_time_eq(master, token) => {
                Ok((Principal::Master, None))
            }
            (_, Some(token)) => match self.sessions.get(token).await {
                Some(session) => {
                    if !SESSION_METHODS.contains(&method) {
                        return Err(ConduitErr::Forbidden(
                            SESSION_RESTRICTED_MESSAGE.to_string(),
                        )
                        .into());
                    }
                    Ok((
                        Principal::Session {
                            token: token.to_string(),
                        },
                        session.allowed_tools,
                    ))
                }
                None => Err(ConduitErr::Forbidden("invalid bearer token".to_string()).into()),
            },
            (Some(_), None) => {
                Err(ConduitErr::Forbidden("authentication required".to_string()).into())
            }
            // No master token configured: authentication is disabled and
            // the local transport is implicitly trusted.
            (None, None) => Ok((Principal::Master, None)),
        }
    }

    async fn dispatch(
        &self,
        request: JsonRpcRequest,
        peer: &PeerInfo,
        context: ExecutionContext,
    ) -> PipelineResult {
        let JsonRpcRequest { method, params, .. } = request;
        match method.as_str() {
            methods::INITIALIZE => self.handle_initialize(peer),
            methods::INITIALIZED => Ok(None),
            methods::PING => Ok(Some(json!({}))),
            methods::DISCOVER_TOOLS | methods::TOOLS_LIST => {
                let tools = self
                    .gate
                    .run(self.gateway.discover_tools(&context))
                    .await?;
                Ok(Some(serde_json::to_value(DiscoverToolsResult { tools }).map_err(
                    |e| PipelineError::Classified(ConduitErr::Internal(e.to_string())),
                )?))
            }
            methods::CALL_TOOL | methods::TOOLS_CALL => {
                let params: CallToolParams = parse_params(params)?;
                self.gate
                    .run(self.handle_call_tool(params, &context))
                    .await
                    .map_err(PipelineError::from)?
            }
            methods::EXECUTE_TYPESCRIPT => {
                self.handle_execute(ExecutionKind::TypeScript, params, &context)
                    .await
            }
            methods::EXECUTE_PYTHON => {
                self.handle_execute(ExecutionKind::Python, params, &context)
                    .await
            }
            methods::EXECUTE_ISOLATE => {
                self.handle_execute(ExecutionKind::Isolate, params, &context)
                    .await
            }
            unknown => Err(ConduitErr::MethodNotFound(unknown.to_string()).into()),
        }
    }

    fn handle_initialize(&self, peer: &PeerInfo) -> PipelineResult {
        if peer.initialized.swap(true, Ordering::SeqCst) {
            return Err(PipelineError::Envelope(ErrorObject::new(
                error_code::INVALID_REQUEST,
                "initialize called more than once",
            )));
        }
        let result = InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            server_info: ServerInfo {
                name: "conduit".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            capabilities: json!({"tools": {}}),
        };
        serde_json::to_value(result)
            .map(Some)
            .map_err(|e| PipelineError::Classified(ConduitErr::Internal(e.to_string())))
    }

    async fn handle_call_tool(
        &self,
        params: CallToolParams,
        context: &ExecutionContext,
    ) -> PipelineResult {
        let output = self
            .gateway
            .call_tool(&params.name, params.arguments, context)
            .await?;
        match output {
            ToolCallOutput::Value(value) => Ok(Some(value)),
            ToolCallOutput::Builtin { tool, arguments } => {
                // Built-in execute tools ride through tools/call but stay
                // off-limits to session principals.
                if matches!(context.principal, Principal::Session { .. }) {
                    return Err(
                        ConduitErr::Forbidden(SESSION_RESTRICTED_MESSAGE.to_string()).into()
                    );
                }
                let kind = match tool.as_str() {
                    "executeTypeScript" => ExecutionKind::TypeScript,
                    "executePython" => ExecutionKind::Python,
                    "executeIsolate" => ExecutionKind::Isolate,
                    other => {
                        return Err(ConduitErr::MethodNotFound(format!(
                            "unknown built-in tool '{other}'"
                        ))
                        .into());
                    }
                };
                self.execute_inner(kind, arguments, context).await
            }
        }
    }

    async fn handle_execute(
        &self,
        kind: ExecutionKind,
        params: Option<Value>,
        context: &ExecutionContext,
    ) -> PipelineResult {
        self.gate
            .run(self.execute_inner(kind, params, context))
            .await
            .map_err(PipelineError::from)?
    }

    async fn execute_inner(
        &self,
        kind: ExecutionKind,
        params: Option<Value>,
        context: &ExecutionContext,
    ) -> PipelineResult {
        let params: ExecuteParams = parse_params(params)?;
        let outcome = self
            .supervisor
            .execute(kind, &params.code, params.limits, context, params.allowed_tools)
            .await?;
        outcome_to_result(outcome)
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(
    params: Option<Value>,
) -> std::result::Result<T, PipelineError> {
    let params = params.unwrap_or_else(|| json!({}));
    serde_json::from_value(params)
        .map_err(|e| ConduitErr::InvalidParams(e.to_string()).into())
}

/// A limit breach travels as an error envelope that still carries the
/// captured (truncated) output in `data`.
fn outcome_to_result(outcome: ExecutionOutcome) -> PipelineResult {
    let ExecutionOutcome {
        stdout,
        stderr,
        exit_code,
        error,
    } = outcome;
    match error {
        None => {
            let result = ExecuteResult {
                stdout,
                stderr,
                exit_code,
            };
            serde_json::to_value(result)
                .map(Some)
                .map_err(|e| PipelineError::Classified(ConduitErr::Internal(e.to_string())))
        }
        Some(err) => Err(PipelineError::Envelope(err.to_error_object().with_data(
            json!({
                "stdout": stdout,
                "stderr": stderr,
                "exitCode": exit_code,
            }),
        ))),
    }
}

/// Constant-time string equality for bearer-token comparison: no early exit
/// on the first mismatching byte.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    let mut diff = a.len() ^ b.len();
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= usize::from(x ^ y);
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn constant_time_eq_agrees_with_eq() {
        assert!(constant_time_eq("secret", "secret"));
        assert!(!constant_time_eq("secret", "secrex"));
        assert!(!constant_time_eq("secret", "secre"));
        assert!(!constant_time_eq("", "x"));
        assert!(constant_time_eq("", ""));
    }

    #[test]
    fn parse_line_salvages_ids() {
        let err = RequestPipeline::parse_line("not json").expect_err("parse error");
        assert_eq!(err.id, None);
        let error = err.error.expect("error object");
        assert_eq!(error.code, error_code::PARSE_ERROR);

        // JSON, but not a valid request shape: the id survives.
        let err = RequestPipeline::parse_line(r#"{"id": 7, "method": 12}"#)
            .expect_err("parse error");
        assert_eq!(err.id, Some(RequestId::Integer(7)));
    }

    #[test]
    fn parse_line_accepts_requests_and_notifications() {
        let request =
            RequestPipeline::parse_line(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#)
                .expect("request");
        assert!(!request.is_notification());
        let notification = RequestPipeline::parse_line(
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
        )
        .expect("notification");
        assert!(notification.is_notification());
    }

    #[test]
    fn limit_breach_envelope_carries_truncated_output() {
        let outcome = ExecutionOutcome {
            stdout: "AAAA".to_string(),
            stderr: String::new(),
            exit_code: -1,
            error: Some(ConduitErr::OutputLimitExceeded(100)),
        };
        let err = match outcome_to_result(outcome) {
            Err(e) => e.into_error_object(),
            Ok(_) => panic!("must be an error"),
        };
        assert_eq!(err.code, error_code::OUTPUT_LIMIT_EXCEEDED);
        let data = err.data.expect("data");
        assert_eq!(data.get("stdout"), Some(&json!("AAAA")));
    }
}
