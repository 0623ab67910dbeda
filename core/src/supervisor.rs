//! Execution supervisor: the protocol between an execute request and a
//! sandbox backend.
//!
//! Merge limits, sanity-check the source, route to a backend, mint a session
//! bound to the allowlist, emit the SDK, run, and unconditionally invalidate
//! the session on the way out.

use std::sync::Arc;

use regex_lite::Regex;
use std::sync::LazyLock;
use tracing::debug;

use conduit_protocol::ResourceLimits;
use conduit_protocol::ResourceLimitsOverride;

use crate::context::ExecutionContext;
use crate::error::ConduitErr;
use crate::error::Result;
use crate::gateway::Gateway;
use crate::policy;
use crate::sandbox::ExecutionOutcome;
use crate::sandbox::IsolateBackend;
use crate::sandbox::PythonPoolBackend;
use crate::sandbox::SandboxBackend;
use crate::sandbox::SandboxInjection;
use crate::sandbox::SubprocessBackend;
use crate::sdk;
use crate::session_store::SessionStore;

/// Upper bound on submitted source. A sanity check against abuse of the
/// transport, not a security control.
pub const MAX_SOURCE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionKind {
    TypeScript,
    Python,
    Isolate,
}

static BLOCK_COMMENTS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)/\*.*?\*/").unwrap_or_else(|e| panic!("static regex must compile: {e}"))
});
static LINE_COMMENTS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"//[^\n]*").unwrap_or_else(|e| panic!("static regex must compile: {e}"))
});
static MODULE_SYNTAX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(import|export)\b").unwrap_or_else(|e| panic!("static regex must compile: {e}"))
});
static RUNTIME_GLOBAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bDeno\b").unwrap_or_else(|e| panic!("static regex must compile: {e}"))
});

/// True when the source has no module syntax and no runtime-global
/// references once comments are stripped, i.e. it can run in the isolate.
pub fn is_simple_source(source: &str) -> bool {
    let without_blocks = BLOCK_COMMENTS.replace_all(source, "");
    let stripped = LINE_COMMENTS.replace_all(&without_blocks, "");
    !MODULE_SYNTAX.is_match(&stripped) && !RUNTIME_GLOBAL.is_match(&stripped)
}

pub struct ExecutionSupervisor {
    gateway: Arc<Gateway>,
    sessions: Arc<SessionStore>,
    defaults: ResourceLimits,
    ipc_addr: Option<String>,
    isolate: Option<SandboxBackend>,
    subprocess: SandboxBackend,
    python: SandboxBackend,
}

impl ExecutionSupervisor {
    pub fn new(
        gateway: Arc<Gateway>,
        sessions: Arc<SessionStore>,
        defaults: ResourceLimits,
        ipc_addr: Option<String>,
        isolate: Option<IsolateBackend>,
        subprocess: SubprocessBackend,
        python: PythonPoolBackend,
    ) -> Self {
        Self {
            gateway,
            sessions,
            defaults,
            ipc_addr,
            isolate: isolate.map(SandboxBackend::Isolate),
            subprocess: SandboxBackend::Subprocess(subprocess),
            python: SandboxBackend::PythonPool(python),
        }
    }

    pub async fn execute(
        &self,
        kind: ExecutionKind,
        source: &str,
        limits: Option<ResourceLimitsOverride>,
        context: &ExecutionContext,
        allowed_tools: Option<Vec<String>>,
    ) -> Result<ExecutionOutcome> {
        // 1. Caller limits shallow-override the server defaults.
        let limits = limits.unwrap_or_default().merged_with(self.defaults);
        limits.validate().map_err(ConduitErr::InvalidParams)?;

        // 2. Source sanity bounds (not a security control).
        if source.trim().is_empty() {
            return Err(ConduitErr::InvalidParams(
                "code must not be empty".to_string(),
            ));
        }
        if source.len() > MAX_SOURCE_BYTES {
            return Err(ConduitErr::InvalidParams(format!(
                "code exceeds the {MAX_SOURCE_BYTES} byte limit"
            )));
        }

        // Bad allowlist patterns are rejected before anything starts.
        if let Some(patterns) = allowed_tools.as_deref() {
            policy::compile_patterns(patterns)?;
        }

        // 3. Routing for the primary flavor; everything else is fixed.
        let backend = match kind {
            ExecutionKind::Isolate => self.isolate.as_ref().ok_or_else(|| {
                ConduitErr::Internal("the isolate backend is disabled".to_string())
            })?,
            ExecutionKind::Python => &self.python,
            ExecutionKind::TypeScript => match &self.isolate {
                Some(isolate) if is_simple_source(source) => isolate,
                _ => &self.subprocess,
            },
        };

        // 4. Backends that reach tools over the wire need the endpoint.
        if backend.requires_reverse_ipc() && self.ipc_addr.is_none() {
            return Err(ConduitErr::Internal(
                "reverse IPC endpoint is not configured; cannot run this backend".to_string(),
            ));
        }

        // 5. Stub discovery; per-package failures are logged inside the
        // gateway and simply missing from the SDK.
        let execution_context = context
            .clone()
            .with_allowed_tools(allowed_tools.clone());
        let bindings = self.gateway.discover_tools(&execution_context).await;
        debug!(
            "emitting SDK with {} tool bindings for {:?}",
            bindings.len(),
            kind
        );

        // 6. The session exists strictly before the sandbox spawns...
        let session_token = self.sessions.create(allowed_tools.clone()).await;

        // 7. SDK targeted at the chosen backend's flavor.
        let sdk_source = sdk::emit(backend.flavor(), &bindings, allowed_tools.as_deref());

        let injection = SandboxInjection {
            ipc_addr: self.ipc_addr.clone(),
            session_token: session_token.clone(),
            sdk_source,
        };

        // 8. ...and is invalidated unconditionally after it exits.
        let outcome = backend
            .execute(source, &limits, &execution_context, &injection)
            .await;
        self.sessions.invalidate(&session_token).await;

        Ok(outcome)
    }
}
