//! In-process isolate backend.
//!
//! Runs "simple" JavaScript (no module syntax, no runtime globals) inside an
//! embedded QuickJS heap capped at `memory_mb`. The wall clock is enforced by
//! two cooperating deadlines: an interrupt handler fires during the
//! synchronous phase, and the job-drain loop checks the same deadline for the
//! asynchronous tail. Tool calls go straight to the gateway through a
//! synchronous host bridge; no reverse IPC is involved.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use serde_json::json;
use tokio::runtime::Handle;
use tracing::debug;

use conduit_protocol::ResourceLimits;

use crate::context::ExecutionContext;
use crate::error::ConduitErr;
use crate::gateway::Gateway;
use crate::gateway::ToolCallOutput;
use crate::network_policy::NetworkPolicy;
use crate::sandbox::ExecutionOutcome;
use crate::sandbox::LimitKind;
use crate::sandbox::OutputBuffer;
use crate::sandbox::SandboxInjection;

/// Console shim evaluated before the SDK; `__USER_SOURCE__` is replaced with
/// a JSON string literal of the user program so that user-level failures are
/// caught in JS and reported through the host bridge.
const ISOLATE_PRELUDE: &str = r#"
"use strict";
function __fmtValue(value) {
  if (typeof value === "string") return value;
  if (value instanceof Error) {
    const stack = value.stack ? "\n" + value.stack : "";
    return String(value) + stack;
  }
  try {
    const text = JSON.stringify(value);
    return text === undefined ? String(value) : text;
  } catch (_) {
    return String(value);
  }
}
function __fmtArgs(args) {
  return args.map(__fmtValue).join(" ") + "\n";
}
globalThis.console = {
  log: (...args) => __print(__fmtArgs(args)),
  info: (...args) => __print(__fmtArgs(args)),
  debug: (...args) => __print(__fmtArgs(args)),
  warn: (...args) => __printErr(__fmtArgs(args)),
  error: (...args) => __printErr(__fmtArgs(args)),
};
"#;

const ISOLATE_RUN_USER: &str = r#"
try {
  (0, eval)(__USER_SOURCE__);
} catch (e) {
  __reportError(__fmtValue(e));
}
"#;

pub struct IsolateBackend {
    gateway: Arc<Gateway>,
    network: Arc<NetworkPolicy>,
}

impl IsolateBackend {
    pub fn new(gateway: Arc<Gateway>, network: Arc<NetworkPolicy>) -> Self {
        Self { gateway, network }
    }

    pub async fn execute(
        &self,
        source: &str,
        limits: &ResourceLimits,
        context: &ExecutionContext,
        injection: &SandboxInjection,
    ) -> ExecutionOutcome {
        let gateway = self.gateway.clone();
        let network = self.network.clone();
        let handle = Handle::current();
        let source = source.to_string();
        let limits = *limits;
        let context = context.clone();
        let injection = injection.clone();

        let joined = tokio::task::spawn_blocking(move || {
            run_isolate(
                gateway, network, handle, &source, &limits, &context, &injection,
            )
        })
        .await;

        match joined {
            Ok(outcome) => outcome,
            Err(e) => ExecutionOutcome::failure(ConduitErr::Internal(format!(
                "isolate worker failed: {e}"
            ))),
        }
    }
}

fn run_isolate(
    gateway: Arc<Gateway>,
    network: Arc<NetworkPolicy>,
    handle: Handle,
    source: &str,
    limits: &ResourceLimits,
    context: &ExecutionContext,
    injection: &SandboxInjection,
) -> ExecutionOutcome {
    let runtime = match rquickjs::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            return ExecutionOutcome::failure(ConduitErr::Internal(format!(
                "could not create isolate runtime: {e}"
            )));
        }
    };
    let memory_limit_bytes = (limits.memory_mb as usize).saturating_mul(1024 * 1024);
    runtime.set_memory_limit(memory_limit_bytes);

    let deadline = Instant::now() + Duration::from_millis(limits.timeout_ms);
    // Set by the output hooks once a ceiling is crossed; the interrupt
    // handler then tears the synchronous phase down.
    let abort = Arc::new(AtomicBool::new(false));
    {
        let abort = abort.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || {
            abort.load(Ordering::Relaxed) || Instant::now() >= deadline
        })));
    }

    let ctx = match rquickjs::Context::full(&runtime) {
        Ok(ctx) => ctx,
        Err(e) => {
            return ExecutionOutcome::failure(ConduitErr::Internal(format!(
                "could not create isolate context: {e}"
            )));
        }
    };

    let buffer = Arc::new(StdMutex::new(OutputBuffer::new(limits)));
    let user_error: Arc<StdMutex<Option<String>>> = Arc::new(StdMutex::new(None));

    let program = format!(
        "{ISOLATE_PRELUDE}\n{}\n{}",
        injection.sdk_source,
        ISOLATE_RUN_USER.replace(
            "__USER_SOURCE__",
            &serde_json::to_string(source).unwrap_or_else(|_| "\"\"".to_string())
        )
    );

    let eval_result: Result<(), rquickjs::Error> = ctx.with(|ctx| {
        let globals = ctx.globals();

        {
            let buffer = buffer.clone();
            let abort = abort.clone();
            globals.set(
                "__print",
                rquickjs::Function::new(ctx.clone(), move |text: String| {
                    let breached = buffer
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push_stdout(text.as_bytes());
                    if breached.is_some() {
                        abort.store(true, Ordering::Relaxed);
                    }
                })?,
            )?;
        }
        {
            let buffer = buffer.clone();
            let abort = abort.clone();
            globals.set(
                "__printErr",
                rquickjs::Function::new(ctx.clone(), move |text: String| {
                    let breached = buffer
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push_stderr(text.as_bytes());
                    if breached.is_some() {
                        abort.store(true, Ordering::Relaxed);
                    }
                })?,
            )?;
        }
        {
            let user_error = user_error.clone();
            globals.set(
                "__reportError",
                rquickjs::Function::new(ctx.clone(), move |message: String| {
                    *user_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(message);
                })?,
            )?;
        }
        {
            let gateway = gateway.clone();
            let network = network.clone();
            let context = context.derived_for_session(
                injection.session_token.clone(),
                context.allowed_tools.clone(),
            );
            let session_token = injection.session_token.clone();
            globals.set(
                "__callTool",
                rquickjs::Function::new(ctx.clone(), move |name: String, args_json: String| {
                    call_tool_bridge(
                        &gateway,
                        &network,
                        &handle,
                        &context,
                        &session_token,
                        &name,
                        &args_json,
                    )
                })?,
            )?;
        }

        ctx.eval::<(), _>(program)
    });

    // Asynchronous tail: drain pending jobs until the deadline.
    let mut tail_timed_out = false;
    if eval_result.is_ok() {
        while runtime.is_job_pending() {
            if Instant::now() >= deadline || abort.load(Ordering::Relaxed) {
                tail_timed_out = Instant::now() >= deadline;
                break;
            }
            if runtime.execute_pending_job().is_err() {
                debug!("pending isolate job raised; continuing drain");
            }
        }
    }

    // The host-function closures still hold clones of the Arc; swap the
    // contents out from under the lock instead of unwrapping it.
    let buffer = {
        let mut guard = buffer.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *guard, OutputBuffer::new(limits))
    };

    let output_breach = buffer.breach();
    let timed_out = Instant::now() >= deadline || tail_timed_out;

    let engine_failure = eval_result.err().map(|e| e.to_string());
    let oom = engine_failure
        .as_deref()
        .is_some_and(|msg| msg.to_ascii_lowercase().contains("out of memory"));

    let mut breach = output_breach;
    if oom {
        breach = LimitKind::worst(Some(LimitKind::Memory), breach);
    }
    if breach.is_none() && timed_out && engine_failure.is_some() {
        breach = Some(LimitKind::Timeout);
    }
    if breach.is_none() && tail_timed_out {
        breach = Some(LimitKind::Timeout);
    }

    let (stdout, mut stderr) = buffer.into_strings();
    let reported = user_error
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .take();

    let (exit_code, error) = match breach {
        Some(kind) => (-1, Some(kind.into_error(limits))),
        None => match (&reported, engine_failure) {
            (Some(message), _) => {
                if !stderr.ends_with('\n') && !stderr.is_empty() {
                    stderr.push('\n');
                }
                stderr.push_str(message);
                stderr.push('\n');
                (1, None)
            }
            (None, Some(engine_message)) => (
                -1,
                Some(ConduitErr::Internal(format!(
                    "isolate evaluation failed: {engine_message}"
                ))),
            ),
            (None, None) => (0, None),
        },
    };

    ExecutionOutcome {
        stdout,
        stderr,
        exit_code,
        error,
    }
}

/// Synchronous host bridge for the isolate SDK: rate-limited, allowlisted
/// via the derived session context, returning `{result}` / `{error}` as a
/// JSON string the generated SDK unwraps.
fn call_tool_bridge(
    gateway: &Arc<Gateway>,
    network: &Arc<NetworkPolicy>,
    handle: &Handle,
    context: &ExecutionContext,
    session_token: &str,
    name: &str,
    args_json: &str,
) -> String {
    if !network.check_rate_limit(session_token) {
        let err = ConduitErr::RateLimited;
        return json!({"error": {"code": err.code(), "message": err.to_string()}}).to_string();
    }

    let arguments = match serde_json::from_str::<serde_json::Value>(args_json) {
        Ok(value) => Some(value),
        Err(e) => {
            let err = ConduitErr::InvalidParams(format!("tool arguments were not JSON: {e}"));
            return json!({"error": {"code": err.code(), "message": err.to_string()}})
                .to_string();
        }
    };

    let result = handle.block_on(gateway.call_tool(name, arguments, context));
    match result {
        Ok(ToolCallOutput::Value(value)) => json!({"result": value}).to_string(),
        Ok(ToolCallOutput::Builtin { .. }) => {
            let err = ConduitErr::Forbidden(
                "Session tokens are restricted to tool discovery and tool calls".to_string(),
            );
            json!({"error": {"code": err.code(), "message": err.to_string()}}).to_string()
        }
        Err(err) => {
            json!({"error": {"code": err.code(), "message": err.to_string()}}).to_string()
        }
    }
}
