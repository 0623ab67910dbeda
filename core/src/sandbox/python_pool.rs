//! Worker pool for the secondary scripting flavor.
//!
//! Workers are single-use: a fresh interpreter is spawned per execution and
//! discarded afterwards, so no state survives between runs. The pool is
//! bounded with a FIFO waiting list; total in-flight work is already capped
//! by the concurrency gate above us.

use std::process::Stdio;
use std::sync::Arc;

use tokio::process::Command;
use tokio::sync::Notify;
use tokio::sync::Semaphore;

use conduit_protocol::ResourceLimits;

use crate::error::ConduitErr;
use crate::sandbox::ExecutionOutcome;
use crate::sandbox::SandboxInjection;
use crate::sandbox::supervise_child;

/// Synchronous line-framed JSON-RPC client over the reverse-IPC socket.
const PYTHON_BOOTSTRAP: &str = r#"# conduit sandbox bootstrap (generated)
import json as _json
import socket as _socket

_IPC_ADDR = "__CONDUIT_IPC_ADDR__"
_SESSION_TOKEN = "__CONDUIT_SESSION_TOKEN__"
_ipc_state = {"sock": None, "file": None, "next_id": 1}


def _ipc_connect():
    if _ipc_state["sock"] is None:
        host, _, port = _IPC_ADDR.rpartition(":")
        sock = _socket.create_connection((host, int(port)))
        _ipc_state["sock"] = sock
        _ipc_state["file"] = sock.makefile("rwb")


def __internal_call_tool(name, args):
    _ipc_connect()
    req_id = _ipc_state["next_id"]
    _ipc_state["next_id"] += 1
    request = {
        "jsonrpc": "2.0",
        "id": req_id,
        "method": "mcp.callTool",
        "params": {"name": name, "arguments": args or {}},
        "auth": {"bearerToken": _SESSION_TOKEN},
    }
    stream = _ipc_state["file"]
    stream.write((_json.dumps(request) + "\n").encode("utf-8"))
    stream.flush()
    while True:
        line = stream.readline()
        if not line:
            raise RuntimeError("IPC connection closed")
        try:
            message = _json.loads(line)
        except ValueError:
            continue
        if message.get("id") != req_id:
            continue
        error = message.get("error")
        if error is not None:
            raise RuntimeError(error.get("message", "tool call failed"))
        return message.get("result")
"#;

pub struct PythonPoolBackend {
    python_command: String,
    permits: Arc<Semaphore>,
    interrupt: Arc<Notify>,
}

impl PythonPoolBackend {
    pub fn new(python_command: String, pool_size: usize, interrupt: Arc<Notify>) -> Self {
        Self {
            python_command,
            permits: Arc::new(Semaphore::new(pool_size.max(1))),
            interrupt,
        }
    }

    pub async fn execute(
        &self,
        source: &str,
        limits: &ResourceLimits,
        injection: &SandboxInjection,
    ) -> ExecutionOutcome {
        // FIFO wait for a worker slot; tokio semaphores are fair.
        let _permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return ExecutionOutcome::failure(ConduitErr::Internal(
                    "python worker pool is closed".to_string(),
                ));
            }
        };
        let Some(ipc_addr) = injection.ipc_addr.as_deref() else {
            return ExecutionOutcome::failure(ConduitErr::Internal(
                "python backend requires a reverse-IPC endpoint".to_string(),
            ));
        };

        let program = format!(
            "{}\n{}\n{}",
            bootstrap(ipc_addr, &injection.session_token),
            injection.sdk_source,
            source
        );

        // -I: isolated mode (no user site, no env hooks); -u: unbuffered so
        // the caps see output as it happens; "-": program on stdin.
        let spawned = Command::new(&self.python_command)
            .args(["-I", "-u", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                return ExecutionOutcome::failure(ConduitErr::Internal(format!(
                    "could not spawn python worker '{}': {e}",
                    self.python_command
                )));
            }
        };

        supervise_child(child, &program, limits, &self.interrupt).await
    }
}

fn bootstrap(ipc_addr: &str, session_token: &str) -> String {
    PYTHON_BOOTSTRAP
        .replace("__CONDUIT_IPC_ADDR__", ipc_addr)
        .replace("__CONDUIT_SESSION_TOKEN__", session_token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn python_available() -> bool {
        std::process::Command::new("python3")
            .arg("--version")
            .output()
            .is_ok()
    }

    fn injection() -> SandboxInjection {
        SandboxInjection {
            ipc_addr: Some("127.0.0.1:1".to_string()),
            session_token: "tok".to_string(),
            sdk_source: String::new(),
        }
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        if !python_available() {
            eprintln!("python3 not available; skipping");
            return;
        }
        let backend =
            PythonPoolBackend::new("python3".to_string(), 2, Arc::new(Notify::new()));
        let outcome = backend
            .execute("print('hello from python')", &ResourceLimits::default(), &injection())
            .await;
        assert!(outcome.error.is_none(), "{:?}", outcome.error);
        assert_eq!(outcome.exit_code, 0);
        assert!(outcome.stdout.contains("hello from python"));
    }

    #[tokio::test]
    async fn user_exceptions_surface_on_stderr() {
        if !python_available() {
            eprintln!("python3 not available; skipping");
            return;
        }
        let backend =
            PythonPoolBackend::new("python3".to_string(), 2, Arc::new(Notify::new()));
        let outcome = backend
            .execute("raise RuntimeError('boom')", &ResourceLimits::default(), &injection())
            .await;
        assert!(outcome.error.is_none());
        assert!(outcome.exit_code != 0);
        assert!(outcome.stderr.contains("boom"));
    }

    #[tokio::test]
    async fn infinite_loop_times_out() {
        if !python_available() {
            eprintln!("python3 not available; skipping");
            return;
        }
        let backend =
            PythonPoolBackend::new("python3".to_string(), 2, Arc::new(Notify::new()));
        let limits = ResourceLimits {
            timeout_ms: 300,
            ..ResourceLimits::default()
        };
        let outcome = backend
            .execute("while True:\n    pass", &limits, &injection())
            .await;
        let err = outcome.error.expect("must time out");
        assert_eq!(err.code(), -32008);
    }

    #[tokio::test]
    async fn output_limit_truncates_and_errors() {
        if !python_available() {
            eprintln!("python3 not available; skipping");
            return;
        }
        let backend =
            PythonPoolBackend::new("python3".to_string(), 2, Arc::new(Notify::new()));
        let limits = ResourceLimits {
            timeout_ms: 10_000,
            max_output_bytes: 100,
            max_log_entries: 10_000,
            ..ResourceLimits::default()
        };
        let outcome = backend
            .execute("print('A' * 2000)", &limits, &injection())
            .await;
        let err = outcome.error.expect("must hit the output limit");
        assert_eq!(err.code(), -32013);
        assert!(outcome.stdout.len() <= 100);
    }

    #[test]
    fn bootstrap_embeds_address_and_token() {
        let source = bootstrap("127.0.0.1:4000", "tok-123");
        assert!(source.contains(r#"_IPC_ADDR = "127.0.0.1:4000""#));
        assert!(source.contains(r#"_SESSION_TOKEN = "tok-123""#));
    }
}
