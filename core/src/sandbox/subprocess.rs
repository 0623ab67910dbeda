//! Process-based sandbox for the primary scripting flavor.
//!
//! Spawns the configured JS runtime with its V8 heap capped at `memory_mb`
//! and network permissions restricted to exactly the reverse-IPC address.
//! The program (bootstrap + SDK + user source) is fed over stdin; output is
//! captured under the byte/line caps and RSS is probed every couple of
//! seconds. A bounded pool rejects with ServerBusy on saturation.

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

/// Lazy line-framed JSON-RPC client over the reverse-IPC socket. The
/// connection is ref'd only while calls are in flight so a drained event
/// loop lets the process exit naturally.
const TS_BOOTSTRAP: &str = r#"// conduit sandbox bootstrap (generated)
const __IPC_ADDR = "__CONDUIT_IPC_ADDR__";
const __SESSION_TOKEN = "__CONDUIT_SESSION_TOKEN__";
let __conn = null;
let __readBuffer = "";
const __pending = new Map();
let __nextId = 1;

function __updateRef() {
  if (!__conn) return;
  try {
    if (__pending.size === 0) __conn.unref();
    else __conn.ref();
  } catch (_) {}
}

async function __connect() {
  if (__conn) return;
  const sep = __IPC_ADDR.lastIndexOf(":");
  const hostname = __IPC_ADDR.slice(0, sep);
  const port = Number(__IPC_ADDR.slice(sep + 1));
  __conn = await Deno.connect({ hostname, port });
  __startReader();
  __updateRef();
}

function __startReader() {
  (async () => {
    const decoder = new TextDecoder();
    const chunk = new Uint8Array(65536);
    while (true) {
      let n;
      try { n = await __conn.read(chunk); } catch (_) { break; }
      if (n === null) break;
      __readBuffer += decoder.decode(chunk.subarray(0, n), { stream: true });
      let newline;
      while ((newline = __readBuffer.indexOf("\n")) >= 0) {
        const line = __readBuffer.slice(0, newline);
        __readBuffer = __readBuffer.slice(newline + 1);
        if (!line.trim()) continue;
        let message;
        try { message = JSON.parse(line); } catch (_) { continue; }
        const waiter = __pending.get(message.id);
        if (waiter) {
          __pending.delete(message.id);
          __updateRef();
          waiter(message);
        }
      }
    }
    for (const [id, waiter] of [...__pending]) {
      __pending.delete(id);
      waiter({ error: { code: -32603, message: "IPC connection closed" } });
    }
    __updateRef();
  })();
}

globalThis.__internalCallTool = async (name, args) => {
  await __connect();
  const id = __nextId++;
  const request = {
    jsonrpc: "2.0",
    id,
    method: "mcp.callTool",
    params: { name, arguments: args ?? {} },
    auth: { bearerToken: __SESSION_TOKEN },
  };
  const reply = new Promise((resolve) => {
    __pending.set(id, resolve);
    __updateRef();
  });
  const payload = new TextEncoder().encode(JSON.stringify(request) + "\n");
  let written = 0;
  while (written < payload.length) {
    written += await __conn.write(payload.subarray(written));
  }
  const message = await reply;
  if (message.error) {
    const err = new Error(message.error.message);
    err.code = message.error.code;
    throw err;
  }
  return message.result;
};
"#;

pub struct SubprocessBackend {
    runtime_command: String,
    permits: Arc<Semaphore>,
    interrupt: Arc<Notify>,
}

impl SubprocessBackend {
    pub fn new(runtime_command: String, max_children: usize, interrupt: Arc<Notify>) -> Self {
        Self {
            runtime_command,
            permits: Arc::new(Semaphore::new(max_children.max(1))),
            interrupt,
        }
    }

    pub async fn execute(
        &self,
        source: &str,
        limits: &ResourceLimits,
        injection: &SandboxInjection,
    ) -> ExecutionOutcome {
        // Saturation is a fast-fail, not a queue; the concurrency gate is
        // the only place requests wait.
        let Ok(_permit) = self.permits.clone().try_acquire_owned() else {
            return ExecutionOutcome::failure(ConduitErr::ServerBusy(
                "subprocess sandbox pool is saturated".to_string(),
            ));
        };
        let Some(ipc_addr) = injection.ipc_addr.as_deref() else {
            return ExecutionOutcome::failure(ConduitErr::Internal(
                "subprocess backend requires a reverse-IPC endpoint".to_string(),
            ));
        };

        let program = format!(
            "{}\n{}\n{}",
            bootstrap(ipc_addr, &injection.session_token),
            injection.sdk_source,
            source
        );

        let spawned = Command::new(&self.runtime_command)
            .arg("run")
            .arg("--quiet")
            .arg("--no-prompt")
            .arg(format!("--allow-net={ipc_addr}"))
            .arg(format!("--v8-flags=--max-old-space-size={}", limits.memory_mb))
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                return ExecutionOutcome::failure(ConduitErr::Internal(format!(
                    "could not spawn sandbox runtime '{}': {e}",
                    self.runtime_command
                )));
            }
        };

        supervise_child(child, &program, limits, &self.interrupt).await
    }
}

fn bootstrap(ipc_addr: &str, session_token: &str) -> String {
    TS_BOOTSTRAP
        .replace("__CONDUIT_IPC_ADDR__", ipc_addr)
        .replace("__CONDUIT_SESSION_TOKEN__", session_token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn bootstrap_embeds_address_and_token() {
        let source = bootstrap("127.0.0.1:4000", "tok-123");
        assert!(source.contains(r#"const __IPC_ADDR = "127.0.0.1:4000";"#));
        assert!(source.contains(r#"const __SESSION_TOKEN = "tok-123";"#));
        assert!(source.contains("bearerToken: __SESSION_TOKEN"));
    }

    #[tokio::test]
    async fn saturated_pool_fast_fails_with_server_busy() {
        let backend = SubprocessBackend::new(
            "definitely-not-a-runtime".to_string(),
            1,
            Arc::new(Notify::new()),
        );
        // Hold the only permit so the execute below cannot take it.
        let permit = backend
            .permits
            .clone()
            .try_acquire_owned()
            .expect("permit");
        let injection = SandboxInjection {
            ipc_addr: Some("127.0.0.1:1".to_string()),
            session_token: "tok".to_string(),
            sdk_source: String::new(),
        };
        let outcome = backend
            .execute("console.log(1)", &ResourceLimits::default(), &injection)
            .await;
        let err = outcome.error.expect("must be busy");
        assert_eq!(err.code(), -32000);
        drop(permit);
    }

    #[tokio::test]
    async fn missing_ipc_address_is_refused() {
        let backend = SubprocessBackend::new(
            "definitely-not-a-runtime".to_string(),
            1,
            Arc::new(Notify::new()),
        );
        let injection = SandboxInjection {
            ipc_addr: None,
            session_token: "tok".to_string(),
            sdk_source: String::new(),
        };
        let outcome = backend
            .execute("console.log(1)", &ResourceLimits::default(), &injection)
            .await;
        let err = outcome.error.expect("must fail");
        assert_eq!(err.code(), -32603);
        assert!(err.to_string().contains("reverse-IPC"));
    }
}
