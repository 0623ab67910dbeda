//! Sandbox backends.
//!
//! A backend executes user source under hard resource limits and returns a
//! structured outcome; expected failure modes never raise into the caller.
//! When several limits fire near-simultaneously the precedence is
//! Memory > Output > Log > Timeout, and a same-chunk collision between the
//! byte and line ceilings resolves to the byte limit.

mod isolate;
mod python_pool;
mod rss;
mod subprocess;

pub use isolate::IsolateBackend;
pub use python_pool::PythonPoolBackend;
pub use subprocess::SubprocessBackend;

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tokio::sync::Notify;
use tokio::sync::mpsc;
use tracing::warn;

use conduit_protocol::ResourceLimits;

use crate::context::ExecutionContext;
use crate::error::ConduitErr;
use crate::sdk::SdkFlavor;

/// What the supervisor hands a backend besides the user source: where the
/// reverse-IPC endpoint lives, the capability token for this execution, and
/// the generated SDK source to evaluate before user code.
#[derive(Debug, Clone)]
pub struct SandboxInjection {
    pub ipc_addr: Option<String>,
    pub session_token: String,
    pub sdk_source: String,
}

#[derive(Debug)]
pub struct ExecutionOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub error: Option<ConduitErr>,
}

impl ExecutionOutcome {
    pub fn failure(error: ConduitErr) -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: -1,
            error: Some(error),
        }
    }
}

/// Which ceiling was breached. Ordered by severity for tie-breaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    Memory,
    Output,
    Log,
    Timeout,
}

impl LimitKind {
    fn severity(self) -> u8 {
        match self {
            LimitKind::Memory => 0,
            LimitKind::Output => 1,
            LimitKind::Log => 2,
            LimitKind::Timeout => 3,
        }
    }

    /// The more severe of two optional breaches.
    pub fn worst(a: Option<LimitKind>, b: Option<LimitKind>) -> Option<LimitKind> {
        match (a, b) {
            (Some(a), Some(b)) => Some(if a.severity() <= b.severity() { a } else { b }),
            (Some(a), None) => Some(a),
            (None, b) => b,
        }
    }

    pub fn into_error(self, limits: &ResourceLimits) -> ConduitErr {
        match self {
            LimitKind::Memory => ConduitErr::MemoryLimitExceeded(limits.memory_mb),
            LimitKind::Output => ConduitErr::OutputLimitExceeded(limits.max_output_bytes),
            LimitKind::Log => ConduitErr::LogLimitExceeded(limits.max_log_entries),
            LimitKind::Timeout => ConduitErr::RequestTimeout(limits.timeout_ms),
        }
    }
}

/// Capped capture of a sandbox's stdout/stderr. Counters keep running past
/// the caps so the breach kind is accurate, but storage never grows past
/// `max_output_bytes` across both streams combined.
#[derive(Debug)]
pub struct OutputBuffer {
    max_output_bytes: u64,
    max_log_entries: u64,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    total_bytes: u64,
    total_lines: u64,
    stored_bytes: u64,
    breach: Option<LimitKind>,
}

impl OutputBuffer {
    pub fn new(limits: &ResourceLimits) -> Self {
        Self {
            max_output_bytes: limits.max_output_bytes,
            max_log_entries: limits.max_log_entries,
            stdout: Vec::new(),
            stderr: Vec::new(),
            total_bytes: 0,
            total_lines: 0,
            stored_bytes: 0,
            breach: None,
        }
    }

    pub fn push_stdout(&mut self, chunk: &[u8]) -> Option<LimitKind> {
        self.push(false, chunk)
    }

    pub fn push_stderr(&mut self, chunk: &[u8]) -> Option<LimitKind> {
        self.push(true, chunk)
    }

    /// Returns the breach kind the first time a ceiling is crossed. Byte
    /// accounting runs before line accounting so that a chunk crossing both
    /// ceilings reports the output limit.
    fn push(&mut self, to_stderr: bool, chunk: &[u8]) -> Option<LimitKind> {
        let before = self.breach;
        for &byte in chunk {
            self.total_bytes += 1;
            if self.breach.is_none() && self.total_bytes > self.max_output_bytes {
                self.breach = Some(LimitKind::Output);
            }
            if byte == b'\n' {
                self.total_lines += 1;
                if self.breach.is_none() && self.total_lines > self.max_log_entries {
                    self.breach = Some(LimitKind::Log);
                }
            }
            if self.stored_bytes < self.max_output_bytes {
                self.stored_bytes += 1;
                if to_stderr {
                    self.stderr.push(byte);
                } else {
                    self.stdout.push(byte);
                }
            }
        }
        if before.is_none() { self.breach } else { None }
    }

    pub fn breach(&self) -> Option<LimitKind> {
        self.breach
    }

    pub fn into_strings(self) -> (String, String) {
        (
            String::from_utf8_lossy(&self.stdout).to_string(),
            String::from_utf8_lossy(&self.stderr).to_string(),
        )
    }
}

/// The three sandbox implementations behind one narrow contract.
pub enum SandboxBackend {
    Isolate(IsolateBackend),
    Subprocess(SubprocessBackend),
    PythonPool(PythonPoolBackend),
}

impl SandboxBackend {
    pub async fn execute(
        &self,
        source: &str,
        limits: &ResourceLimits,
        context: &ExecutionContext,
        injection: &SandboxInjection,
    ) -> ExecutionOutcome {
        match self {
            SandboxBackend::Isolate(backend) => {
                backend.execute(source, limits, context, injection).await
            }
            SandboxBackend::Subprocess(backend) => {
                backend.execute(source, limits, injection).await
            }
            SandboxBackend::PythonPool(backend) => {
                backend.execute(source, limits, injection).await
            }
        }
    }

    /// The isolate talks to the gateway in-process; the others can only
    /// reach tools through the reverse-IPC endpoint.
    pub fn requires_reverse_ipc(&self) -> bool {
        !matches!(self, SandboxBackend::Isolate(_))
    }

    pub fn flavor(&self) -> SdkFlavor {
        match self {
            SandboxBackend::Isolate(_) => SdkFlavor::Isolate,
            SandboxBackend::Subprocess(_) => SdkFlavor::TypeScript,
            SandboxBackend::PythonPool(_) => SdkFlavor::Python,
        }
    }
}

/// How often the resident-set probe runs for process-based backends.
const RSS_PROBE_INTERVAL: Duration = Duration::from_secs(2);

/// Drive one child process to completion under the limits: feed the program
/// on stdin, capture capped output, poll RSS, and kill on any breach. Used
/// by both process-based backends.
pub(crate) async fn supervise_child(
    mut child: Child,
    program: &str,
    limits: &ResourceLimits,
    interrupt: &Notify,
) -> ExecutionOutcome {
    let Some(mut stdin) = child.stdin.take() else {
        return ExecutionOutcome::failure(ConduitErr::Internal(
            "sandbox stdin was unexpectedly not available".to_string(),
        ));
    };
    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        return ExecutionOutcome::failure(ConduitErr::Internal(
            "sandbox stdout/stderr were unexpectedly not available".to_string(),
        ));
    };

    if let Err(e) = stdin.write_all(program.as_bytes()).await {
        let _ = child.start_kill();
        return ExecutionOutcome::failure(ConduitErr::Internal(format!(
            "could not write program to sandbox: {e}"
        )));
    }
    drop(stdin);

    let buffer = Arc::new(StdMutex::new(OutputBuffer::new(limits)));
    let (breach_tx, mut breach_rx) = mpsc::channel::<LimitKind>(4);

    let stdout_task = tokio::spawn(pump_stream(
        stdout,
        buffer.clone(),
        breach_tx.clone(),
        false,
    ));
    let stderr_task = tokio::spawn(pump_stream(stderr, buffer.clone(), breach_tx.clone(), true));

    let rss_task = child.id().map(|pid| {
        let breach_tx = breach_tx.clone();
        let memory_limit_bytes = limits.memory_mb * 1024 * 1024;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(RSS_PROBE_INTERVAL).await;
                match rss::probe(pid).await {
                    Ok(Some(rss_bytes)) if rss_bytes > memory_limit_bytes => {
                        let _ = breach_tx.send(LimitKind::Memory).await;
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("rss probe failed for pid {pid}: {e}");
                        break;
                    }
                }
            }
        })
    });
    drop(breach_tx);

    let timeout = Duration::from_millis(limits.timeout_ms);
    let mut breach: Option<LimitKind> = None;
    let mut interrupted = false;
    let exit_code = tokio::select! {
        waited = tokio::time::timeout(timeout, child.wait()) => match waited {
            Ok(Ok(status)) => status.code().unwrap_or(-1),
            Ok(Err(e)) => {
                let _ = child.start_kill();
                return ExecutionOutcome::failure(ConduitErr::Internal(format!(
                    "could not wait for sandbox: {e}"
                )));
            }
            Err(_) => {
                breach = Some(LimitKind::Timeout);
                let _ = child.start_kill();
                let _ = child.wait().await;
                -1
            }
        },
        Some(kind) = breach_rx.recv() => {
            breach = Some(kind);
            let _ = child.start_kill();
            let _ = child.wait().await;
            -1
        }
        _ = interrupt.notified() => {
            interrupted = true;
            let _ = child.start_kill();
            let _ = child.wait().await;
            -1
        }
    };

    if let Some(task) = rss_task {
        task.abort();
    }
    let _ = stdout_task.await;
    let _ = stderr_task.await;

    let buffer = {
        let mut guard = buffer.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *guard, OutputBuffer::new(limits))
    };

    let breach = LimitKind::worst(breach, buffer.breach());
    let (stdout_text, stderr_text) = buffer.into_strings();

    // V8 aborts on its own heap flag faster than the RSS probe can notice.
    let breach = if exit_code != 0
        && breach.is_none()
        && stderr_text.to_ascii_lowercase().contains("out of memory")
    {
        Some(LimitKind::Memory)
    } else {
        breach
    };

    let error = match breach {
        Some(kind) => Some(kind.into_error(limits)),
        None if interrupted => Some(ConduitErr::Internal(
            "execution interrupted by shutdown".to_string(),
        )),
        None => None,
    };

    ExecutionOutcome {
        stdout: stdout_text,
        stderr: stderr_text,
        exit_code,
        error,
    }
}

async fn pump_stream<R: AsyncRead + Unpin>(
    mut reader: R,
    buffer: Arc<StdMutex<OutputBuffer>>,
    breach_tx: mpsc::Sender<LimitKind>,
    to_stderr: bool,
) {
    let mut chunk = [0u8; 8192];
    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let newly_breached = {
            let mut buffer = buffer.lock().unwrap_or_else(|e| e.into_inner());
            if to_stderr {
                buffer.push_stderr(&chunk[..n])
            } else {
                buffer.push_stdout(&chunk[..n])
            }
        };
        if let Some(kind) = newly_breached {
            let _ = breach_tx.send(kind).await;
        }
        // Keep draining to EOF so the child never blocks on a full pipe.
    }
}
