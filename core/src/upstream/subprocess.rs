//! Long-lived subprocess upstream: framed JSON-RPC over the child's stdio.
//!
//! The child is spawned lazily on first use and the connection is reused for
//! the connector's lifetime. Requests are multiplexed by id through a map of
//! one-shot senders; a reader task routes each incoming line to its waiter.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde_json::Value;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::ChildStdin;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::warn;

use conduit_protocol::JsonRpcRequest;
use conduit_protocol::JsonRpcResponse;
use conduit_protocol::RequestId;

use crate::error::ConduitErr;
use crate::error::Result;
use crate::upstream::response_into_result;

type PendingMap = Arc<Mutex<HashMap<i64, oneshot::Sender<JsonRpcResponse>>>>;

struct Connection {
    stdin: ChildStdin,
    pending: PendingMap,
    child: Child,
}

pub(crate) struct SubprocessTransport {
    argv: Vec<String>,
    env: HashMap<String, String>,
    next_id: AtomicI64,
    connection: Mutex<Option<Connection>>,
}

impl SubprocessTransport {
    pub(crate) fn new(argv: Vec<String>, env: HashMap<String, String>) -> Self {
        Self {
            argv,
            env,
            next_id: AtomicI64::new(1),
            connection: Mutex::new(None),
        }
    }

    pub(crate) async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(RequestId::Integer(id), method, params);
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');

        let rx = {
            let mut connection = self.connection.lock().await;
            if connection.is_none() {
                *connection = Some(self.connect().await?);
            }
            let Some(conn) = connection.as_mut() else {
                return Err(ConduitErr::Transport(
                    "subprocess connection unavailable".to_string(),
                ));
            };

            let (tx, rx) = oneshot::channel();
            conn.pending.lock().await.insert(id, tx);

            if let Err(e) = conn.stdin.write_all(line.as_bytes()).await {
                conn.pending.lock().await.remove(&id);
                // The child is gone; drop the connection so the next call
                // respawns it.
                *connection = None;
                return Err(ConduitErr::Transport(format!(
                    "failed to write to subprocess: {e}"
                )));
            }
            rx
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response_into_result(response),
            Ok(Err(_)) => Err(ConduitErr::Transport(
                "subprocess closed the connection".to_string(),
            )),
            Err(_) => {
                self.abandon_request(id).await;
                Err(ConduitErr::UpstreamTimeout(format!(
                    "no response from subprocess within {} ms",
                    timeout.as_millis()
                )))
            }
        }
    }

    pub(crate) async fn shutdown(&self) {
        let mut connection = self.connection.lock().await;
        if let Some(mut conn) = connection.take() {
            if let Err(e) = conn.child.start_kill() {
                warn!("failed to kill subprocess upstream: {e}");
            }
        }
    }

    async fn abandon_request(&self, id: i64) {
        let connection = self.connection.lock().await;
        if let Some(conn) = connection.as_ref() {
            conn.pending.lock().await.remove(&id);
        }
    }

    async fn connect(&self) -> Result<Connection> {
        let Some((program, args)) = self.argv.split_first() else {
            return Err(ConduitErr::Internal(
                "subprocess upstream has an empty command".to_string(),
            ));
        };
        let mut child = Command::new(program)
            .args(args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ConduitErr::Transport(format!("failed to spawn {program}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ConduitErr::Transport("subprocess stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ConduitErr::Transport("subprocess stdout unavailable".to_string()))?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let reader_pending = pending.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let response = match serde_json::from_str::<JsonRpcResponse>(&line) {
                            Ok(response) => response,
                            Err(e) => {
                                debug!("discarding unparseable upstream line: {e}");
                                continue;
                            }
                        };
                        let Some(RequestId::Integer(id)) = response.id else {
                            debug!("discarding upstream response without integer id");
                            continue;
                        };
                        let waiter = reader_pending.lock().await.remove(&id);
                        match waiter {
                            Some(tx) => {
                                let _ = tx.send(response);
                            }
                            None => debug!("no waiter for upstream response id {id}"),
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
            // EOF: every in-flight request observes a closed channel.
            reader_pending.lock().await.clear();
        });

        Ok(Connection {
            stdin,
            pending,
            child,
        })
    }
}
