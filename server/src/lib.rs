//! Host process wiring: build the component graph from a [`Config`], start
//! the reverse IPC endpoint and background tasks, then drive the configured
//! agent-facing transport until shutdown.
#![deny(clippy::print_stdout, clippy::print_stderr)]

mod ops;

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::io::{self};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::error;
use tracing::info;

use conduit_core::Gateway;
use conduit_core::PeerInfo;
use conduit_core::RequestPipeline;
use conduit_core::ReverseIpcEndpoint;
use conduit_core::SessionStore;
use conduit_core::auth::AuthBroker;
use conduit_core::config::Config;
use conduit_core::config::TransportKind;
use conduit_core::gate::ConcurrencyGate;
use conduit_core::network_policy::NetworkPolicy;
use conduit_core::reverse_ipc::serve_connection;
use conduit_core::sandbox::IsolateBackend;
use conduit_core::sandbox::PythonPoolBackend;
use conduit_core::sandbox::SubprocessBackend;
use conduit_core::schema_cache::SchemaCache;
use conduit_core::supervisor::ExecutionSupervisor;

/// Size of the bounded channels between the transport tasks. Plenty for a
/// line-oriented control channel.
const CHANNEL_CAPACITY: usize = 128;

const SESSION_PURGE_INTERVAL: Duration = Duration::from_secs(60);

pub async fn run_main(config: Config) -> anyhow::Result<()> {
    let prometheus = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("could not install metrics recorder: {e}"))?;

    let shutdown = notify_on_shutdown_signal();

    let network = Arc::new(NetworkPolicy::new(
        conduit_core::network_policy::DEFAULT_RATE_LIMIT_MAX_REQUESTS,
        conduit_core::network_policy::DEFAULT_RATE_LIMIT_WINDOW,
        config.allow_private_network,
    ));
    let auth = Arc::new(AuthBroker::new());
    let schema_cache = Arc::new(SchemaCache::default());
    let sessions = Arc::new(SessionStore::default());
    let gateway = Arc::new(Gateway::from_configs(
        config.upstreams.clone(),
        auth,
        network.clone(),
        schema_cache,
    )?);

    // Bind before building the supervisor: backends need the address.
    let ipc = ReverseIpcEndpoint::bind_loopback().await?;
    let ipc_addr = ipc.address().to_string();

    let isolate = config
        .backend
        .isolate_enabled
        .then(|| IsolateBackend::new(gateway.clone(), network.clone()));
    let subprocess = SubprocessBackend::new(
        config.backend.runtime_command.clone(),
        config.backend.max_subprocesses,
        shutdown.clone(),
    );
    let python = PythonPoolBackend::new(
        config.backend.python_command.clone(),
        config.backend.python_pool_size,
        shutdown.clone(),
    );

    let supervisor = Arc::new(ExecutionSupervisor::new(
        gateway.clone(),
        sessions.clone(),
        config.resource_limits,
        Some(ipc_addr),
        isolate,
        subprocess,
        python,
    ));
    let gate = Arc::new(ConcurrencyGate::new(config.max_concurrent, config.queue_size));
    let pipeline = Arc::new(RequestPipeline::new(
        gateway.clone(),
        supervisor,
        sessions.clone(),
        network,
        gate,
        config.ipc_bearer_token.clone(),
        config.strict_validation,
    ));

    tokio::spawn(ipc.serve(pipeline.clone(), shutdown.clone()));

    tokio::spawn({
        let sessions = sessions.clone();
        let shutdown = shutdown.clone();
        async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(SESSION_PURGE_INTERVAL) => {
                        sessions.purge_expired().await;
                    }
                    _ = shutdown.notified() => break,
                }
            }
        }
    });

    if let Some(ops_port) = config.ops_port {
        ops::spawn(ops_port, gateway.clone(), prometheus)?;
    }

    match config.transport {
        TransportKind::Stdio => run_stdio(pipeline, shutdown.clone()).await,
        TransportKind::LocalSocket => {
            run_local_socket(pipeline, config.port, shutdown.clone()).await?;
        }
    }

    // Every upstream child dies with us; sandbox children were already
    // interrupted through the shutdown notify.
    gateway.shutdown().await;
    info!("shutdown complete");
    Ok(())
}

/// A Notify fulfilled on SIGINT (and SIGTERM on unix).
fn notify_on_shutdown_signal() -> Arc<Notify> {
    let notify = Arc::new(Notify::new());

    tokio::spawn({
        let notify = Arc::clone(&notify);
        async move {
            shutdown_signal().await;
            debug!("shutdown signal received");
            notify.notify_waiters();
        }
    });

    notify
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::SignalKind;
    use tokio::signal::unix::signal;
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(_) => {
            tokio::signal::ctrl_c().await.ok();
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
}

/// Line-delimited JSON-RPC over this process's own stdio. Reader and writer
/// run as dedicated tasks; requests are processed in submission order so
/// responses come back in order on the one connection.
async fn run_stdio(pipeline: Arc<RequestPipeline>, shutdown: Arc<Notify>) {
    let (incoming_tx, mut incoming_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);

    let stdin_reader = tokio::spawn(async move {
        let mut lines = BufReader::new(io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if incoming_tx.send(line).await.is_err() {
                break;
            }
        }
        debug!("stdin reader finished (EOF)");
    });

    let stdout_writer = tokio::spawn(async move {
        let mut stdout = io::stdout();
        while let Some(payload) = outgoing_rx.recv().await {
            if stdout.write_all(payload.as_bytes()).await.is_err() {
                break;
            }
            if stdout.write_all(b"\n").await.is_err() {
                break;
            }
            if stdout.flush().await.is_err() {
                break;
            }
        }
    });

    let peer = PeerInfo::new("stdio");
    loop {
        let line = tokio::select! {
            line = incoming_rx.recv() => match line {
                Some(line) => line,
                None => break,
            },
            _ = shutdown.notified() => break,
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(response) = pipeline.handle_line(trimmed, &peer).await {
            match serde_json::to_string(&response) {
                Ok(payload) => {
                    if outgoing_tx.send(payload).await.is_err() {
                        break;
                    }
                }
                Err(e) => error!("could not serialize response: {e}"),
            }
        }
    }

    drop(outgoing_tx);
    stdin_reader.abort();
    let _ = stdout_writer.await;
}

/// Loopback TCP with the same framing as stdio; one task per connection.
async fn run_local_socket(
    pipeline: Arc<RequestPipeline>,
    port: u16,
    shutdown: Arc<Notify>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    info!("listening on 127.0.0.1:{port}");
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = accepted?;
                let pipeline = pipeline.clone();
                tokio::spawn(async move {
                    let (reader, writer) = stream.into_split();
                    serve_connection(reader, writer, peer_addr.to_string(), pipeline).await;
                });
            }
            _ = shutdown.notified() => break,
        }
    }
    Ok(())
}
