use std::path::PathBuf;

use clap::Parser;
use clap::ValueEnum;
use tracing_subscriber::EnvFilter;

use conduit_core::config::Config;
use conduit_core::config::TransportKind;
use conduit_server::run_main;

/// Secure code-execution substrate for tool-calling agents.
#[derive(Debug, Parser)]
#[clap(author, version)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Agent-facing transport; overrides the config file.
    #[arg(long, value_enum)]
    transport: Option<TransportArg>,

    /// Port for the local-socket transport; overrides the config file.
    #[arg(long)]
    port: Option<u16>,

    /// Port for the health/metrics listener; overrides the config file.
    #[arg(long)]
    ops_port: Option<u16>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TransportArg {
    Stdio,
    LocalSocket,
}

fn main() -> anyhow::Result<()> {
    // Logs go to stderr: on the stdio transport, stdout is the wire.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(transport) = cli.transport {
        config.transport = match transport {
            TransportArg::Stdio => TransportKind::Stdio,
            TransportArg::LocalSocket => TransportKind::LocalSocket,
        };
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(ops_port) = cli.ops_port {
        config.ops_port = Some(ops_port);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run_main(config))
}
