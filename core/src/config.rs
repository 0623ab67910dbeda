//! Server configuration: a TOML file merged with caller-supplied overrides.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use conduit_protocol::ResourceLimits;
use conduit_protocol::ResourceLimitsOverride;

pub const DEFAULT_MAX_CONCURRENT: usize = 10;
pub const DEFAULT_QUEUE_SIZE: usize = 100;
pub const DEFAULT_MAX_SUBPROCESSES: usize = 10;
pub const DEFAULT_PYTHON_POOL_SIZE: usize = 3;
pub const DEFAULT_RUNTIME_COMMAND: &str = "deno";
pub const DEFAULT_PYTHON_COMMAND: &str = "python3";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// Line-delimited JSON-RPC over the process's own stdio.
    #[default]
    Stdio,
    /// Line-delimited JSON-RPC over a loopback TCP socket.
    LocalSocket,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum UpstreamTransportConfig {
    /// Long-lived child process speaking framed JSON-RPC on its stdio.
    Subprocess {
        /// Full command line; split with shell-style quoting rules.
        command: String,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// One HTTP POST of the RPC envelope per call.
    HttpRpc { url: String },
    /// Persistent provider session; origin and DNS are pinned.
    HttpStreaming { url: String },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OAuthBodyFormat {
    Form,
    Json,
}

/// Per-upstream credential. The configured value is never mutated; all
/// refresh state lives in the auth broker.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum UpstreamCredential {
    ApiKeyHeader { header: String, value: String },
    StaticBearer { token: String },
    #[serde(rename = "oauth2-refresh")]
    OAuth2RefreshGrant {
        client_id: String,
        #[serde(default)]
        client_secret: Option<String>,
        token_url: String,
        refresh_token: String,
        #[serde(default)]
        scope: Option<String>,
        #[serde(default)]
        body_format: Option<OAuthBodyFormat>,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UpstreamConfig {
    pub id: String,
    #[serde(flatten)]
    pub transport: UpstreamTransportConfig,
    #[serde(default)]
    pub credential: Option<UpstreamCredential>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendConfig {
    /// JS runtime used by the subprocess backend.
    pub runtime_command: String,
    pub max_subprocesses: usize,
    pub python_command: String,
    pub python_pool_size: usize,
    /// The in-process isolate backend can be disabled to force every
    /// execution through OS-level isolation.
    pub isolate_enabled: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            runtime_command: DEFAULT_RUNTIME_COMMAND.to_string(),
            max_subprocesses: DEFAULT_MAX_SUBPROCESSES,
            python_command: DEFAULT_PYTHON_COMMAND.to_string(),
            python_pool_size: DEFAULT_PYTHON_POOL_SIZE,
            isolate_enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub transport: TransportKind,
    pub port: u16,
    pub ops_port: Option<u16>,
    /// Master bearer token. When absent, authentication is disabled and the
    /// stdio transport is implicitly trusted.
    pub ipc_bearer_token: Option<String>,
    pub max_concurrent: usize,
    pub queue_size: usize,
    pub resource_limits: ResourceLimits,
    pub strict_validation: bool,
    pub allow_private_network: bool,
    pub backend: BackendConfig,
    pub upstreams: Vec<UpstreamConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transport: TransportKind::Stdio,
            port: 8970,
            ops_port: None,
            ipc_bearer_token: None,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            queue_size: DEFAULT_QUEUE_SIZE,
            resource_limits: ResourceLimits::default(),
            strict_validation: false,
            allow_private_network: false,
            backend: BackendConfig::default(),
            upstreams: Vec::new(),
        }
    }
}

/// On-disk shape: everything optional so a partial file only overrides the
/// fields it names.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigToml {
    pub transport: Option<TransportKind>,
    pub port: Option<u16>,
    pub ops_port: Option<u16>,
    pub ipc_bearer_token: Option<String>,
    pub max_concurrent: Option<usize>,
    pub queue_size: Option<usize>,
    pub resource_limits: Option<ResourceLimitsOverride>,
    pub strict_validation: Option<bool>,
    pub allow_private_network: Option<bool>,
    pub backend: Option<BackendConfig>,
    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,
}

impl Config {
    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        let parsed: ConfigToml = toml::from_str(raw)?;
        Ok(Self::from_parts(parsed))
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }

    fn from_parts(parsed: ConfigToml) -> Self {
        let defaults = Config::default();
        Config {
            transport: parsed.transport.unwrap_or(defaults.transport),
            port: parsed.port.unwrap_or(defaults.port),
            ops_port: parsed.ops_port,
            ipc_bearer_token: parsed.ipc_bearer_token,
            max_concurrent: parsed.max_concurrent.unwrap_or(defaults.max_concurrent),
            queue_size: parsed.queue_size.unwrap_or(defaults.queue_size),
            resource_limits: parsed
                .resource_limits
                .unwrap_or_default()
                .merged_with(defaults.resource_limits),
            strict_validation: parsed
                .strict_validation
                .unwrap_or(defaults.strict_validation),
            allow_private_network: parsed
                .allow_private_network
                .unwrap_or(defaults.allow_private_network),
            backend: parsed.backend.unwrap_or(defaults.backend),
            upstreams: parsed.upstreams,
        }
    }
}

/// Split a configured command string into argv tokens.
pub fn split_command(command: &str) -> anyhow::Result<Vec<String>> {
    let argv =
        shlex::split(command).ok_or_else(|| anyhow::anyhow!("invalid command: {command:?}"))?;
    if argv.is_empty() {
        anyhow::bail!("command must not be empty");
    }
    Ok(argv)
}
