//! Tool federation gateway.
//!
//! Owns the set of upstream connectors plus the built-in `conduit` package,
//! resolves qualified (or bare) tool names, enforces the per-execution
//! allowlist, validates arguments against cached schemas and records
//! per-call metrics.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use std::time::Instant;

use metrics::counter;
use metrics::histogram;
use serde_json::Value;
use serde_json::json;
use tokio::task::JoinSet;
use tracing::debug;
use tracing::info;
use tracing::warn;

use conduit_protocol::ToolStub;

use crate::auth::AuthBroker;
use crate::config::UpstreamConfig;
use crate::context::ExecutionContext;
use crate::error::ConduitErr;
use crate::error::Result;
use crate::network_policy::NetworkPolicy;
use crate::policy;
use crate::policy::ToolIdentifier;
use crate::schema_cache::SchemaCache;
use crate::upstream::UpstreamConnector;
use crate::upstream::UpstreamStatus;

/// Pseudo-namespace for the built-in execute endpoints. The host itself is
/// deliberately not an upstream; these stubs are dispatched by the pipeline.
pub const BUILTIN_PACKAGE: &str = "conduit";

const HEALTH_TIMEOUT: Duration = Duration::from_secs(3);

const CALL_DURATION_METRIC: &str = "conduit_tool_call_duration_seconds";
const CALL_TOTAL_METRIC: &str = "conduit_tool_calls_total";

/// What `call_tool` resolved to: either an upstream result, or a built-in
/// execute tool the caller must dispatch through the supervisor.
#[derive(Debug)]
pub enum ToolCallOutput {
    Value(Value),
    Builtin {
        tool: String,
        arguments: Option<Value>,
    },
}

pub struct Gateway {
    connectors: HashMap<String, Arc<UpstreamConnector>>,
    schema_cache: Arc<SchemaCache>,
    validators: StdMutex<HashMap<String, Arc<jsonschema::Validator>>>,
}

impl Gateway {
    pub fn new(
        connectors: HashMap<String, Arc<UpstreamConnector>>,
        schema_cache: Arc<SchemaCache>,
    ) -> Self {
        Self {
            connectors,
            schema_cache,
            validators: StdMutex::new(HashMap::new()),
        }
    }

    pub fn from_configs(
        configs: Vec<UpstreamConfig>,
        auth: Arc<AuthBroker>,
        network: Arc<NetworkPolicy>,
        schema_cache: Arc<SchemaCache>,
    ) -> anyhow::Result<Self> {
        let mut connectors = HashMap::with_capacity(configs.len());
        for config in configs {
            if config.id == BUILTIN_PACKAGE {
                anyhow::bail!("upstream id '{BUILTIN_PACKAGE}' is reserved");
            }
            let id = config.id.clone();
            let connector =
                UpstreamConnector::from_config(config, auth.clone(), network.clone())?;
            connectors.insert(id, Arc::new(connector));
        }
        Ok(Self::new(connectors, schema_cache))
    }

    pub fn builtin_stubs() -> Vec<ToolStub> {
        let code_schema = |description: &str| {
            json!({
                "type": "object",
                "properties": {
                    "code": {"type": "string", "description": description},
                    "limits": {"type": "object"},
                    "allowedTools": {"type": "array", "items": {"type": "string"}},
                },
                "required": ["code"],
            })
        };
        vec![
            ToolStub {
                name: format!("{BUILTIN_PACKAGE}__executeTypeScript"),
                description: Some(
                    "Execute TypeScript in a sandbox with tool access".to_string(),
                ),
                input_schema: Some(code_schema("TypeScript source to execute")),
            },
            ToolStub {
                name: format!("{BUILTIN_PACKAGE}__executePython"),
                description: Some("Execute Python in a sandbox with tool access".to_string()),
                input_schema: Some(code_schema("Python source to execute")),
            },
            ToolStub {
                name: format!("{BUILTIN_PACKAGE}__executeIsolate"),
                description: Some(
                    "Execute JavaScript in a fast in-process isolate".to_string(),
                ),
                input_schema: Some(code_schema("JavaScript source to execute")),
            },
        ]
    }

    /// `conduit` plus every registered upstream id, sorted for determinism.
    pub fn list_tool_packages(&self) -> Vec<String> {
        let mut packages = vec![BUILTIN_PACKAGE.to_string()];
        packages.extend(self.connectors.keys().cloned());
        packages.sort();
        packages
    }

    /// Stubs for one package with qualified names, filtered by the
    /// context's allowlist when one is set.
    pub async fn list_tool_stubs(
        &self,
        package: &str,
        context: &ExecutionContext,
    ) -> Result<Vec<ToolStub>> {
        let stubs = if package == BUILTIN_PACKAGE {
            Self::builtin_stubs()
        } else {
            self.ensure_schemas(package, context).await?
        };
        Ok(filter_by_allowlist(stubs, context))
    }

    /// Union of built-ins and every upstream's stubs. A failing upstream is
    /// logged and omitted from the result set.
    pub async fn discover_tools(&self, context: &ExecutionContext) -> Vec<ToolStub> {
        let mut stubs = Self::builtin_stubs();

        let mut join_set = JoinSet::new();
        for (id, connector) in &self.connectors {
            let id = id.clone();
            let connector = connector.clone();
            let schema_cache = self.schema_cache.clone();
            let context = context.clone();
            join_set.spawn(async move {
                let result =
                    fetch_schemas(&id, connector.as_ref(), &schema_cache, &context).await;
                (id, result)
            });
        }
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((_, Ok(mut upstream_stubs))) => stubs.append(&mut upstream_stubs),
                Ok((id, Err(e))) => {
                    warn!("tool discovery failed for upstream '{id}': {e}");
                }
                Err(e) => warn!("tool discovery task panicked: {e}"),
            }
        }

        stubs.sort_by(|a, b| a.name.cmp(&b.name));
        filter_by_allowlist(stubs, context)
    }

    pub async fn call_tool(
        &self,
        qualified_name: &str,
        arguments: Option<Value>,
        context: &ExecutionContext,
    ) -> Result<ToolCallOutput> {
        // 1. Allowlist. An empty list allows nothing; absence allows all.
        if let Some(patterns) = context.allowed_tools.as_deref() {
            let compiled = policy::compile_patterns(patterns)?;
            if !policy::is_allowed(&policy::parse(qualified_name), Some(&compiled)) {
                return Err(ConduitErr::Forbidden(format!(
                    "Tool '{qualified_name}' is not in the allowlist"
                )));
            }
        }

        // 2. Parse; bare names resolve by enumeration and must be unique.
        let mut id = policy::parse(qualified_name);
        if id.is_bare() {
            id = self.resolve_bare(&id.name, context).await?;
        }

        if id.namespace == BUILTIN_PACKAGE {
            return Ok(ToolCallOutput::Builtin {
                tool: id.name,
                arguments,
            });
        }

        // 3. Upstream lookup.
        let Some(connector) = self.connectors.get(&id.namespace) else {
            let mut known = self.list_tool_packages();
            known.retain(|p| p != BUILTIN_PACKAGE);
            return Err(ConduitErr::Forbidden(format!(
                "unknown upstream '{}'; known upstreams: {}",
                id.namespace,
                known.join(", ")
            )));
        };

        // 4–6. Lazy schema discovery + validation.
        let qualified = policy::format(&id);
        let stubs = self.ensure_schemas(&id.namespace, context).await?;
        let schema = stubs
            .iter()
            .find(|stub| stub.name == qualified)
            .and_then(|stub| stub.input_schema.clone());
        match schema {
            Some(schema) => {
                let params = arguments.clone().unwrap_or_else(|| json!({}));
                self.validate_against_schema(&qualified, &schema, &params)?;
            }
            None if context.strict_validation => {
                return Err(ConduitErr::InvalidParams(format!(
                    "no input schema is available for '{qualified}' and strict validation is on"
                )));
            }
            None => {}
        }

        // 7. Invoke, with the per-tool duration metric.
        let started = Instant::now();
        let call_result = connector
            .call(
                "tools/call",
                Some(json!({
                    "name": id.name,
                    "arguments": arguments.unwrap_or_else(|| json!({})),
                })),
                context,
            )
            .await;
        let success = call_result.is_ok();
        histogram!(
            CALL_DURATION_METRIC,
            "tool" => qualified.clone(),
            "success" => success.to_string(),
        )
        .record(started.elapsed().as_secs_f64());
        counter!(
            CALL_TOTAL_METRIC,
            "tool" => qualified.clone(),
            "success" => success.to_string(),
        )
        .increment(1);

        match call_result {
            Ok(value) => Ok(ToolCallOutput::Value(value)),
            Err(e) => {
                // 8. A transport timeout may mean the upstream changed; drop
                // its cached schemas so the next call re-discovers.
                if e.is_upstream_timeout() {
                    info!(
                        "invalidating cached schemas for '{}' after timeout",
                        id.namespace
                    );
                    self.schema_cache.invalidate(&id.namespace).await;
                    self.drop_validators_for(&id.namespace);
                }
                Err(e)
            }
        }
    }

    /// Schema-only pre-validation: same checks as `call_tool`, no call.
    pub async fn validate_tool(
        &self,
        qualified_name: &str,
        arguments: Option<Value>,
        context: &ExecutionContext,
    ) -> Result<()> {
        let mut id = policy::parse(qualified_name);
        if id.is_bare() {
            id = self.resolve_bare(&id.name, context).await?;
        }
        if id.namespace == BUILTIN_PACKAGE {
            return Ok(());
        }
        if !self.connectors.contains_key(&id.namespace) {
            return Err(ConduitErr::Forbidden(format!(
                "unknown upstream '{}'",
                id.namespace
            )));
        }
        let qualified = policy::format(&id);
        let stubs = self.ensure_schemas(&id.namespace, context).await?;
        let schema = stubs
            .iter()
            .find(|stub| stub.name == qualified)
            .and_then(|stub| stub.input_schema.clone());
        match schema {
            Some(schema) => {
                let params = arguments.unwrap_or_else(|| json!({}));
                self.validate_against_schema(&qualified, &schema, &params)
            }
            None if context.strict_validation => Err(ConduitErr::InvalidParams(format!(
                "no input schema is available for '{qualified}' and strict validation is on"
            ))),
            None => Ok(()),
        }
    }

    /// Cheap `tools/list` per upstream with a short timeout.
    pub async fn health_check(&self) -> BTreeMap<String, UpstreamStatus> {
        let context = ExecutionContext::new(crate::context::Principal::Master, false);
        let mut join_set = JoinSet::new();
        for (id, connector) in &self.connectors {
            let id = id.clone();
            let connector = connector.clone();
            let context = context.clone();
            join_set.spawn(async move {
                let status = match tokio::time::timeout(
                    HEALTH_TIMEOUT,
                    connector.call("tools/list", None, &context),
                )
                .await
                {
                    Ok(Ok(_)) => UpstreamStatus::Active,
                    Ok(Err(e)) if e.is_upstream_timeout() => UpstreamStatus::Degraded,
                    Ok(Err(_)) => UpstreamStatus::Error,
                    Err(_) => UpstreamStatus::Degraded,
                };
                (id, status)
            });
        }
        let mut statuses = BTreeMap::new();
        while let Some(joined) = join_set.join_next().await {
            if let Ok((id, status)) = joined {
                statuses.insert(id, status);
            }
        }
        statuses
    }

    pub async fn shutdown(&self) {
        for connector in self.connectors.values() {
            connector.shutdown().await;
        }
    }

    async fn resolve_bare(
        &self,
        bare_name: &str,
        context: &ExecutionContext,
    ) -> Result<ToolIdentifier> {
        let discovered = self.discover_tools(context).await;
        let candidates: Vec<&ToolStub> = discovered
            .iter()
            .filter(|stub| policy::parse(&stub.name).name == bare_name)
            .collect();
        match candidates.as_slice() {
            [only] => Ok(policy::parse(&only.name)),
            [] => Err(ConduitErr::MethodNotFound(format!(
                "no tool named '{bare_name}'; available tools: {}",
                summarize_names(&discovered)
            ))),
            many => Err(ConduitErr::MethodNotFound(format!(
                "tool name '{bare_name}' is ambiguous; candidates: {}",
                many.iter()
                    .map(|stub| stub.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }

    /// Populate (and return) the cached stub list for an upstream:
    /// cache, then manifest probe, then a `tools/list` round-trip.
    async fn ensure_schemas(
        &self,
        upstream_id: &str,
        context: &ExecutionContext,
    ) -> Result<Vec<ToolStub>> {
        let Some(connector) = self.connectors.get(upstream_id) else {
            return Err(ConduitErr::Forbidden(format!(
                "unknown upstream '{upstream_id}'"
            )));
        };
        fetch_schemas(upstream_id, connector, &self.schema_cache, context).await
    }

    fn validate_against_schema(
        &self,
        qualified: &str,
        schema: &Value,
        params: &Value,
    ) -> Result<()> {
        let validator = {
            let mut validators = self
                .validators
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match validators.get(qualified) {
                Some(validator) => validator.clone(),
                None => {
                    let compiled = jsonschema::validator_for(schema).map_err(|e| {
                        ConduitErr::Internal(format!(
                            "input schema for '{qualified}' does not compile: {e}"
                        ))
                    })?;
                    let compiled = Arc::new(compiled);
                    validators.insert(qualified.to_string(), compiled.clone());
                    compiled
                }
            }
        };
        if let Err(error) = validator.validate(params) {
            return Err(ConduitErr::InvalidParams(format!(
                "arguments for '{qualified}' failed schema validation: {error}"
            )));
        }
        Ok(())
    }

    fn drop_validators_for(&self, upstream_id: &str) {
        let prefix = format!("{upstream_id}{}", policy::TOOL_NAME_DELIMITER);
        self.validators
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|key, _| !key.starts_with(&prefix));
    }
}

async fn fetch_schemas(
    upstream_id: &str,
    connector: &UpstreamConnector,
    schema_cache: &SchemaCache,
    context: &ExecutionContext,
) -> Result<Vec<ToolStub>> {
    if let Some(cached) = schema_cache.get(upstream_id).await {
        return Ok(cached);
    }

    let stubs = match connector.get_manifest(context).await {
        Some(manifest) => {
            debug!("using manifest for upstream '{upstream_id}'");
            manifest.tools
        }
        None => connector.list_tools(context).await?,
    };

    let qualified: Vec<ToolStub> = stubs
        .into_iter()
        .map(|stub| ToolStub {
            name: qualify(upstream_id, &stub.name),
            ..stub
        })
        .collect();
    schema_cache.set(upstream_id, qualified.clone()).await;
    Ok(qualified)
}

fn qualify(upstream_id: &str, tool_name: &str) -> String {
    let prefix = format!("{upstream_id}{}", policy::TOOL_NAME_DELIMITER);
    if tool_name.starts_with(&prefix) {
        tool_name.to_string()
    } else {
        format!("{prefix}{tool_name}")
    }
}

fn filter_by_allowlist(stubs: Vec<ToolStub>, context: &ExecutionContext) -> Vec<ToolStub> {
    match context.allowed_tools.as_deref() {
        None => stubs,
        Some(patterns) => stubs
            .into_iter()
            .filter(|stub| policy::is_allowed_by(&policy::parse(&stub.name), Some(patterns)))
            .collect(),
    }
}

fn summarize_names(stubs: &[ToolStub]) -> String {
    stubs
        .iter()
        .map(|stub| stub.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
