// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Unified tool dispatch with discovery, correction, retry, and fallback.
//!
//! The manager owns a registry of connected transports and a discovery cache
//! keyed by `server:tool`. `execute` resolves the owning server (with a
//! deterministic unique-match correction for misattributed names), enforces
//! the caller's allow-list, validates arguments against the tool's schema,
//! retries transient failures with jittered exponential backoff, and walks
//! the tool's fallback list on persistent failure. Every attempt lands on
//! the trace.
//!
//! Steady-state dispatch reads an immutable snapshot of the registry taken
//! under a short lock; only registration and deregistration mutate it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::ids::Stopwatch;
use crate::llm::ToolDefinition;
use crate::retry::RetryPolicy;
use crate::tools::{ServerDescriptor, ToolDescriptor, ToolOverride, TransportKind};
use crate::trace::{Severity, Tracer};
use crate::transport::sse::SseTransport;
use crate::transport::stdio::StdioTransport;
use crate::transport::{ToolOutcome, Transport};

#[derive(Default)]
struct Registry {
    servers: HashMap<String, ServerDescriptor>,
    transports: HashMap<String, Arc<dyn Transport>>,
    // Discovery cache, keyed by "server:tool".
    tools: HashMap<String, ToolDescriptor>,
    // Bare tool name -> owning servers, in registration order.
    by_name: HashMap<String, Vec<String>>,
    // Agent name -> allow-list. Absent agents are unrestricted.
    agent_tools: HashMap<String, Vec<String>>,
    // "server:tool" or "*:tool" -> override.
    overrides: HashMap<String, ToolOverride>,
}

/// Shared tool manager.
pub struct ToolManager {
    registry: Mutex<Registry>,
    retry: RetryPolicy,
}

impl Default for ToolManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolManager {
    /// An empty manager with the default retry policy.
    #[must_use]
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            retry: RetryPolicy::default(),
        }
    }

    /// Replace the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Load per-tool overrides. Keys are `server:tool` or `*:tool`.
    pub fn load_overrides(&self, overrides: HashMap<String, ToolOverride>) {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        registry.overrides = overrides;
        // Re-apply to already-discovered tools.
        let keys: Vec<String> = registry.tools.keys().cloned().collect();
        for key in keys {
            let patch = lookup_override(&registry.overrides, &key);
            if let (Some(patch), Some(tool)) = (patch, registry.tools.get_mut(&key)) {
                apply_override(tool, &patch);
            }
        }
    }

    /// Set the allow-list for an agent. An empty list denies everything.
    pub fn set_agent_tools(&self, agent: &str, tools: Vec<String>) {
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .agent_tools
            .insert(agent.to_string(), tools);
    }

    /// Whether an agent may call a tool. Agents without a registered
    /// allow-list are unrestricted.
    #[must_use]
    pub fn check_tool_access(&self, agent: &str, tool: &str) -> bool {
        let registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        match registry.agent_tools.get(agent) {
            Some(allowed) => allowed.iter().any(|t| t == tool),
            None => true,
        }
    }

    /// Connect a server, run the handshake, and cache its tools.
    pub async fn register_server(&self, server: ServerDescriptor) -> Result<()> {
        if !server.enabled {
            tracing::info!(server = %server.name, "skipping disabled server");
            return Ok(());
        }

        let transport: Arc<dyn Transport> = match &server.transport {
            TransportKind::Stdio { command, args, env } => {
                Arc::new(StdioTransport::spawn(&server.name, command, args, env)?)
            }
            TransportKind::EventStream { url, headers } => {
                Arc::new(SseTransport::connect(&server.name, url, headers)?)
            }
        };

        self.register_transport(server, transport).await
    }

    /// Register an already-built transport (custom transports, tests).
    pub async fn register_transport(
        &self,
        server: ServerDescriptor,
        transport: Arc<dyn Transport>,
    ) -> Result<()> {
        transport.initialize().await?;
        let discovered = transport.list_tools().await?;
        let tool_names: Vec<&str> = discovered.iter().map(|t| t.name.as_str()).collect();
        tracing::info!(server = %server.name, tools = ?tool_names, "server registered");

        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        for found in discovered {
            let mut tool = ToolDescriptor {
                name: found.name.clone(),
                server: server.name.clone(),
                description: found.description,
                input_schema: found.input_schema,
                output_schema: found.output_schema,
                timeout_seconds: crate::constants::DEFAULT_TOOL_TIMEOUT.as_secs(),
                fallback_tools: Vec::new(),
            };
            let key = tool.full_name();
            if let Some(patch) = lookup_override(&registry.overrides, &key) {
                apply_override(&mut tool, &patch);
            }
            let owners = registry.by_name.entry(found.name.clone()).or_default();
            if !owners.contains(&server.name) {
                owners.push(server.name.clone());
            }
            if owners.len() > 1 {
                tracing::warn!(
                    tool = %found.name,
                    owners = ?owners,
                    "tool name advertised by multiple servers; bare-name dispatch is ambiguous"
                );
            }
            registry.tools.insert(key, tool);
        }
        registry
            .transports
            .insert(server.name.clone(), transport);
        registry.servers.insert(server.name.clone(), server);
        Ok(())
    }

    /// Disconnect a server and drop its tools from the cache.
    pub async fn deregister_server(&self, name: &str) -> Result<()> {
        let transport = {
            let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            registry.servers.remove(name);
            registry.tools.retain(|_, tool| tool.server != name);
            for owners in registry.by_name.values_mut() {
                owners.retain(|owner| owner != name);
            }
            registry.by_name.retain(|_, owners| !owners.is_empty());
            registry.transports.remove(name)
        };
        if let Some(transport) = transport {
            transport.close().await?;
        }
        Ok(())
    }

    /// Close all transports.
    pub async fn close(&self) {
        let transports: Vec<Arc<dyn Transport>> = {
            let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            registry.servers.clear();
            registry.tools.clear();
            registry.by_name.clear();
            registry.transports.drain().map(|(_, t)| t).collect()
        };
        for transport in transports {
            if let Err(e) = transport.close().await {
                tracing::warn!(server = %transport.server_name(), error = %e, "close failed");
            }
        }
    }

    /// All discovered tools, optionally filtered by server.
    #[must_use]
    pub fn list_tools(&self, server: Option<&str>) -> Vec<ToolDescriptor> {
        let registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        let mut tools: Vec<ToolDescriptor> = registry
            .tools
            .values()
            .filter(|tool| server.is_none_or(|s| tool.server == s))
            .cloned()
            .collect();
        tools.sort_by(|a, b| a.full_name().cmp(&b.full_name()));
        tools
    }

    /// Tool definitions visible to an agent: the discovery cache filtered by
    /// its allow-list (unrestricted agents see everything).
    #[must_use]
    pub fn tool_definitions_for_agent(&self, agent: &str) -> Vec<ToolDefinition> {
        let registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        let allowed = registry.agent_tools.get(agent);
        let mut definitions: Vec<ToolDefinition> = registry
            .tools
            .values()
            .filter(|tool| allowed.is_none_or(|list| list.iter().any(|t| *t == tool.name)))
            .map(|tool| ToolDefinition {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: tool.input_schema.clone(),
            })
            .collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions.dedup_by(|a, b| a.name == b.name);
        definitions
    }

    /// Resolve a tool reference to its transport and descriptor.
    ///
    /// `reference` is either `server:tool` or a bare tool name. An unknown
    /// `server:tool` falls back to the unique-match correction over the bare
    /// name: exactly one owning server wins, anything else is an error.
    fn resolve(&self, reference: &str) -> Result<(Arc<dyn Transport>, ToolDescriptor, bool)> {
        let registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());

        let (claimed_server, bare) = match reference.split_once(':') {
            Some((server, tool)) => (Some(server), tool),
            None => (None, reference),
        };

        if let Some(server) = claimed_server {
            if let Some(tool) = registry.tools.get(reference) {
                let transport = registry
                    .transports
                    .get(server)
                    .ok_or_else(|| Error::ServerNotFound(server.to_string()))?;
                return Ok((Arc::clone(transport), tool.clone(), false));
            }
        }

        let owners = registry.by_name.get(bare).map_or(&[][..], Vec::as_slice);
        match owners {
            [owner] => {
                let key = format!("{owner}:{bare}");
                let tool = registry
                    .tools
                    .get(&key)
                    .cloned()
                    .ok_or_else(|| Error::ToolNotFound {
                        tool: bare.to_string(),
                        candidates: 0,
                    })?;
                let transport = registry
                    .transports
                    .get(owner)
                    .ok_or_else(|| Error::ServerNotFound(owner.clone()))?;
                let corrected = claimed_server.is_some_and(|claimed| claimed != owner.as_str());
                Ok((Arc::clone(transport), tool, corrected))
            }
            owners => Err(Error::ToolNotFound {
                tool: bare.to_string(),
                candidates: owners.len(),
            }),
        }
    }

    /// Dispatch a tool call on behalf of an agent.
    ///
    /// Applies, in order: allow-list enforcement, server resolution with
    /// correction, schema validation, the retry loop, and the fallback list.
    pub async fn execute(
        &self,
        agent: &str,
        tool_name: &str,
        arguments: &Map<String, Value>,
        timeout_override: Option<Duration>,
        tracer: &Tracer,
        cancel: &CancellationToken,
    ) -> Result<ToolOutcome> {
        let bare = tool_name.rsplit(':').next().unwrap_or(tool_name);
        if !self.check_tool_access(agent, bare) {
            let err = Error::AccessDenied {
                agent: agent.to_string(),
                tool: bare.to_string(),
            };
            tracer
                .log_step("tool_attempt", err.to_string(), agent, Severity::Error, vec![], 0)
                .await;
            return Err(err);
        }

        let (transport, primary, corrected) = match self.resolve(tool_name) {
            Ok(resolved) => resolved,
            Err(err) => {
                tracer
                    .log_step("tool_attempt", err.to_string(), agent, Severity::Error, vec![], 0)
                    .await;
                return Err(err);
            }
        };
        if corrected {
            tracer
                .log_step(
                    "tool_correction",
                    format!("corrected '{tool_name}' to '{}'", primary.full_name()),
                    agent,
                    Severity::Info,
                    vec![],
                    0,
                )
                .await;
        }

        // Attempt list: the resolved tool, then its fallbacks in order.
        let mut attempts: Vec<(Arc<dyn Transport>, ToolDescriptor)> =
            vec![(transport, primary.clone())];
        for fallback in &primary.fallback_tools {
            match self.resolve(fallback) {
                Ok((transport, tool, _)) => attempts.push((transport, tool)),
                Err(e) => {
                    tracing::warn!(fallback = %fallback, error = %e, "fallback tool unresolvable");
                }
            }
        }

        let mut last_err = None;
        for (fallback_index, (transport, tool)) in attempts.into_iter().enumerate() {
            if fallback_index > 0 {
                tracer
                    .log_step(
                        "tool_fallback",
                        format!("falling back to '{}'", tool.full_name()),
                        agent,
                        Severity::Warning,
                        vec![],
                        0,
                    )
                    .await;
            }

            let timeout = timeout_override.unwrap_or_else(|| tool.timeout());
            if let Err(err) = validate_input(&tool.name, &tool.input_schema, arguments) {
                tracer
                    .log_step("tool_attempt", err.to_string(), agent, Severity::Error, vec![], 0)
                    .await;
                return Err(err);
            }

            match self
                .run_attempts(agent, &transport, &tool, arguments, timeout, tracer, cancel)
                .await
            {
                Ok(outcome) => return Ok(outcome),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(err) if err.is_fallback_eligible() => last_err = Some(err),
                Err(err) => return Err(err),
            }
        }

        Err(last_err.unwrap_or(Error::ToolNotFound {
            tool: tool_name.to_string(),
            candidates: 0,
        }))
    }

    /// The retry loop for one tool: transient and tool-execution failures
    /// are retried with backoff up to the policy's attempt budget.
    #[allow(clippy::too_many_arguments)]
    async fn run_attempts(
        &self,
        agent: &str,
        transport: &Arc<dyn Transport>,
        tool: &ToolDescriptor,
        arguments: &Map<String, Value>,
        timeout: Duration,
        tracer: &Tracer,
        cancel: &CancellationToken,
    ) -> Result<ToolOutcome> {
        let args_value = Value::Object(arguments.clone());
        let mut attempt = 0;

        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let watch = Stopwatch::start();
            let result = tokio::select! {
                () = cancel.cancelled() => Err(Error::Cancelled),
                result = transport.call_tool(&tool.name, arguments, timeout) => result,
            };
            let duration_ms = watch.elapsed_ms();

            let err = match result {
                Ok(outcome) if !outcome.is_error => {
                    let record = Tracer::log_tool_call(
                        &tool.server,
                        &tool.name,
                        args_value.clone(),
                        Some(Value::String(outcome.text())),
                        None,
                        duration_ms,
                    );
                    tracer
                        .log_step(
                            "tool_attempt",
                            format!("'{}' succeeded on attempt {attempt}", tool.full_name()),
                            agent,
                            Severity::Info,
                            vec![record],
                            duration_ms,
                        )
                        .await;
                    return Ok(outcome);
                }
                Ok(outcome) => Error::ToolExecution {
                    server: tool.server.clone(),
                    tool: tool.name.clone(),
                    attempt,
                    reason: outcome.text(),
                },
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(Error::ToolExecution { reason, .. }) => Error::ToolExecution {
                    server: tool.server.clone(),
                    tool: tool.name.clone(),
                    attempt,
                    reason,
                },
                Err(other) => other,
            };

            let record = Tracer::log_tool_call(
                &tool.server,
                &tool.name,
                args_value.clone(),
                None,
                Some(err.to_string()),
                duration_ms,
            );
            tracer
                .log_step(
                    "tool_attempt",
                    format!("'{}' failed on attempt {attempt}: {err}", tool.full_name()),
                    agent,
                    Severity::Warning,
                    vec![record],
                    duration_ms,
                )
                .await;

            if !err.is_fallback_eligible() {
                return Err(err);
            }
            if !self.retry.should_retry(attempt) {
                return Err(err);
            }
            tokio::select! {
                () = cancel.cancelled() => return Err(Error::Cancelled),
                () = tokio::time::sleep(self.retry.delay_for(attempt)) => {}
            }
        }
    }
}

impl std::fmt::Debug for ToolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("ToolManager")
            .field("servers", &registry.servers.len())
            .field("tools", &registry.tools.len())
            .finish_non_exhaustive()
    }
}

fn lookup_override(
    overrides: &HashMap<String, ToolOverride>,
    key: &str,
) -> Option<ToolOverride> {
    if let Some(patch) = overrides.get(key) {
        return Some(patch.clone());
    }
    let bare = key.rsplit(':').next()?;
    overrides.get(&format!("*:{bare}")).cloned()
}

fn apply_override(tool: &mut ToolDescriptor, patch: &ToolOverride) {
    if let Some(timeout) = patch.timeout_seconds {
        tool.timeout_seconds = timeout;
    }
    if let Some(fallbacks) = &patch.fallback_tools {
        tool.fallback_tools.clone_from(fallbacks);
    }
}

/// Validate tool arguments against the tool's input schema.
///
/// A schema that itself fails to compile is skipped (logged), keeping
/// compatibility with servers that advertise incomplete schemas.
fn validate_input(tool: &str, schema: &Value, arguments: &Map<String, Value>) -> Result<()> {
    let validator = match jsonschema::validator_for(schema) {
        Ok(validator) => validator,
        Err(e) => {
            tracing::warn!(tool, error = %e, "invalid tool schema, skipping validation");
            return Ok(());
        }
    };

    let instance = Value::Object(arguments.clone());
    let violations: Vec<String> = validator
        .iter_errors(&instance)
        .map(|error| {
            let path = error.instance_path.to_string();
            if path.is_empty() {
                error.to_string()
            } else {
                format!("{path}: {error}")
            }
        })
        .collect();

    if violations.is_empty() {
        Ok(())
    } else {
        Err(Error::SchemaViolation {
            tool: tool.to_string(),
            violations: violations.join("; "),
        })
    }
}
