// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The agent reasoning loop.
//!
//! An agent runs one reasoning iteration at a time: compose the prompt from
//! the state's message history, call the model with its tool catalogue,
//! append the assistant reply through the reducer, then run any requested
//! tool calls sequentially in the order the model listed them. Completion is
//! exactly the absence of tool calls on an assistant message; content
//! heuristics are never consulted. Hitting the iteration cap while the model
//! is still requesting tools is a distinct failure.
//!
//! Context-limit recovery trims the oldest non-system message from a working
//! copy of the prompt and retries, down to a floor of two messages; the
//! persisted state is never trimmed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::constants::{CONTEXT_TRIM_FLOOR, DEFAULT_AGENT_ITERATIONS, DEFAULT_LLM_TIMEOUT};
use crate::error::{Error, ErrorKind, Result};
use crate::ids::{self, Stopwatch};
use crate::llm::{ChatModel, ChatResponse, LlmSettings, ToolDefinition};
use crate::messages::{Message, ToolCall};
use crate::retry::RetryPolicy;
use crate::state::{AgentState, ReducerRegistry, StateDelta};
use crate::task::TaskContext;
use crate::tools::manager::ToolManager;
use crate::trace::Severity;

/// Immutable configuration of an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    /// Unique lowercase identifier.
    pub name: String,
    /// Role prose shown to operators.
    #[serde(default)]
    pub role: String,
    /// System instruction for the model.
    pub system_prompt: String,
    /// Ordered tool allow-list.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Maximum reasoning iterations.
    #[serde(default = "default_iterations")]
    pub max_iterations: u32,
    /// LLM endpoint configuration.
    #[serde(default)]
    pub llm: LlmSettings,
    /// Sampling temperature override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

fn default_iterations() -> u32 {
    DEFAULT_AGENT_ITERATIONS
}

impl AgentDescriptor {
    /// A descriptor with defaults for everything but name and prompt.
    #[must_use]
    pub fn new(name: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: String::new(),
            system_prompt: system_prompt.into(),
            tools: Vec::new(),
            max_iterations: DEFAULT_AGENT_ITERATIONS,
            llm: LlmSettings::default(),
            temperature: None,
        }
    }

    /// Set the tool allow-list.
    #[must_use]
    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = tools;
        self
    }

    /// Set the iteration cap.
    #[must_use]
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// The effective sampling temperature.
    #[must_use]
    pub fn effective_temperature(&self) -> Option<f32> {
        self.temperature.or(self.llm.temperature)
    }
}

/// Result of running an agent to completion.
#[derive(Debug, Clone)]
pub struct AgentRunResult {
    /// Final assistant output.
    pub output: String,
    /// Final state after all applied deltas.
    pub state: AgentState,
    /// Iterations consumed.
    pub iterations: u32,
}

/// Hook for synthetic tools owned by a supervisor.
///
/// The loop consults the delegator before the tool manager: a tool it owns
/// never reaches the manager.
#[async_trait]
pub(crate) trait Delegator: Send + Sync {
    /// Tool definitions to expose to the model in addition to real tools.
    fn synthetic_tools(&self) -> Vec<ToolDefinition>;

    /// Whether this delegator owns the tool name.
    fn owns(&self, tool: &str) -> bool;

    /// Run the delegation and return the summary surfaced as the tool result.
    async fn delegate(&self, call: &ToolCall, ctx: &TaskContext, depth: u32) -> Result<String>;
}

/// A runnable agent: descriptor, model, and optional tool access.
pub struct Agent {
    descriptor: AgentDescriptor,
    model: Arc<dyn ChatModel>,
    manager: Option<Arc<ToolManager>>,
    llm_timeout: Duration,
    llm_retry: RetryPolicy,
    registry: ReducerRegistry,
}

impl Agent {
    /// Create an agent from its descriptor and model capability.
    #[must_use]
    pub fn new(descriptor: AgentDescriptor, model: Arc<dyn ChatModel>) -> Self {
        Self {
            descriptor,
            model,
            manager: None,
            llm_timeout: DEFAULT_LLM_TIMEOUT,
            llm_retry: RetryPolicy::default(),
            registry: ReducerRegistry::default(),
        }
    }

    /// Attach the tool manager and register this agent's allow-list with it.
    #[must_use]
    pub fn with_tool_manager(mut self, manager: Arc<ToolManager>) -> Self {
        manager.set_agent_tools(&self.descriptor.name, self.descriptor.tools.clone());
        self.manager = Some(manager);
        self
    }

    /// Override the LLM call timeout.
    #[must_use]
    pub fn with_llm_timeout(mut self, timeout: Duration) -> Self {
        self.llm_timeout = timeout;
        self
    }

    /// Override the retry policy for transient LLM failures.
    #[must_use]
    pub fn with_llm_retry(mut self, retry: RetryPolicy) -> Self {
        self.llm_retry = retry;
        self
    }

    /// The agent's descriptor.
    #[must_use]
    pub fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    /// Run the loop on a fresh or supplied state.
    ///
    /// A task description seeds (or extends) the state as a user message.
    pub async fn run(
        &self,
        task: Option<&str>,
        initial_state: Option<AgentState>,
        ctx: &TaskContext,
    ) -> Result<AgentRunResult> {
        self.run_with_delegation(task, initial_state, ctx, None, 0)
            .await
    }

    pub(crate) async fn run_with_delegation(
        &self,
        task: Option<&str>,
        initial_state: Option<AgentState>,
        ctx: &TaskContext,
        delegator: Option<&dyn Delegator>,
        depth: u32,
    ) -> Result<AgentRunResult> {
        let name = self.descriptor.name.as_str();

        let mut state = match initial_state {
            Some(state) => match task {
                Some(task) if !task.is_empty() => self
                    .registry
                    .apply(&state, &StateDelta::new().message(Message::user(task)))?,
                _ => state,
            },
            None => AgentState::initial(name, task),
        };
        ctx.persist_state(&state).await?;

        for iteration in 1..=self.descriptor.max_iterations {
            if ctx.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let watch = Stopwatch::start();

            let mut prompt = Vec::with_capacity(state.messages.len() + 1);
            prompt.push(Message::system(self.descriptor.system_prompt.as_str()));
            prompt.extend(state.messages.iter().cloned());

            let mut tools = self
                .manager
                .as_ref()
                .map(|manager| manager.tool_definitions_for_agent(name))
                .unwrap_or_default();
            if let Some(delegator) = delegator {
                tools.extend(delegator.synthetic_tools());
            }

            let response = self.chat_with_recovery(&prompt, &tools, ctx).await?;

            let mut calls = response.tool_calls.clone();
            for call in &mut calls {
                if call.id.is_empty() {
                    call.id = ids::new_id();
                }
            }

            let assistant =
                Message::assistant_with_tool_calls(response.content.clone(), calls.clone());
            state = self
                .registry
                .apply(&state, &StateDelta::new().message(assistant))?;
            ctx.persist_state(&state).await?;

            if calls.is_empty() {
                ctx.tracer
                    .log_step(
                        "iteration",
                        format!("iteration {iteration}: completed"),
                        name,
                        Severity::Info,
                        vec![],
                        watch.elapsed_ms(),
                    )
                    .await;
                return Ok(AgentRunResult {
                    output: response.content,
                    state,
                    iterations: iteration,
                });
            }

            // Tool calls run sequentially, in the order the model listed
            // them, so observable state sequencing is preserved.
            for call in &calls {
                let content = self.dispatch(call, ctx, delegator, depth).await?;
                state = self
                    .registry
                    .apply(&state, &StateDelta::new().message(Message::tool(content, call.id.as_str())))?;
                ctx.persist_state(&state).await?;
            }

            ctx.tracer
                .log_step(
                    "iteration",
                    format!("iteration {iteration}: {} tool call(s)", calls.len()),
                    name,
                    Severity::Info,
                    vec![],
                    watch.elapsed_ms(),
                )
                .await;
        }

        let err = Error::IterationExhausted {
            agent: name.to_string(),
            limit: self.descriptor.max_iterations,
        };
        ctx.tracer
            .log_step("iteration", err.to_string(), name, Severity::Error, vec![], 0)
            .await;
        Err(err)
    }

    /// Resolve one tool call to its result content.
    ///
    /// Tool failures become tool-message content so the model can react;
    /// only cancellation aborts the run.
    async fn dispatch(
        &self,
        call: &ToolCall,
        ctx: &TaskContext,
        delegator: Option<&dyn Delegator>,
        depth: u32,
    ) -> Result<String> {
        if let Some(delegator) = delegator {
            if delegator.owns(&call.tool) {
                return match delegator.delegate(call, ctx, depth).await {
                    Ok(summary) => Ok(summary),
                    Err(Error::Cancelled) => Err(Error::Cancelled),
                    Err(e) => Ok(format!("Sub-agent execution failed: {e}")),
                };
            }
        }

        match &self.manager {
            Some(manager) => {
                let reference = match &call.server {
                    Some(server) if !server.is_empty() => format!("{server}:{}", call.tool),
                    _ => call.tool.clone(),
                };
                match manager
                    .execute(
                        &self.descriptor.name,
                        &reference,
                        &call.arguments,
                        None,
                        &ctx.tracer,
                        &ctx.cancel,
                    )
                    .await
                {
                    Ok(outcome) => Ok(outcome.text()),
                    Err(Error::Cancelled) => Err(Error::Cancelled),
                    Err(e) => Ok(format!("Tool execution failed: {e}")),
                }
            }
            None => Ok(format!("Error: tool '{}' is not available", call.tool)),
        }
    }

    /// Call the model, recovering from context-limit errors by trimming the
    /// oldest non-system message from a working copy of the prompt, and
    /// retrying transient failures with backoff.
    async fn chat_with_recovery(
        &self,
        prompt: &[Message],
        tools: &[ToolDefinition],
        ctx: &TaskContext,
    ) -> Result<ChatResponse> {
        let mut working: Vec<Message> = prompt.to_vec();
        let mut transient_attempt = 0u32;

        loop {
            if ctx.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let call = self.model.chat(&working, tools);
            let result = match tokio::time::timeout(self.llm_timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(Error::LlmTimeout(self.llm_timeout)),
            };

            match result {
                Ok(response) => return Ok(response),
                Err(e) if e.kind() == ErrorKind::ContextLimit => {
                    if working.len() <= CONTEXT_TRIM_FLOOR {
                        return Err(Error::ContextExhausted {
                            floor: CONTEXT_TRIM_FLOOR,
                        });
                    }
                    let oldest = working
                        .iter()
                        .position(|m| !m.is_system())
                        .unwrap_or(working.len() - 1);
                    let removed = working.remove(oldest);
                    tracing::info!(
                        agent = %self.descriptor.name,
                        remaining = working.len(),
                        role = ?removed.role,
                        "context limit hit, trimmed oldest non-system message"
                    );
                }
                Err(e) if e.is_retryable() => {
                    transient_attempt += 1;
                    if !self.llm_retry.should_retry(transient_attempt) {
                        return Err(e);
                    }
                    tracing::warn!(
                        agent = %self.descriptor.name,
                        attempt = transient_attempt,
                        error = %e,
                        "transient LLM failure, retrying"
                    );
                    tokio::select! {
                        () = ctx.cancel.cancelled() => return Err(Error::Cancelled),
                        () = tokio::time::sleep(self.llm_retry.delay_for(transient_attempt)) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.descriptor.name)
            .field("max_iterations", &self.descriptor.max_iterations)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedChatModel;
    use crate::store::DurableStore;

    fn context() -> (tempfile::TempDir, TaskContext) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DurableStore::new(dir.path()).unwrap());
        let ctx = TaskContext::new("task-agent", store);
        (dir, ctx)
    }

    #[tokio::test]
    async fn completes_on_first_tool_free_reply() {
        let model = Arc::new(ScriptedChatModel::new().with_response(ChatResponse::text("Paris")));
        let agent = Agent::new(
            AgentDescriptor::new("geo", "You answer geography questions.").with_max_iterations(3),
            model,
        );
        let (_dir, ctx) = context();

        let result = agent
            .run(Some("capital of France?"), None, &ctx)
            .await
            .unwrap();
        assert_eq!(result.output, "Paris");
        assert_eq!(result.iterations, 1);
        // user + assistant
        assert_eq!(result.state.message_count(), 2);

        let trace = ctx.tracer.snapshot().await;
        assert_eq!(trace.steps.len(), 1);
    }

    #[tokio::test]
    async fn iteration_cap_fails_with_distinct_error() {
        // The model keeps requesting tools forever.
        let tool_reply = || {
            ChatResponse::with_tool_calls(
                "",
                vec![ToolCall::new("missing", serde_json::Map::new())],
            )
        };
        let model = Arc::new(
            ScriptedChatModel::new().with_responses([tool_reply(), tool_reply(), tool_reply()]),
        );
        let agent = Agent::new(
            AgentDescriptor::new("looper", "Loop.").with_max_iterations(3),
            model,
        );
        let (_dir, ctx) = context();

        let err = agent.run(Some("go"), None, &ctx).await.unwrap_err();
        assert!(matches!(err, Error::IterationExhausted { limit: 3, .. }));
    }

    #[tokio::test]
    async fn tool_failures_become_tool_messages() {
        // No manager attached: the call resolves to an error message and the
        // second reply completes.
        let model = Arc::new(ScriptedChatModel::new().with_responses([
            ChatResponse::with_tool_calls("", vec![ToolCall::new("search", serde_json::Map::new())]),
            ChatResponse::text("recovered"),
        ]));
        let agent = Agent::new(AgentDescriptor::new("worker", "Work."), model);
        let (_dir, ctx) = context();

        let result = agent.run(Some("go"), None, &ctx).await.unwrap();
        assert_eq!(result.output, "recovered");
        // user, assistant(tool call), tool(error), assistant(final)
        assert_eq!(result.state.message_count(), 4);
        let tool_msg = &result.state.messages[2];
        assert_eq!(tool_msg.role, crate::messages::Role::Tool);
        assert!(tool_msg.content.contains("not available"));
    }

    #[tokio::test]
    async fn context_limit_recovery_trims_only_the_prompt() {
        // Window of 10: prompts with >= 10 messages fail. Seed 12 history
        // messages; the prompt starts at 13 (system included) and must be
        // trimmed to 9 before the model answers.
        let model = Arc::new(
            ScriptedChatModel::new()
                .with_context_window(10)
                .with_response(ChatResponse::text("finally")),
        );
        let agent = Agent::new(AgentDescriptor::new("historian", "Remember."), model.clone());
        let (_dir, ctx) = context();

        let mut state = AgentState::initial("historian", None);
        let registry = ReducerRegistry::default();
        let mut seed = Vec::new();
        for i in 0..12 {
            seed.push(Message::user(format!("note {i}")));
        }
        state = registry
            .apply(&state, &StateDelta::new().messages(seed))
            .unwrap();

        let result = agent.run(None, Some(state), &ctx).await.unwrap();
        assert_eq!(result.output, "finally");
        // Persisted state keeps all 12 originals plus the new assistant.
        assert_eq!(result.state.message_count(), 13);
        assert_eq!(result.state.messages[0].content, "note 0");
        // 13 -> 9 working messages: four failed probes plus the success.
        assert_eq!(model.call_count(), 5);
    }

    #[tokio::test]
    async fn context_exhaustion_is_distinct() {
        // Window of 1: even the floor prompt fails.
        let model = Arc::new(ScriptedChatModel::new().with_context_window(1));
        let agent = Agent::new(AgentDescriptor::new("cramped", "Tight."), model);
        let (_dir, ctx) = context();

        let err = agent.run(Some("question"), None, &ctx).await.unwrap_err();
        assert!(matches!(err, Error::ContextExhausted { floor: 2 }));
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop() {
        let model = Arc::new(ScriptedChatModel::new());
        let agent = Agent::new(AgentDescriptor::new("quitter", "Stop."), model);
        let (_dir, ctx) = context();
        ctx.cancel.cancel();

        let err = agent.run(Some("go"), None, &ctx).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn state_is_persisted_after_every_mutation() {
        let model = Arc::new(ScriptedChatModel::new().with_response(ChatResponse::text("ok")));
        let agent = Agent::new(AgentDescriptor::new("saver", "Persist."), model);
        let (_dir, ctx) = context();

        let result = agent.run(Some("go"), None, &ctx).await.unwrap();
        let persisted: AgentState = ctx
            .store
            .read_json(&DurableStore::task_key(&ctx.task_id, "state.json"))
            .await
            .unwrap();
        assert_eq!(persisted, result.state);
    }

    #[test]
    fn effective_temperature_prefers_override() {
        let mut descriptor = AgentDescriptor::new("t", "p");
        descriptor.llm.temperature = Some(0.7);
        assert_eq!(descriptor.effective_temperature(), Some(0.7));
        descriptor.temperature = Some(0.1);
        assert_eq!(descriptor.effective_temperature(), Some(0.1));
    }
}
