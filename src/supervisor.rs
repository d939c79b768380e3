// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Sub-agent supervision with isolated sessions.
//!
//! A supervisor is an agent whose model additionally sees one synthetic tool
//! per sub-agent, named `delegate_<agent>`. When the model calls one, the
//! supervisor opens a session via the tracer, builds a fresh state holding
//! only the delegated task, runs the sub-agent to completion, and returns
//! the truncated last assistant message as the tool result. The sub-agent's
//! message history never enters the parent state. Sub-agents may themselves
//! be supervisors; delegation depth is capped.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::agent::{Agent, AgentRunResult, Delegator};
use crate::constants::{DEFAULT_DELEGATION_DEPTH, DEFAULT_SUMMARY_BUDGET};
use crate::error::{Error, Result};
use crate::llm::ToolDefinition;
use crate::messages::{Message, ToolCall};
use crate::state::AgentState;
use crate::task::TaskContext;

/// Prefix of synthetic delegation tool names.
pub const DELEGATE_PREFIX: &str = "delegate_";

/// An isolated sub-agent execution, as tracked by the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubAgentSession {
    /// Session id (UUIDv4).
    pub session_id: String,
    /// Task that spawned the delegation.
    pub parent_task_id: String,
    /// Sub-agent name.
    pub agent_name: String,
    /// Task description given to the sub-agent.
    pub task_description: String,
    /// The sub-agent's own message history. Never merged into the parent.
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Summary surfaced to the supervisor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// `running`, `completed`, or `failed`.
    pub status: String,
}

impl SubAgentSession {
    /// Open a session for a delegation.
    #[must_use]
    pub fn open(
        session_id: impl Into<String>,
        parent_task_id: impl Into<String>,
        agent_name: impl Into<String>,
        task_description: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            parent_task_id: parent_task_id.into(),
            agent_name: agent_name.into(),
            task_description: task_description.into(),
            messages: Vec::new(),
            summary: None,
            status: "running".to_string(),
        }
    }

    /// Close the session successfully.
    pub fn complete(&mut self, summary: impl Into<String>) {
        self.summary = Some(summary.into());
        self.status = "completed".to_string();
    }

    /// Close the session as failed.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.summary = Some(reason.into());
        self.status = "failed".to_string();
    }
}

/// An agent with a roster of sub-agents it can delegate to.
///
/// A supervisor with an empty roster behaves exactly like its bare agent.
pub struct Supervisor {
    agent: Agent,
    sub_agents: HashMap<String, Arc<Supervisor>>,
    summary_budget: usize,
    max_depth: u32,
}

impl Supervisor {
    /// Wrap an agent with no sub-agents.
    #[must_use]
    pub fn new(agent: Agent) -> Self {
        Self {
            agent,
            sub_agents: HashMap::new(),
            summary_budget: DEFAULT_SUMMARY_BUDGET,
            max_depth: DEFAULT_DELEGATION_DEPTH,
        }
    }

    /// Set the summary character budget.
    #[must_use]
    pub fn with_summary_budget(mut self, budget: usize) -> Self {
        self.summary_budget = budget;
        self
    }

    /// Set the delegation depth cap.
    #[must_use]
    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Add a sub-agent, keyed by its agent name.
    #[must_use]
    pub fn with_sub_agent(mut self, sub: Supervisor) -> Self {
        self.sub_agents
            .insert(sub.name().to_string(), Arc::new(sub));
        self
    }

    /// This supervisor's agent name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.agent.descriptor().name
    }

    /// The wrapped agent's descriptor.
    #[must_use]
    pub fn descriptor(&self) -> &crate::agent::AgentDescriptor {
        self.agent.descriptor()
    }

    /// Names of the registered sub-agents.
    #[must_use]
    pub fn sub_agent_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.sub_agents.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Run to completion on a fresh or supplied state.
    pub async fn run(
        &self,
        task: Option<&str>,
        initial_state: Option<AgentState>,
        ctx: &TaskContext,
    ) -> Result<AgentRunResult> {
        self.run_at_depth(task, initial_state, ctx, 0).await
    }

    async fn run_at_depth(
        &self,
        task: Option<&str>,
        initial_state: Option<AgentState>,
        ctx: &TaskContext,
        depth: u32,
    ) -> Result<AgentRunResult> {
        if self.sub_agents.is_empty() {
            return self
                .agent
                .run_with_delegation(task, initial_state, ctx, None, depth)
                .await;
        }
        let hook = DelegationHook { supervisor: self };
        self.agent
            .run_with_delegation(task, initial_state, ctx, Some(&hook), depth)
            .await
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("name", &self.name())
            .field("sub_agents", &self.sub_agent_names())
            .field("max_depth", &self.max_depth)
            .finish_non_exhaustive()
    }
}

struct DelegationHook<'a> {
    supervisor: &'a Supervisor,
}

#[async_trait]
impl Delegator for DelegationHook<'_> {
    fn synthetic_tools(&self) -> Vec<ToolDefinition> {
        let mut names: Vec<&String> = self.supervisor.sub_agents.keys().collect();
        names.sort();
        names
            .into_iter()
            .map(|name| {
                let role = &self.supervisor.sub_agents[name].descriptor().role;
                let description = if role.is_empty() {
                    format!("Delegate a task to the {name} agent")
                } else {
                    format!("Delegate a task to the {name} agent: {role}")
                };
                ToolDefinition {
                    name: format!("{DELEGATE_PREFIX}{name}"),
                    description,
                    parameters: json!({
                        "type": "object",
                        "properties": {
                            "task": {
                                "type": "string",
                                "description": "Task description for the sub-agent"
                            }
                        },
                        "required": ["task"]
                    }),
                }
            })
            .collect()
    }

    fn owns(&self, tool: &str) -> bool {
        tool.strip_prefix(DELEGATE_PREFIX)
            .is_some_and(|name| self.supervisor.sub_agents.contains_key(name))
    }

    async fn delegate(&self, call: &ToolCall, ctx: &TaskContext, depth: u32) -> Result<String> {
        let name = call
            .tool
            .strip_prefix(DELEGATE_PREFIX)
            .unwrap_or(call.tool.as_str());
        let Some(sub) = self.supervisor.sub_agents.get(name) else {
            return Ok(format!("Error: unknown sub-agent '{name}'"));
        };

        let next_depth = depth + 1;
        if next_depth > self.supervisor.max_depth {
            return Err(Error::RecursionDepthExceeded {
                depth: next_depth,
                cap: self.supervisor.max_depth,
            });
        }

        let task = call
            .arguments
            .get("task")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        let session_id = ctx.tracer.start_sub_agent_session(name, &task).await;
        let mut session = SubAgentSession::open(&session_id, &ctx.task_id, name, &task);
        tracing::info!(
            session_id = %session_id,
            agent = name,
            depth = next_depth,
            "sub-agent session opened"
        );

        // A fresh, independent state: the sub-agent never sees (or touches)
        // the parent's history. Its message sequence lives on the session
        // record and nowhere else.
        match sub.run_at_depth(Some(&task), None, ctx, next_depth).await {
            Ok(result) => {
                session.messages = result.state.messages;
                session.complete(truncate_summary(
                    &result.output,
                    self.supervisor.summary_budget,
                ));
                let summary = session.summary.clone().unwrap_or_default();
                ctx.tracer
                    .end_sub_agent_session(&session_id, &summary, &session.status)
                    .await;
                Ok(summary)
            }
            Err(Error::Cancelled) => {
                session.fail("cancelled");
                ctx.tracer
                    .end_sub_agent_session(&session_id, "cancelled", &session.status)
                    .await;
                Err(Error::Cancelled)
            }
            Err(e) => {
                session.fail(truncate_summary(
                    &e.to_string(),
                    self.supervisor.summary_budget,
                ));
                let summary = session.summary.clone().unwrap_or_default();
                ctx.tracer
                    .end_sub_agent_session(&session_id, &summary, &session.status)
                    .await;
                Err(e)
            }
        }
    }
}

/// Truncate a summary to the configured character budget.
fn truncate_summary(text: &str, budget: usize) -> String {
    if text.chars().count() <= budget {
        text.to_string()
    } else {
        text.chars().take(budget).collect()
    }
}
