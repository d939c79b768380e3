// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The workflow engine: an explicit step function over the node graph.
//!
//! Each step executes one node and yields a [`StepOutcome`]: continue to a
//! successor, finish, or interrupt with a checkpoint. Interrupt-before nodes
//! (and human nodes) checkpoint *before* executing and return control to the
//! caller; resuming loads the checkpoint, applies any human-feedback delta
//! through the reducer registry, and continues starting from that node
//! without re-triggering the same interrupt.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::checkpoint::{Checkpoint, CheckpointStore, HumanFeedback};
use crate::constants::DEFAULT_REVIEW_DEADLINE;
use crate::error::{Error, Result};
use crate::ids::{self, Stopwatch};
use crate::messages::Message;
use crate::state::{AgentState, ReducerRegistry, StateDelta};
use crate::supervisor::Supervisor;
use crate::task::TaskContext;
use crate::tools::manager::ToolManager;
use crate::trace::Severity;
use crate::workflow::{EdgeTarget, NodeKind, WorkflowDefinition, END};

/// The result of one engine step.
#[derive(Debug)]
pub enum StepOutcome {
    /// Execution continues at `next`.
    Continue {
        /// Successor node.
        next: String,
        /// State after the step.
        state: AgentState,
    },
    /// The workflow reached the end.
    Done(AgentState),
    /// Execution halted at an interrupt point.
    Interrupt(Checkpoint),
}

/// The result of driving a workflow until it yields.
#[derive(Debug)]
pub enum WorkflowOutcome {
    /// Ran to the end.
    Completed(AgentState),
    /// Halted at a checkpoint; resume to continue.
    Interrupted(Checkpoint),
}

impl WorkflowOutcome {
    /// The final state, when completed.
    #[must_use]
    pub fn completed_state(&self) -> Option<&AgentState> {
        match self {
            WorkflowOutcome::Completed(state) => Some(state),
            WorkflowOutcome::Interrupted(_) => None,
        }
    }

    /// The checkpoint, when interrupted.
    #[must_use]
    pub fn interrupted_at(&self) -> Option<&Checkpoint> {
        match self {
            WorkflowOutcome::Completed(_) => None,
            WorkflowOutcome::Interrupted(checkpoint) => Some(checkpoint),
        }
    }
}

/// Executes a validated workflow over agents and tools.
pub struct WorkflowEngine {
    workflow: WorkflowDefinition,
    agents: HashMap<String, Arc<Supervisor>>,
    manager: Option<Arc<ToolManager>>,
    checkpoints: CheckpointStore,
    registry: ReducerRegistry,
    review_deadline: Duration,
}

impl WorkflowEngine {
    /// Build an engine, validating the definition.
    pub fn new(workflow: WorkflowDefinition, checkpoints: CheckpointStore) -> Result<Self> {
        workflow.validate()?;
        Ok(Self {
            workflow,
            agents: HashMap::new(),
            manager: None,
            checkpoints,
            registry: ReducerRegistry::default(),
            review_deadline: DEFAULT_REVIEW_DEADLINE,
        })
    }

    /// Bind an agent (or supervisor) by its name.
    #[must_use]
    pub fn with_agent(mut self, agent: Supervisor) -> Self {
        self.agents.insert(agent.name().to_string(), Arc::new(agent));
        self
    }

    /// Bind a shared agent.
    #[must_use]
    pub fn with_shared_agent(mut self, agent: Arc<Supervisor>) -> Self {
        self.agents.insert(agent.name().to_string(), agent);
        self
    }

    /// Attach the tool manager for tool nodes.
    #[must_use]
    pub fn with_tool_manager(mut self, manager: Arc<ToolManager>) -> Self {
        self.manager = Some(manager);
        self
    }

    /// Override the human-review deadline (default 24h).
    #[must_use]
    pub fn with_review_deadline(mut self, deadline: Duration) -> Self {
        self.review_deadline = deadline;
        self
    }

    /// The workflow definition.
    #[must_use]
    pub fn workflow(&self) -> &WorkflowDefinition {
        &self.workflow
    }

    /// The checkpoint store.
    #[must_use]
    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Run from the entry point until completion or the first interrupt.
    pub async fn run(
        &self,
        initial_state: AgentState,
        ctx: &TaskContext,
    ) -> Result<WorkflowOutcome> {
        self.drive(self.workflow.entry_point.clone(), initial_state, None, ctx)
            .await
    }

    /// Resume from a checkpoint, applying optional human feedback.
    ///
    /// Resuming with no feedback is transparent: execution continues exactly
    /// as if it had never been interrupted.
    pub async fn resume(
        &self,
        checkpoint_id: &str,
        feedback: Option<HumanFeedback>,
        ctx: &TaskContext,
    ) -> Result<WorkflowOutcome> {
        let checkpoint = self.checkpoints.load(checkpoint_id).await?;
        if checkpoint.is_expired(self.review_deadline, ids::now()) {
            return Err(Error::AwaitingHumanTimeout {
                task_id: checkpoint.task_id.clone(),
                deadline: self.review_deadline,
            });
        }

        let state = match feedback {
            Some(feedback) => feedback.apply(&self.registry, &checkpoint.state)?,
            None => checkpoint.state.clone(),
        };

        self.drive(
            checkpoint.position.clone(),
            state,
            Some(checkpoint.position.clone()),
            ctx,
        )
        .await
    }

    /// Drive the step function until it yields `Done` or `Interrupt`.
    async fn drive(
        &self,
        start: String,
        state: AgentState,
        skip_interrupt_for: Option<String>,
        ctx: &TaskContext,
    ) -> Result<WorkflowOutcome> {
        let mut node = start;
        let mut state = state;
        let mut skip = skip_interrupt_for;
        let mut iterations = 0u32;

        loop {
            if node == END {
                ctx.persist_state(&state).await?;
                return Ok(WorkflowOutcome::Completed(state));
            }

            iterations += 1;
            if iterations > self.workflow.max_iterations {
                return Err(Error::WorkflowIterationLimit {
                    workflow: self.workflow.name.clone(),
                    limit: self.workflow.max_iterations,
                });
            }
            if ctx.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let skip_this = skip.as_deref() == Some(node.as_str());
            skip = None;

            match self.step(&node, state, skip_this, ctx).await? {
                StepOutcome::Continue { next, state: new_state } => {
                    state = new_state;
                    node = next;
                }
                StepOutcome::Done(state) => {
                    ctx.persist_state(&state).await?;
                    return Ok(WorkflowOutcome::Completed(state));
                }
                StepOutcome::Interrupt(checkpoint) => {
                    return Ok(WorkflowOutcome::Interrupted(checkpoint));
                }
            }
        }
    }

    /// Execute one node (or interrupt before it) and pick the successor.
    ///
    /// `skip_interrupt` suppresses the interrupt check when resuming from a
    /// checkpoint taken at this node.
    pub async fn step(
        &self,
        node: &str,
        state: AgentState,
        skip_interrupt: bool,
        ctx: &TaskContext,
    ) -> Result<StepOutcome> {
        let def = self.workflow.nodes.get(node).ok_or_else(|| {
            Error::WorkflowValidation(format!("node '{node}' disappeared from the workflow"))
        })?;

        if self.workflow.should_interrupt(node) && !skip_interrupt {
            let checkpoint = self.checkpoints.save(&state, node, true).await?;
            ctx.persist_state(&state).await?;
            ctx.tracer
                .log_step(
                    "interrupt",
                    format!("interrupted before node '{node}'"),
                    &self.workflow.name,
                    Severity::Info,
                    vec![],
                    0,
                )
                .await;
            return Ok(StepOutcome::Interrupt(checkpoint));
        }

        let watch = Stopwatch::start();
        let state = match def.kind {
            NodeKind::Agent => {
                let name = def.agent.as_deref().unwrap_or_default();
                let agent = self
                    .agents
                    .get(name)
                    .ok_or_else(|| Error::AgentNotFound(name.to_string()))?;
                let result = agent.run(None, Some(state), ctx).await?;
                result.state
            }
            NodeKind::Tool => {
                let tool = def.tool.as_deref().unwrap_or_default();
                let manager = self.manager.as_ref().ok_or_else(|| {
                    Error::WorkflowValidation(format!(
                        "tool node '{node}' requires a tool manager"
                    ))
                })?;
                // Arguments come from the state's metadata map.
                let outcome = manager
                    .execute(
                        &self.workflow.name,
                        tool,
                        &state.metadata,
                        None,
                        &ctx.tracer,
                        &ctx.cancel,
                    )
                    .await?;
                self.registry.apply(
                    &state,
                    &StateDelta::new().message(Message::tool(outcome.text(), ids::new_id())),
                )?
            }
            // Condition nodes execute nothing; they only route. A human node
            // reached with its interrupt suppressed (resume) passes through.
            NodeKind::Condition | NodeKind::Human => state,
        };
        ctx.persist_state(&state).await?;
        ctx.tracer
            .log_step(
                "node",
                format!("executed node '{node}'"),
                &self.workflow.name,
                Severity::Info,
                vec![],
                watch.elapsed_ms(),
            )
            .await;

        let next = self.successor(node, def.kind, &state)?;
        if next == END {
            Ok(StepOutcome::Done(state))
        } else {
            Ok(StepOutcome::Continue { next, state })
        }
    }

    fn successor(&self, node: &str, kind: NodeKind, state: &AgentState) -> Result<String> {
        match self.workflow.outgoing(node) {
            None => Ok(END.to_string()),
            Some(edge) => match &edge.to {
                EdgeTarget::Direct(to) => Ok(to.clone()),
                EdgeTarget::Conditional(routes) => {
                    debug_assert_eq!(kind, NodeKind::Condition);
                    let key = state.routing_key.as_deref().ok_or_else(|| {
                        Error::WorkflowValidation(format!(
                            "condition node '{node}' reached with no routing key"
                        ))
                    })?;
                    routes.get(key).cloned().ok_or_else(|| {
                        Error::WorkflowValidation(format!(
                            "condition node '{node}' has no route for key '{key}'"
                        ))
                    })
                }
            },
        }
    }
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("workflow", &self.workflow.name)
            .field("agents", &self.agents.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Agent, AgentDescriptor};
    use crate::llm::{ChatResponse, ScriptedChatModel};
    use crate::store::DurableStore;
    use crate::workflow::{EdgeDef, NodeDef};
    use std::collections::BTreeMap;

    async fn context(task_id: &str) -> (tempfile::TempDir, Arc<DurableStore>, TaskContext) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DurableStore::new(dir.path()).unwrap());
        let ctx = TaskContext::new(task_id, Arc::clone(&store));
        (dir, store, ctx)
    }

    fn scripted_agent(name: &str, replies: Vec<ChatResponse>) -> Supervisor {
        Supervisor::new(Agent::new(
            AgentDescriptor::new(name, format!("You are {name}.")),
            Arc::new(ScriptedChatModel::new().with_responses(replies)),
        ))
    }

    fn review_workflow() -> WorkflowDefinition {
        WorkflowDefinition::new("plan-review-act", "plan")
            .with_node("plan", NodeDef::agent("planner"))
            .with_node("review", NodeDef::agent("reviewer").with_interrupt_before())
            .with_node("act", NodeDef::agent("actor"))
            .with_edge(EdgeDef::direct("plan", "review"))
            .with_edge(EdgeDef::direct("review", "act"))
            .with_edge(EdgeDef::direct("act", END))
    }

    async fn review_engine(store: Arc<DurableStore>, task_id: &str) -> WorkflowEngine {
        let checkpoints = CheckpointStore::open(store, task_id).await.unwrap();
        WorkflowEngine::new(review_workflow(), checkpoints)
            .unwrap()
            .with_agent(scripted_agent("planner", vec![ChatResponse::text("the plan")]))
            .with_agent(scripted_agent("reviewer", vec![ChatResponse::text("reviewed")]))
            .with_agent(scripted_agent("actor", vec![ChatResponse::text("acted")]))
    }

    #[tokio::test]
    async fn linear_workflow_runs_to_completion() {
        let (_dir, store, ctx) = context("wf-linear").await;
        let checkpoints = CheckpointStore::open(Arc::clone(&store), "wf-linear")
            .await
            .unwrap();
        let engine = WorkflowEngine::new(
            WorkflowDefinition::new("two-step", "a")
                .with_node("a", NodeDef::agent("first"))
                .with_node("b", NodeDef::agent("second"))
                .with_edge(EdgeDef::direct("a", "b"))
                .with_edge(EdgeDef::direct("b", END)),
            checkpoints,
        )
        .unwrap()
        .with_agent(scripted_agent("first", vec![ChatResponse::text("one")]))
        .with_agent(scripted_agent("second", vec![ChatResponse::text("two")]));

        let outcome = engine
            .run(AgentState::initial("first", Some("go")), &ctx)
            .await
            .unwrap();
        let state = outcome.completed_state().unwrap();
        assert_eq!(state.last_assistant_content(), Some("two"));
    }

    #[tokio::test]
    async fn interrupt_before_checkpoints_and_halts() {
        let (_dir, store, ctx) = context("wf-interrupt").await;
        let engine = review_engine(store, "wf-interrupt").await;

        let outcome = engine
            .run(AgentState::initial("planner", Some("make a plan")), &ctx)
            .await
            .unwrap();
        let checkpoint = outcome.interrupted_at().unwrap();
        assert_eq!(checkpoint.position, "review");
        assert!(checkpoint.awaiting_human);
        assert_eq!(checkpoint.sequence, 1);

        // No execution step record for the interrupted node or anything
        // after it; only "plan" ran.
        let trace = ctx.tracer.snapshot().await;
        assert!(!trace.steps.iter().any(|s| {
            s.step_name == "node"
                && (s.message.contains("'act'") || s.message.contains("'review'"))
        }));
        assert!(trace
            .steps
            .iter()
            .any(|s| s.step_name == "node" && s.message.contains("'plan'")));
    }

    #[tokio::test]
    async fn resume_continues_from_the_interrupted_node() {
        let (_dir, store, ctx) = context("wf-resume").await;
        let engine = review_engine(store, "wf-resume").await;

        let outcome = engine
            .run(AgentState::initial("planner", Some("make a plan")), &ctx)
            .await
            .unwrap();
        let checkpoint = outcome.interrupted_at().unwrap();

        let feedback = HumanFeedback::new("approve");
        let outcome = engine
            .resume(&checkpoint.id, Some(feedback), &ctx)
            .await
            .unwrap();
        let state = outcome.completed_state().unwrap();
        assert_eq!(state.last_assistant_content(), Some("acted"));
        // The feedback note is in the history.
        assert!(state
            .messages
            .iter()
            .any(|m| m.content == "Human feedback: approve"));
        // Both review and act ran after the resume.
        let trace = ctx.tracer.snapshot().await;
        assert!(trace.steps.iter().any(|s| s.message.contains("'review'")));
        assert!(trace.steps.iter().any(|s| s.message.contains("'act'")));
    }

    #[tokio::test]
    async fn resume_with_empty_feedback_is_transparent() {
        let (_dir, store, ctx) = context("wf-transparent").await;
        let engine = review_engine(store, "wf-transparent").await;

        let outcome = engine
            .run(AgentState::initial("planner", Some("plan")), &ctx)
            .await
            .unwrap();
        let checkpoint = outcome.interrupted_at().unwrap();
        let messages_at_interrupt = checkpoint.state.message_count();

        let outcome = engine.resume(&checkpoint.id, None, &ctx).await.unwrap();
        let state = outcome.completed_state().unwrap();
        // Only the review and act assistant replies were added; no feedback
        // message, no replayed history.
        assert_eq!(state.message_count(), messages_at_interrupt + 2);
    }

    #[tokio::test]
    async fn condition_node_routes_by_routing_key() {
        let (_dir, store, ctx) = context("wf-cond").await;
        let checkpoints = CheckpointStore::open(store, "wf-cond").await.unwrap();
        let workflow = WorkflowDefinition::new("router", "decide")
            .with_node("decide", NodeDef::condition())
            .with_node("yes", NodeDef::agent("optimist"))
            .with_node("no", NodeDef::agent("pessimist"))
            .with_edge(EdgeDef::conditional(
                "decide",
                BTreeMap::from([
                    ("approve".to_string(), "yes".to_string()),
                    ("reject".to_string(), "no".to_string()),
                ]),
            ))
            .with_edge(EdgeDef::direct("yes", END))
            .with_edge(EdgeDef::direct("no", END));
        let engine = WorkflowEngine::new(workflow, checkpoints)
            .unwrap()
            .with_agent(scripted_agent("optimist", vec![ChatResponse::text("yes!")]))
            .with_agent(scripted_agent("pessimist", vec![ChatResponse::text("no.")]));

        let mut state = AgentState::initial("router", Some("decide"));
        state.routing_key = Some("approve".to_string());
        let outcome = engine.run(state, &ctx).await.unwrap();
        assert_eq!(
            outcome.completed_state().unwrap().last_assistant_content(),
            Some("yes!")
        );
    }

    #[tokio::test]
    async fn missing_routing_key_fails_validation_error() {
        let (_dir, store, ctx) = context("wf-nokey").await;
        let checkpoints = CheckpointStore::open(store, "wf-nokey").await.unwrap();
        let workflow = WorkflowDefinition::new("router", "decide")
            .with_node("decide", NodeDef::condition())
            .with_node("yes", NodeDef::agent("optimist"))
            .with_edge(EdgeDef::conditional(
                "decide",
                BTreeMap::from([("approve".to_string(), "yes".to_string())]),
            ))
            .with_edge(EdgeDef::direct("yes", END));
        let engine = WorkflowEngine::new(workflow, checkpoints)
            .unwrap()
            .with_agent(scripted_agent("optimist", vec![ChatResponse::text("y")]));

        let err = engine
            .run(AgentState::initial("router", Some("x")), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WorkflowValidation(_)));
    }

    #[tokio::test]
    async fn expired_review_fails_with_awaiting_human_timeout() {
        let (_dir, store, ctx) = context("wf-expired").await;
        let engine = review_engine(store, "wf-expired")
            .await
            .with_review_deadline(Duration::from_millis(10));

        let outcome = engine
            .run(AgentState::initial("planner", Some("plan")), &ctx)
            .await
            .unwrap();
        let checkpoint = outcome.interrupted_at().unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        let err = engine
            .resume(&checkpoint.id, Some(HumanFeedback::new("approve")), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AwaitingHumanTimeout { .. }));
    }

    #[tokio::test]
    async fn human_node_checkpoints_with_awaiting_human() {
        let (_dir, store, ctx) = context("wf-human").await;
        let checkpoints = CheckpointStore::open(store, "wf-human").await.unwrap();
        let workflow = WorkflowDefinition::new("gate", "ask")
            .with_node("ask", NodeDef::human())
            .with_node("act", NodeDef::agent("actor"))
            .with_edge(EdgeDef::direct("ask", "act"))
            .with_edge(EdgeDef::direct("act", END));
        let engine = WorkflowEngine::new(workflow, checkpoints)
            .unwrap()
            .with_agent(scripted_agent("actor", vec![ChatResponse::text("done")]));

        let outcome = engine
            .run(AgentState::initial("gate", Some("go")), &ctx)
            .await
            .unwrap();
        let checkpoint = outcome.interrupted_at().unwrap();
        assert!(checkpoint.awaiting_human);
        assert_eq!(checkpoint.position, "ask");

        // Resume passes through the human node and completes.
        let outcome = engine
            .resume(&checkpoint.id, Some(HumanFeedback::new("approve")), &ctx)
            .await
            .unwrap();
        assert!(outcome.completed_state().is_some());
    }

    #[tokio::test]
    async fn iteration_cap_fails_the_workflow() {
        let (_dir, store, ctx) = context("wf-cap").await;
        let checkpoints = CheckpointStore::open(store, "wf-cap").await.unwrap();
        // Three nodes but a cap of 2.
        let workflow = WorkflowDefinition::new("long", "a")
            .with_node("a", NodeDef::agent("x"))
            .with_node("b", NodeDef::agent("x"))
            .with_node("c", NodeDef::agent("x"))
            .with_edge(EdgeDef::direct("a", "b"))
            .with_edge(EdgeDef::direct("b", "c"))
            .with_edge(EdgeDef::direct("c", END))
            .with_max_iterations(2);
        let engine = WorkflowEngine::new(workflow, checkpoints)
            .unwrap()
            .with_agent(scripted_agent(
                "x",
                vec![
                    ChatResponse::text("1"),
                    ChatResponse::text("2"),
                    ChatResponse::text("3"),
                ],
            ));

        let err = engine
            .run(AgentState::initial("x", Some("go")), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WorkflowIterationLimit { limit: 2, .. }));
    }
}
