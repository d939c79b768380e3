// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

#![warn(missing_docs)]

//! # `DashAgent` - Execution core for multi-agent orchestration
//!
//! `DashAgent` drives LLM-based agents through bounded reasoning loops,
//! coordinates their tool invocations over a JSON-RPC tool protocol,
//! schedules tasks across a concurrency-limited pool with dependency-aware
//! parallelism, and composes workflows as directed graphs with interrupts,
//! checkpoints, and fault tolerance.
//!
//! ## Key Concepts
//!
//! - **[`AgentState`](state::AgentState)**: the conversation plus routing
//!   metadata, updated only through registered per-field mergers
//! - **[`Agent`](agent::Agent)**: one reasoning loop: chat, append, run
//!   tool calls sequentially, repeat until the model stops calling tools
//! - **[`Supervisor`](supervisor::Supervisor)**: an agent whose model sees
//!   synthetic `delegate_*` tools that run sub-agents in isolated sessions
//! - **[`ToolManager`](tools::manager::ToolManager)**: discovery, dispatch,
//!   retry, and fallback over stdio and event-stream transports
//! - **[`WorkflowEngine`](workflow::engine::WorkflowEngine)**: a step
//!   function over typed nodes with interrupt-before checkpoints and resume
//! - **[`Orchestrator`](orchestrator::Orchestrator)**: FIFO admission under
//!   a concurrency cap, with persisted task lifecycle
//! - **[`DagScheduler`](dag::DagScheduler)**: produces/consumes extraction,
//!   topological layering, layer-parallel submission
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use dashagent::prelude::*;
//!
//! let store = Arc::new(DurableStore::new("./state")?);
//! let orchestrator = Orchestrator::start(store, OrchestratorConfig::default());
//!
//! let agent = Agent::new(
//!     AgentDescriptor::new("researcher", "You research things."),
//!     model,
//! );
//! orchestrator.register_agent(Supervisor::new(agent));
//!
//! let task_id = orchestrator.submit("capital of France?", "researcher").await?;
//! let task = orchestrator.get_task_result(&task_id, None).await?;
//! println!("{}", task.result.unwrap_or_default());
//! ```

pub mod agent;
pub mod checkpoint;
pub mod constants;
pub mod dag;
pub mod error;
pub mod ids;
pub mod llm;
pub mod messages;
pub mod orchestrator;
pub mod reducer;
pub mod retry;
pub mod state;
pub mod store;
pub mod supervisor;
pub mod task;
pub mod tools;
pub mod trace;
pub mod transport;
pub mod workflow;

pub use agent::{Agent, AgentDescriptor, AgentRunResult};
pub use checkpoint::{Checkpoint, CheckpointStore, HumanFeedback};
pub use dag::{
    BatchTaskOutcome, DagScheduler, DependencyAnalyzer, DependencyGraph, TaskDependency, TaskSpec,
};
pub use error::{Error, ErrorKind, ErrorRecord, Result};
pub use llm::{ChatModel, ChatResponse, LlmSettings, ScriptedChatModel, ToolDefinition};
pub use messages::{Message, Role, ToolCall};
pub use orchestrator::{Orchestrator, OrchestratorConfig, WorkflowSpec};
pub use reducer::{AppendMessagesReducer, Reducer};
pub use retry::RetryPolicy;
pub use state::{AgentState, ReducerRegistry, StateDelta};
pub use store::DurableStore;
pub use supervisor::{SubAgentSession, Supervisor, DELEGATE_PREFIX};
pub use task::{Task, TaskContext, TaskStatus};
pub use tools::manager::ToolManager;
pub use tools::{ServerDescriptor, ToolDescriptor, ToolOverride, TransportKind};
pub use trace::{Severity, StepRecord, ToolCallRecord, TraceLog, Tracer};
pub use transport::{DiscoveredTool, ToolOutcome, Transport};
pub use workflow::engine::{StepOutcome, WorkflowEngine, WorkflowOutcome};
pub use workflow::{EdgeDef, EdgeTarget, NodeDef, NodeKind, WorkflowDefinition, END};

// Prelude for common imports in production code.
pub mod prelude;
