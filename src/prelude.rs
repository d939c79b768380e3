// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Convenience re-exports for common usage.
//!
//! ```rust,ignore
//! use dashagent::prelude::*;
//! ```

pub use crate::agent::{Agent, AgentDescriptor, AgentRunResult};
pub use crate::checkpoint::{Checkpoint, CheckpointStore, HumanFeedback};
pub use crate::dag::{BatchTaskOutcome, DagScheduler, DependencyAnalyzer, TaskSpec};
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::llm::{ChatModel, ChatResponse, LlmSettings, ToolDefinition};
pub use crate::messages::{Message, Role, ToolCall};
pub use crate::orchestrator::{Orchestrator, OrchestratorConfig, WorkflowSpec};
pub use crate::state::{AgentState, ReducerRegistry, StateDelta};
pub use crate::store::DurableStore;
pub use crate::supervisor::Supervisor;
pub use crate::task::{Task, TaskContext, TaskStatus};
pub use crate::tools::manager::ToolManager;
pub use crate::tools::{ServerDescriptor, ToolDescriptor, TransportKind};
pub use crate::trace::Tracer;
pub use crate::workflow::engine::{WorkflowEngine, WorkflowOutcome};
pub use crate::workflow::{EdgeDef, NodeDef, WorkflowDefinition, END};
