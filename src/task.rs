// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Task lifecycle records and the per-task execution context.
//!
//! A [`Task`] is a unit of work owned by the orchestrator; it is the only
//! component that mutates one, and it persists the record on every status
//! transition. [`TaskContext`] bundles the collaborators every runner needs:
//! the durable store, the tracer, and the cancellation token. No component
//! reaches for process-wide singletons.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::constants::DEFAULT_RETENTION_DAYS;
use crate::error::{ErrorRecord, Result};
use crate::ids;
use crate::state::AgentState;
use crate::store::DurableStore;
use crate::trace::Tracer;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Submitted, waiting for admission.
    Pending,
    /// Admitted and executing.
    Running,
    /// Finished with a result.
    Completed,
    /// Finished with an error.
    Failed,
}

impl TaskStatus {
    /// Whether this status is terminal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// A unit of work tracked by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier (UUIDv4).
    pub id: String,
    /// Human-readable description.
    pub description: String,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// Name of the runner (agent or workflow) assigned to it.
    pub assigned_agent: String,
    /// Parent task, for work spawned by another task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,
    /// Result payload once completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Structured error once failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Admission timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Days the task directory is retained after completion.
    pub retention_days: u32,
}

impl Task {
    /// Create a pending task with a fresh id.
    #[must_use]
    pub fn new(description: impl Into<String>, assigned_agent: impl Into<String>) -> Self {
        Self {
            id: ids::new_id(),
            description: description.into(),
            status: TaskStatus::Pending,
            assigned_agent: assigned_agent.into(),
            parent_task_id: None,
            result: None,
            error: None,
            created_at: ids::now(),
            started_at: None,
            completed_at: None,
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }

    /// Transition to running.
    pub fn mark_running(&mut self) {
        self.status = TaskStatus::Running;
        self.started_at = Some(ids::now());
    }

    /// Transition to completed with a result payload.
    pub fn mark_completed(&mut self, result: impl Into<String>) {
        self.status = TaskStatus::Completed;
        self.result = Some(result.into());
        self.completed_at = Some(ids::now());
    }

    /// Transition to failed with a structured error.
    pub fn mark_failed(&mut self, error: ErrorRecord) {
        self.status = TaskStatus::Failed;
        self.error = Some(error);
        self.completed_at = Some(ids::now());
    }

    /// Wall-clock duration, once terminal.
    #[must_use]
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.completed_at? - self.started_at?)
    }
}

/// Collaborators threaded through a single task's execution.
#[derive(Clone)]
pub struct TaskContext {
    /// Owning task id.
    pub task_id: String,
    /// Durable store shared across tasks.
    pub store: Arc<DurableStore>,
    /// This task's tracer.
    pub tracer: Arc<Tracer>,
    /// Cancellation handle for this task.
    pub cancel: CancellationToken,
}

impl TaskContext {
    /// Build a context for a task, creating its tracer.
    #[must_use]
    pub fn new(task_id: impl Into<String>, store: Arc<DurableStore>) -> Self {
        let task_id = task_id.into();
        let tracer = Arc::new(Tracer::new(Arc::clone(&store), task_id.clone()));
        Self {
            task_id,
            store,
            tracer,
            cancel: CancellationToken::new(),
        }
    }

    /// Persist the latest state snapshot for this task.
    ///
    /// Called after every state mutation, before progress is acknowledged.
    pub async fn persist_state(&self, state: &AgentState) -> Result<()> {
        self.store
            .write_json(&DurableStore::task_key(&self.task_id, "state.json"), state)
            .await
    }

    /// Persist the task record itself.
    pub async fn persist_task(&self, task: &Task) -> Result<()> {
        self.store
            .write_json(&DurableStore::task_key(&self.task_id, "task.json"), task)
            .await
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("task_id", &self.task_id)
            .finish_non_exhaustive()
    }
}
