// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Error types for the execution core.
//!
//! Every failure carries a kind tag plus the structured fields needed by the
//! recovery layers: the tool manager retries [`Error::is_retryable`] failures
//! and falls back on [`Error::is_fallback_eligible`] ones, the agent loop
//! recovers from [`ErrorKind::ContextLimit`], and everything else propagates
//! to the owning task, which persists an [`ErrorRecord`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable tag identifying the class of a failure.
///
/// Persisted inside [`ErrorRecord`] so that trace consumers and tests can
/// match on failure classes without parsing message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A tool or LLM call exceeded its deadline. Transient.
    Timeout,
    /// A transport connection dropped mid-flight. Transient.
    ConnectionLost,
    /// The remote service asked us to slow down. Transient.
    RateLimited,
    /// A tool ran and reported failure. Eligible for fallback.
    ToolExecution,
    /// The LLM rejected the prompt as too large. Recovered by trimming.
    ContextLimit,
    /// Progressive trimming hit the floor and the model still overflowed.
    ContextExhausted,
    /// The agent hit its iteration cap while still requesting tools.
    IterationExhausted,
    /// Tool input did not match the tool's declared schema.
    SchemaViolation,
    /// The calling agent's allow-list does not include the tool.
    AccessDenied,
    /// No server owns the tool, even after the unique-match correction.
    ToolNotFound,
    /// The dependency graph (or a workflow) contains a cycle.
    CycleDetected,
    /// A workflow definition failed validation or routing.
    WorkflowValidation,
    /// A human-review checkpoint outlived its wall-clock deadline.
    AwaitingHumanTimeout,
    /// The durable store failed at the I/O level. Fatal.
    Store,
    /// A checkpoint could not be decoded. Fatal for the owning task.
    CheckpointCorrupted,
    /// The operation was cancelled. Terminal, never retried.
    Cancelled,
    /// Anything else.
    Internal,
}

/// Execution-core error type.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum Error {
    /// A tool call exceeded its per-tool timeout.
    #[error("tool '{server}:{tool}' timed out after {timeout:?}")]
    ToolTimeout {
        /// Server that owned the call.
        server: String,
        /// Tool name.
        tool: String,
        /// The deadline that was exceeded.
        timeout: Duration,
    },

    /// An LLM chat call exceeded the configured LLM timeout.
    #[error("LLM call timed out after {0:?}")]
    LlmTimeout(Duration),

    /// Waiting for a task result exceeded the caller's deadline.
    #[error("timed out waiting for task '{task_id}' after {timeout:?}")]
    ResultTimeout {
        /// The task that did not finish in time.
        task_id: String,
        /// The caller's deadline.
        timeout: Duration,
    },

    /// The transport to a server dropped while requests were in flight.
    #[error("connection to server '{server}' lost: {reason}")]
    ConnectionLost {
        /// Server whose transport failed.
        server: String,
        /// What the transport observed.
        reason: String,
    },

    /// The remote side signalled a rate limit.
    #[error("rate limited by '{server}': {reason}")]
    RateLimited {
        /// Server or service that pushed back.
        server: String,
        /// The limit message.
        reason: String,
    },

    /// A tool executed and reported an error result.
    #[error("tool '{server}:{tool}' failed on attempt {attempt}: {reason}")]
    ToolExecution {
        /// Server that ran the tool.
        server: String,
        /// Tool name.
        tool: String,
        /// 1-based attempt number within the retry loop.
        attempt: u32,
        /// The error content returned by the tool.
        reason: String,
    },

    /// The LLM rejected the prompt as exceeding its context window.
    #[error("LLM context limit exceeded: {reason}")]
    ContextLimit {
        /// The provider's description of the overflow.
        reason: String,
    },

    /// Context-limit recovery trimmed down to the floor and still failed.
    #[error("context exhausted: prompt trimmed to {floor} messages and the model still overflows")]
    ContextExhausted {
        /// The message floor that was reached (system + latest).
        floor: usize,
    },

    /// The agent reached its iteration cap on a still-tool-calling response.
    #[error("agent '{agent}' exhausted {limit} iterations without completing")]
    IterationExhausted {
        /// Agent that hit the cap.
        agent: String,
        /// The configured maximum.
        limit: u32,
    },

    /// A workflow run exceeded its global iteration cap.
    #[error("workflow '{workflow}' exceeded its iteration cap of {limit}")]
    WorkflowIterationLimit {
        /// Workflow name.
        workflow: String,
        /// The configured cap.
        limit: u32,
    },

    /// Tool arguments violated the tool's input schema.
    #[error("input for tool '{tool}' violates its schema: {violations}")]
    SchemaViolation {
        /// Tool whose schema rejected the input.
        tool: String,
        /// Joined validation errors.
        violations: String,
    },

    /// The calling agent is not allowed to use the tool.
    #[error("agent '{agent}' is not allowed to call tool '{tool}'")]
    AccessDenied {
        /// Calling agent.
        agent: String,
        /// Refused tool.
        tool: String,
    },

    /// The tool could not be resolved to a unique owning server.
    #[error("tool '{tool}' not found ({candidates} candidate servers)")]
    ToolNotFound {
        /// The unresolved tool name.
        tool: String,
        /// How many servers claimed the name (0 or more than 1).
        candidates: usize,
    },

    /// A server name was not present in the registry.
    #[error("server '{0}' not found")]
    ServerNotFound(String),

    /// An agent name was not present in the registry.
    #[error("agent '{0}' not found")]
    AgentNotFound(String),

    /// A task id was not found in memory or in the durable store.
    #[error("task '{0}' not found")]
    TaskNotFound(String),

    /// A checkpoint id did not resolve to a stored checkpoint.
    #[error("checkpoint '{0}' not found")]
    CheckpointNotFound(String),

    /// The dependency graph contains a cycle.
    #[error("cycle detected in dependency graph: {path}")]
    CycleDetected {
        /// The cycle members, joined with " -> ".
        path: String,
    },

    /// A workflow definition failed validation, or routing failed at runtime.
    #[error("workflow validation failed: {0}")]
    WorkflowValidation(String),

    /// A human-review checkpoint outlived its deadline.
    #[error("human review for task '{task_id}' timed out after {deadline:?}")]
    AwaitingHumanTimeout {
        /// Task whose review expired.
        task_id: String,
        /// The configured deadline.
        deadline: Duration,
    },

    /// The durable store failed at the I/O level.
    #[error("durable store I/O failure at '{path}': {source}")]
    Store {
        /// Path or key involved.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A checkpoint file exists but could not be decoded.
    #[error("checkpoint '{checkpoint_id}' for task '{task_id}' is corrupted: {reason}")]
    CheckpointCorrupted {
        /// The unreadable checkpoint.
        checkpoint_id: String,
        /// Owning task.
        task_id: String,
        /// Decoder error text.
        reason: String,
    },

    /// Sub-agent delegation exceeded the recursion cap.
    #[error("sub-agent recursion depth {depth} exceeds cap of {cap}")]
    RecursionDepthExceeded {
        /// The depth that was requested.
        depth: u32,
        /// The configured cap.
        cap: u32,
    },

    /// A JSON-RPC or event-stream protocol violation.
    #[error("protocol error on server '{server}': {reason}")]
    Protocol {
        /// Offending server.
        server: String,
        /// What was malformed.
        reason: String,
    },

    /// The LLM call failed for a non-context, non-timeout reason.
    #[error("LLM call failed: {0}")]
    Llm(String),

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// Serialization failure for a persisted or wire value.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal invariant violation.
    #[error("{0}")]
    Internal(String),
}

/// Result type for execution-core operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The stable kind tag for this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ToolTimeout { .. } | Error::LlmTimeout(_) | Error::ResultTimeout { .. } => {
                ErrorKind::Timeout
            }
            Error::ConnectionLost { .. } => ErrorKind::ConnectionLost,
            Error::RateLimited { .. } => ErrorKind::RateLimited,
            Error::ToolExecution { .. } => ErrorKind::ToolExecution,
            Error::ContextLimit { .. } => ErrorKind::ContextLimit,
            Error::ContextExhausted { .. } => ErrorKind::ContextExhausted,
            Error::IterationExhausted { .. } => ErrorKind::IterationExhausted,
            Error::SchemaViolation { .. } => ErrorKind::SchemaViolation,
            Error::AccessDenied { .. } => ErrorKind::AccessDenied,
            Error::ToolNotFound { .. } | Error::ServerNotFound(_) => ErrorKind::ToolNotFound,
            Error::CycleDetected { .. } => ErrorKind::CycleDetected,
            Error::WorkflowValidation(_) | Error::WorkflowIterationLimit { .. } => {
                ErrorKind::WorkflowValidation
            }
            Error::AwaitingHumanTimeout { .. } => ErrorKind::AwaitingHumanTimeout,
            Error::Store { .. } => ErrorKind::Store,
            Error::CheckpointCorrupted { .. } => ErrorKind::CheckpointCorrupted,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::RecursionDepthExceeded { .. }
            | Error::AgentNotFound(_)
            | Error::TaskNotFound(_)
            | Error::CheckpointNotFound(_)
            | Error::Serialization(_)
            | Error::Internal(_) => ErrorKind::Internal,
            Error::Protocol { .. } => ErrorKind::ConnectionLost,
            Error::Llm(_) => ErrorKind::Internal,
        }
    }

    /// True if the manager should retry the same call with backoff.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Timeout | ErrorKind::ConnectionLost | ErrorKind::RateLimited
        )
    }

    /// True if the manager should consult the tool's fallback list.
    ///
    /// Fallback-eligible failures are first retried on the same tool; only
    /// persistent failure moves the attempt list forward.
    #[must_use]
    pub fn is_fallback_eligible(&self) -> bool {
        matches!(self.kind(), ErrorKind::ToolExecution) || self.is_retryable()
    }

    /// Convert into a persistable record with optional context.
    #[must_use]
    pub fn record(&self) -> ErrorRecord {
        ErrorRecord {
            kind: self.kind(),
            message: self.to_string(),
            task_id: None,
            node: None,
            tool: match self {
                Error::ToolTimeout { tool, .. }
                | Error::ToolExecution { tool, .. }
                | Error::SchemaViolation { tool, .. }
                | Error::AccessDenied { tool, .. }
                | Error::ToolNotFound { tool, .. } => Some(tool.clone()),
                _ => None,
            },
            attempt: match self {
                Error::ToolExecution { attempt, .. } => Some(*attempt),
                _ => None,
            },
        }
    }
}

/// Structured, persistable rendering of an [`Error`].
///
/// Stored on failed tasks so that observable properties (kind, failing node
/// or tool, attempt number) survive serialization; a free-text message alone
/// is not enough.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Failure class.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Owning task, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Failing workflow node, when the failure happened inside a workflow.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    /// Failing tool, when the failure happened inside a tool dispatch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    /// Attempt number, when the failure came out of the retry loop.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
}

impl ErrorRecord {
    /// Attach the owning task id.
    #[must_use]
    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// Attach the failing workflow node.
    #[must_use]
    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }
}
