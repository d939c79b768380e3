// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Structured execution tracing.
//!
//! The tracer records every step, tool-call attempt, and sub-agent session
//! for a task, buffered in memory and flushed to the durable store after
//! every mutation. Step records within a task are in program order. The
//! tracer is the only consumer of sub-agent session info for the trace view;
//! the supervisor pushes summaries in.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::ids;
use crate::store::DurableStore;

/// Severity of a step record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Normal progress.
    Info,
    /// Recoverable problem (failed attempt, fallback taken).
    Warning,
    /// Step-level failure.
    Error,
}

/// One recorded tool-call attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    /// Server that ran (or was asked to run) the tool.
    pub server: String,
    /// Tool name.
    pub tool: String,
    /// Arguments passed.
    pub arguments: Value,
    /// Result payload on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error text on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall time of the attempt in milliseconds.
    pub duration_ms: u64,
}

/// One recorded execution step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Step identifier, e.g. `iteration`, `tool_attempt`, `node`.
    pub step_name: String,
    /// Free-text description.
    pub message: String,
    /// When the step was recorded.
    pub timestamp: DateTime<Utc>,
    /// Step severity.
    pub severity: Severity,
    /// Acting agent name.
    pub agent: String,
    /// Tool calls made during this step.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRecord>,
    /// Step duration in milliseconds.
    pub duration_ms: u64,
}

/// Summary of a sub-agent session, as surfaced to the trace view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Session id (UUIDv4).
    pub session_id: String,
    /// Sub-agent name.
    pub agent: String,
    /// Task description delegated to it.
    pub task: String,
    /// Summary returned to the supervisor, once the session ended.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Session status: `running`, `completed`, or `failed`.
    pub status: String,
    /// When the session opened.
    pub started_at: DateTime<Utc>,
    /// When the session ended.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

/// The persisted trace for one task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceLog {
    /// Owning task.
    pub task_id: String,
    /// Ordered step records.
    #[serde(default)]
    pub steps: Vec<StepRecord>,
    /// Sub-agent sessions keyed by session id.
    #[serde(default)]
    pub sub_agent_sessions: BTreeMap<String, SessionRecord>,
}

/// Append-only trace logger, flushed through the durable store.
pub struct Tracer {
    store: Arc<DurableStore>,
    trace: tokio::sync::Mutex<TraceLog>,
    key: String,
}

impl Tracer {
    /// Create a tracer for a task.
    #[must_use]
    pub fn new(store: Arc<DurableStore>, task_id: impl Into<String>) -> Self {
        let task_id = task_id.into();
        let key = DurableStore::task_key(&task_id, "trace.json");
        Self {
            store,
            trace: tokio::sync::Mutex::new(TraceLog {
                task_id,
                ..TraceLog::default()
            }),
            key,
        }
    }

    /// Create a tracer that continues an existing trace, if one is on disk.
    ///
    /// Used when a task is re-admitted (resume after an interrupt) so step
    /// records stay append-only across admissions.
    pub async fn load_or_new(store: Arc<DurableStore>, task_id: impl Into<String>) -> Self {
        let task_id = task_id.into();
        let key = DurableStore::task_key(&task_id, "trace.json");
        let trace = match store.read_json::<TraceLog>(&key).await {
            Ok(trace) => trace,
            Err(_) => TraceLog {
                task_id,
                ..TraceLog::default()
            },
        };
        Self {
            store,
            trace: tokio::sync::Mutex::new(trace),
            key,
        }
    }

    async fn flush(&self, trace: &TraceLog) {
        if let Err(e) = self.store.write_json(&self.key, trace).await {
            // Tracing must never take the task down.
            tracing::warn!(key = %self.key, error = %e, "failed to flush trace");
        }
    }

    /// Record an execution step and return the assigned record.
    pub async fn log_step(
        &self,
        step_name: &str,
        message: impl Into<String>,
        agent: &str,
        severity: Severity,
        tool_calls: Vec<ToolCallRecord>,
        duration_ms: u64,
    ) -> StepRecord {
        let step = StepRecord {
            step_name: step_name.to_string(),
            message: message.into(),
            timestamp: ids::now(),
            severity,
            agent: agent.to_string(),
            tool_calls,
            duration_ms,
        };
        let mut trace = self.trace.lock().await;
        trace.steps.push(step.clone());
        self.flush(&trace).await;
        step
    }

    /// Record a tool call, returning the record for attachment to a step.
    /// The tool manager logs one `tool_attempt` step per attempt, carrying
    /// the record built here.
    #[must_use]
    pub fn log_tool_call(
        server: &str,
        tool: &str,
        arguments: Value,
        result: Option<Value>,
        error: Option<String>,
        duration_ms: u64,
    ) -> ToolCallRecord {
        ToolCallRecord {
            server: server.to_string(),
            tool: tool.to_string(),
            arguments,
            result,
            error,
            duration_ms,
        }
    }

    /// Open a sub-agent session and return its id.
    pub async fn start_sub_agent_session(&self, agent: &str, task: &str) -> String {
        let session_id = ids::new_id();
        let record = SessionRecord {
            session_id: session_id.clone(),
            agent: agent.to_string(),
            task: task.to_string(),
            summary: None,
            status: "running".to_string(),
            started_at: ids::now(),
            ended_at: None,
        };
        let mut trace = self.trace.lock().await;
        trace.sub_agent_sessions.insert(session_id.clone(), record);
        self.flush(&trace).await;
        session_id
    }

    /// Close a sub-agent session with its summary and final status.
    pub async fn end_sub_agent_session(&self, session_id: &str, summary: &str, status: &str) {
        let mut trace = self.trace.lock().await;
        if let Some(record) = trace.sub_agent_sessions.get_mut(session_id) {
            record.summary = Some(summary.to_string());
            record.status = status.to_string();
            record.ended_at = Some(ids::now());
        } else {
            tracing::warn!(session_id, "end_sub_agent_session for unknown session");
        }
        self.flush(&trace).await;
    }

    /// A snapshot of the current trace.
    pub async fn snapshot(&self) -> TraceLog {
        self.trace.lock().await.clone()
    }

    /// Human-readable rendering of the trace.
    pub async fn pretty_print(&self) -> String {
        let trace = self.trace.lock().await;
        let mut out = String::new();
        let _ = writeln!(out, "Trace for task {}", trace.task_id);
        for (i, step) in trace.steps.iter().enumerate() {
            let _ = writeln!(
                out,
                "  [{i:>3}] {:<8} {:>6}ms {} ({}): {}",
                format!("{:?}", step.severity).to_lowercase(),
                step.duration_ms,
                step.step_name,
                step.agent,
                step.message
            );
            for call in &step.tool_calls {
                let outcome = match (&call.result, &call.error) {
                    (_, Some(err)) => format!("error: {err}"),
                    (Some(result), None) => format!("ok: {result}"),
                    (None, None) => "ok".to_string(),
                };
                let _ = writeln!(
                    out,
                    "        -> {}:{} {}ms {}",
                    call.server, call.tool, call.duration_ms, outcome
                );
            }
        }
        for session in trace.sub_agent_sessions.values() {
            let _ = writeln!(
                out,
                "  session {} agent={} status={} summary={}",
                session.session_id,
                session.agent,
                session.status,
                session.summary.as_deref().unwrap_or("-")
            );
        }
        out
    }
}

impl std::fmt::Debug for Tracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracer").field("key", &self.key).finish()
    }
}
