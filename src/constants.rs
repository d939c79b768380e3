// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Centralized constants for timeouts, retry policy, and execution caps.
//!
//! Every tunable default lives here so that call sites never embed magic
//! numbers. Builders on the owning types override these per instance.

use std::time::Duration;

/// Maximum number of concurrently running tasks admitted by the orchestrator.
pub const DEFAULT_MAX_CONCURRENT: usize = 100;

/// Default per-tool execution timeout.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(300);

/// Default timeout for a single LLM chat call. Exceeding it is retryable.
pub const DEFAULT_LLM_TIMEOUT: Duration = Duration::from_secs(120);

/// Default wall-clock limit for a human-review checkpoint before the task
/// fails with an awaiting-human-timeout error.
pub const DEFAULT_REVIEW_DEADLINE: Duration = Duration::from_secs(24 * 60 * 60);

/// Default timeout for `get_task_result` when none is supplied.
pub const DEFAULT_RESULT_TIMEOUT: Duration = Duration::from_secs(300);

// Retry policy for transient tool failures.

/// Maximum attempts per tool (initial call plus retries).
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Initial backoff delay before the first retry.
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Multiplier applied to the delay after each failed attempt.
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;

/// Proportional jitter applied to every backoff delay (plus or minus).
pub const DEFAULT_RETRY_JITTER: f64 = 0.2;

/// Upper bound on any single backoff delay.
pub const DEFAULT_RETRY_MAX_DELAY: Duration = Duration::from_secs(60);

// Agent and workflow execution caps.

/// Default maximum reasoning iterations for an agent.
pub const DEFAULT_AGENT_ITERATIONS: u32 = 10;

/// Default global iteration cap for a workflow run.
pub const DEFAULT_WORKFLOW_ITERATIONS: u32 = 50;

/// Default character budget for a sub-agent summary surfaced to a supervisor.
pub const DEFAULT_SUMMARY_BUDGET: usize = 2000;

/// Default maximum sub-agent delegation depth.
pub const DEFAULT_DELEGATION_DEPTH: u32 = 3;

/// Floor for context-limit recovery: system prompt plus the latest message.
pub const CONTEXT_TRIM_FLOOR: usize = 2;

// Event-stream transport tuning.

/// Idle interval after which the event-stream transport probes the server.
pub const SSE_KEEPALIVE_IDLE: Duration = Duration::from_secs(20);

/// Initial reconnect backoff for the event-stream transport.
pub const SSE_RECONNECT_BASE: Duration = Duration::from_secs(1);

/// Cap on the event-stream reconnect backoff.
pub const SSE_RECONNECT_CAP: Duration = Duration::from_secs(30);

/// How long a request waits for the server's `endpoint` event before failing.
pub const SSE_ENDPOINT_WAIT: Duration = Duration::from_secs(10);

// Protocol and persistence.

/// Tool protocol version sent during the `initialize` handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Default number of days a finished task's directory is retained.
pub const DEFAULT_RETENTION_DAYS: u32 = 7;
