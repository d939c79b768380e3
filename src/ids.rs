// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Identifier and time service.
//!
//! All identifiers in the core are UUIDv4, lowercase with dashes. Timestamps
//! are UTC and serialize as RFC 3339. Durations for step timing come from a
//! monotonic clock, never from wall-clock subtraction.

use chrono::{DateTime, Utc};
use std::time::Instant;
use uuid::Uuid;

/// Generate a new UUIDv4 identifier (lowercase, dashed).
#[must_use]
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Current UTC wall-clock time.
#[must_use]
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// A monotonic stopwatch for measuring step and tool-call durations.
#[derive(Debug, Clone, Copy)]
pub struct Stopwatch {
    started: Instant,
}

impl Stopwatch {
    /// Start timing now.
    #[must_use]
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    /// Elapsed time in whole milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}
