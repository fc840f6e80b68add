// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Span helpers for consistent instrumentation.

use std::path::Path;
use std::time::Instant;

use tracing::{info_span, Span};

use crate::agent::{AgentId, AgentRole};

/// RAII guard for timing one agent turn.
///
/// Records the role, duration and success/failure to metrics.
pub struct TurnSpan {
    role: AgentRole,
    start: Instant,
    span: Span,
}

impl TurnSpan {
    /// Start a new turn span.
    pub fn start(agent: AgentId, role: AgentRole, scope: &Path) -> Self {
        let span = info_span!(
            "turn",
            agent = %agent,
            role = %role,
            scope = %scope.display(),
            duration_ms = tracing::field::Empty,
            success = tracing::field::Empty,
            directives = tracing::field::Empty,
        );

        Self {
            role,
            start: Instant::now(),
            span,
        }
    }

    /// Get the underlying tracing span.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Record how many directives the reply contained.
    pub fn record_directives(&self, count: usize) {
        self.span.record("directives", count as i64);
    }

    /// Finish the span, recording duration and success.
    pub fn finish(self, success: bool) {
        let duration = self.start.elapsed();
        self.span.record("duration_ms", duration.as_secs_f64() * 1000.0);
        self.span.record("success", success);

        super::metrics::GLOBAL_METRICS.record_turn(self.role.name(), duration, success);

        tracing::debug!(parent: &self.span, "Turn complete");
    }
}

/// RAII guard for timing any operation.
///
/// Records the operation name and duration to metrics on [`finish`](Self::finish).
pub struct TimedOperation {
    name: String,
    start: Instant,
    span: Span,
}

impl TimedOperation {
    /// Start a new timed operation.
    pub fn start(name: &str) -> Self {
        let span = info_span!(
            "operation",
            op = %name,
            duration_ms = tracing::field::Empty,
        );

        Self {
            name: name.to_string(),
            start: Instant::now(),
            span,
        }
    }

    /// Get elapsed time so far.
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }

    /// Finish and record the operation.
    pub fn finish(self) {
        let duration = self.start.elapsed();
        self.span.record("duration_ms", duration.as_secs_f64() * 1000.0);
        super::metrics::GLOBAL_METRICS.record_operation(&self.name, duration);
    }
}

/// Macro for timing an operation.
///
/// ```rust,ignore
/// let timer = timed!("wave.impl");
/// run_phase().await;
/// timer.finish();
/// ```
#[macro_export]
macro_rules! timed {
    ($name:expr) => {
        $crate::telemetry::TimedOperation::start($name)
    };
}
