// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Telemetry, tracing, and metrics infrastructure.
//!
//! - **Tracing**: structured logging with spans for turns, phases and tester runs
//! - **Metrics**: turn counters per role, delegation traffic, latency histograms
//!
//! # Usage
//!
//! Initialize telemetry at application startup:
//!
//! ```rust,ignore
//! use codetree::telemetry::{init_telemetry, TelemetryConfig};
//!
//! let _guard = init_telemetry(&TelemetryConfig::default())?;
//! ```
//!
//! # Integration Guidelines
//!
//! 1. **Add `#[instrument]` to public async functions**
//! 2. **Record meaningful fields** (agent ids, paths, counts, not secrets)
//! 3. **Use appropriate log levels** (debug for delivery, info for lifecycle and
//!    phases, warn for stale or synthetic results)
//! 4. **Track metrics** for operations that should be monitored

mod init;
pub mod metrics;
mod spans;

pub use init::{init_telemetry, TelemetryConfig, TelemetryGuard};
pub use metrics::{
    Histogram, Metrics, MetricsSnapshot, OperationMetrics, TurnMetrics, GLOBAL_METRICS,
};
pub use spans::{TimedOperation, TurnSpan};
