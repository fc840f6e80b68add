// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Metrics collection for performance monitoring.
//!
//! Lightweight in-process counters and latency histograms: agent turns by
//! role, timed operations (provider calls, phases, tester runs) and the
//! delegation traffic of the coordinator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

/// Global metrics instance.
pub static GLOBAL_METRICS: Lazy<Metrics> = Lazy::new(Metrics::new);

/// Central metrics collection.
#[derive(Debug)]
pub struct Metrics {
    /// Agent turn metrics by role name.
    turns: RwLock<HashMap<String, TurnMetrics>>,

    /// General operation metrics.
    operations: RwLock<HashMap<String, OperationMetrics>>,

    /// Delegation traffic.
    delegation: DelegationCounters,

    /// Token usage tracking.
    tokens: TokenMetrics,

    /// Start time for calculating uptime.
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self {
            turns: RwLock::new(HashMap::new()),
            operations: RwLock::new(HashMap::new()),
            delegation: DelegationCounters::default(),
            tokens: TokenMetrics::new(),
            start_time: Instant::now(),
        }
    }

    /// Record one agent turn.
    pub fn record_turn(&self, role: &str, duration: Duration, success: bool) {
        let mut turns = self.turns.write().unwrap_or_else(PoisonError::into_inner);
        turns
            .entry(role.to_string())
            .or_insert_with(TurnMetrics::new)
            .record(duration, success);
    }

    /// Record a generic operation.
    pub fn record_operation(&self, name: &str, duration: Duration) {
        let mut ops = self.operations.write().unwrap_or_else(PoisonError::into_inner);
        ops.entry(name.to_string())
            .or_insert_with(OperationMetrics::new)
            .record(duration);
    }

    /// Record a task issued to a child.
    pub fn record_delegation(&self) {
        self.delegation.issued.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a RESULT accepted by a manager.
    pub fn record_result(&self, success: bool) {
        let counter = if success {
            &self.delegation.succeeded
        } else {
            &self.delegation.failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failure fabricated by the coordinator (timeout, abandonment).
    pub fn record_synthetic_failure(&self) {
        self.delegation.synthetic.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a RESULT that arrived after its task was resolved.
    pub fn record_stale_result(&self) {
        self.delegation.stale.fetch_add(1, Ordering::Relaxed);
    }

    /// Record token usage.
    pub fn record_tokens(&self, input: u64, output: u64) {
        self.tokens.add_input(input);
        self.tokens.add_output(output);
    }

    /// Get turn metrics for a role.
    pub fn turn_metrics(&self, role: &str) -> Option<TurnMetrics> {
        self.turns
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(role)
            .cloned()
    }

    /// Get metrics for a specific operation.
    pub fn operation_metrics(&self, name: &str) -> Option<OperationMetrics> {
        self.operations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Get total token counts.
    pub fn token_counts(&self) -> (u64, u64) {
        (self.tokens.input_total(), self.tokens.output_total())
    }

    /// Get uptime since metrics were initialized.
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Take a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            turns: self.turns.read().unwrap_or_else(PoisonError::into_inner).clone(),
            operations: self
                .operations
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            delegations_issued: self.delegation.issued.load(Ordering::Relaxed),
            results_succeeded: self.delegation.succeeded.load(Ordering::Relaxed),
            results_failed: self.delegation.failed.load(Ordering::Relaxed),
            synthetic_failures: self.delegation.synthetic.load(Ordering::Relaxed),
            stale_results: self.delegation.stale.load(Ordering::Relaxed),
            input_tokens: self.tokens.input_total(),
            output_tokens: self.tokens.output_total(),
            uptime: self.uptime(),
        }
    }

    /// Reset all metrics.
    pub fn reset(&self) {
        self.turns.write().unwrap_or_else(PoisonError::into_inner).clear();
        self.operations.write().unwrap_or_else(PoisonError::into_inner).clear();
        self.delegation.reset();
        self.tokens.reset();
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Turn metrics for one role.
#[derive(Debug, Clone)]
pub struct TurnMetrics {
    /// Total number of turns.
    pub turns: u64,

    /// Turns whose reply parsed into directives.
    pub successes: u64,

    /// Turns that failed (provider error or parse error).
    pub failures: u64,

    /// Total time spent waiting on turns.
    pub total_duration: Duration,

    /// Maximum turn time.
    pub max_duration: Duration,

    /// Latency distribution.
    pub histogram: Histogram,
}

impl TurnMetrics {
    pub fn new() -> Self {
        Self {
            turns: 0,
            successes: 0,
            failures: 0,
            total_duration: Duration::ZERO,
            max_duration: Duration::ZERO,
            histogram: Histogram::default(),
        }
    }

    pub fn record(&mut self, duration: Duration, success: bool) {
        self.turns += 1;
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        self.total_duration += duration;
        self.max_duration = self.max_duration.max(duration);
        self.histogram.record(duration);
    }

    /// Calculate average turn time.
    pub fn avg_duration(&self) -> Duration {
        if self.turns == 0 {
            Duration::ZERO
        } else {
            self.total_duration / self.turns as u32
        }
    }

    /// Calculate success rate (0.0 to 1.0).
    pub fn success_rate(&self) -> f64 {
        if self.turns == 0 {
            1.0
        } else {
            self.successes as f64 / self.turns as f64
        }
    }
}

impl Default for TurnMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Generic operation metrics with histogram.
#[derive(Debug, Clone)]
pub struct OperationMetrics {
    /// Number of operations.
    pub count: u64,

    /// Total duration.
    pub total_duration: Duration,

    /// Minimum duration.
    pub min_duration: Duration,

    /// Maximum duration.
    pub max_duration: Duration,

    /// Histogram buckets for latency distribution.
    pub histogram: Histogram,
}

impl OperationMetrics {
    /// Create new operation metrics.
    pub fn new() -> Self {
        Self {
            count: 0,
            total_duration: Duration::ZERO,
            min_duration: Duration::MAX,
            max_duration: Duration::ZERO,
            histogram: Histogram::default(),
        }
    }

    /// Record an operation.
    pub fn record(&mut self, duration: Duration) {
        self.count += 1;
        self.total_duration += duration;
        self.min_duration = self.min_duration.min(duration);
        self.max_duration = self.max_duration.max(duration);
        self.histogram.record(duration);
    }

    /// Calculate average duration.
    pub fn avg_duration(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total_duration / self.count as u32
        }
    }
}

impl Default for OperationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Simple histogram with fixed buckets for latency tracking.
#[derive(Debug, Clone)]
pub struct Histogram {
    /// Bucket boundaries in microseconds.
    buckets: Vec<u64>,

    /// Count per bucket, plus one overflow bucket.
    counts: Vec<u64>,
}

impl Histogram {
    /// Create a histogram with custom bucket boundaries (in microseconds).
    pub fn with_buckets(buckets: Vec<u64>) -> Self {
        let counts = vec![0; buckets.len() + 1];
        Self { buckets, counts }
    }

    /// Record a duration value.
    pub fn record(&mut self, duration: Duration) {
        let micros = duration.as_micros() as u64;
        let bucket_idx = self
            .buckets
            .iter()
            .position(|&b| micros <= b)
            .unwrap_or(self.buckets.len());
        self.counts[bucket_idx] += 1;
    }

    /// Get counts for each bucket.
    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    /// Calculate approximate percentile (p50, p90, p99, etc.).
    pub fn percentile(&self, p: f64) -> Duration {
        let total: u64 = self.counts.iter().sum();
        if total == 0 {
            return Duration::ZERO;
        }

        let target = (total as f64 * p / 100.0).ceil() as u64;
        let mut cumulative = 0u64;

        for (i, &count) in self.counts.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                let micros = if i < self.buckets.len() {
                    self.buckets[i]
                } else {
                    self.buckets.last().copied().unwrap_or(0) * 10
                };
                return Duration::from_micros(micros);
            }
        }

        Duration::ZERO
    }

    pub fn p50(&self) -> Duration {
        self.percentile(50.0)
    }

    pub fn p99(&self) -> Duration {
        self.percentile(99.0)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        // LLM turns are slow: 10ms, 100ms, 1s, 10s, 60s, 5min
        Self::with_buckets(vec![10_000, 100_000, 1_000_000, 10_000_000, 60_000_000, 300_000_000])
    }
}

#[derive(Debug, Default)]
struct DelegationCounters {
    issued: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    synthetic: AtomicU64,
    stale: AtomicU64,
}

impl DelegationCounters {
    fn reset(&self) {
        for counter in [&self.issued, &self.succeeded, &self.failed, &self.synthetic, &self.stale] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Thread-safe token usage tracking.
#[derive(Debug)]
struct TokenMetrics {
    input: AtomicU64,
    output: AtomicU64,
}

impl TokenMetrics {
    fn new() -> Self {
        Self {
            input: AtomicU64::new(0),
            output: AtomicU64::new(0),
        }
    }

    fn add_input(&self, count: u64) {
        self.input.fetch_add(count, Ordering::Relaxed);
    }

    fn add_output(&self, count: u64) {
        self.output.fetch_add(count, Ordering::Relaxed);
    }

    fn input_total(&self) -> u64 {
        self.input.load(Ordering::Relaxed)
    }

    fn output_total(&self) -> u64 {
        self.output.load(Ordering::Relaxed)
    }

    fn reset(&self) {
        self.input.store(0, Ordering::Relaxed);
        self.output.store(0, Ordering::Relaxed);
    }
}

/// A snapshot of all metrics at a point in time.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub turns: HashMap<String, TurnMetrics>,
    pub operations: HashMap<String, OperationMetrics>,
    pub delegations_issued: u64,
    pub results_succeeded: u64,
    pub results_failed: u64,
    pub synthetic_failures: u64,
    pub stale_results: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub uptime: Duration,
}

impl MetricsSnapshot {
    /// Format as a human-readable report.
    pub fn format_report(&self) -> String {
        let mut report = String::new();

        report.push_str("=== Metrics Report ===\n\n");
        report.push_str(&format!("Uptime: {:.2?}\n", self.uptime));
        report.push_str(&format!(
            "Tokens: {} input, {} output\n",
            self.input_tokens, self.output_tokens
        ));
        report.push_str(&format!(
            "Delegations: {} issued, {} succeeded, {} failed ({} synthetic), {} stale\n\n",
            self.delegations_issued,
            self.results_succeeded,
            self.results_failed,
            self.synthetic_failures,
            self.stale_results
        ));

        if !self.turns.is_empty() {
            report.push_str("Turns:\n");
            let mut roles: Vec<_> = self.turns.iter().collect();
            roles.sort_by(|a, b| a.0.cmp(b.0));
            for (role, metrics) in roles {
                report.push_str(&format!(
                    "  {}: {} turns, {:.1}% ok, avg {:.2?}, p99 {:.2?}\n",
                    role,
                    metrics.turns,
                    metrics.success_rate() * 100.0,
                    metrics.avg_duration(),
                    metrics.histogram.p99()
                ));
            }
            report.push('\n');
        }

        if !self.operations.is_empty() {
            report.push_str("Operations:\n");
            let mut ops: Vec<_> = self.operations.iter().collect();
            ops.sort_by(|a, b| a.0.cmp(b.0));
            for (name, metrics) in ops {
                report.push_str(&format!(
                    "  {}: {} ops, avg {:.2?}, p99 {:.2?}\n",
                    name,
                    metrics.count,
                    metrics.avg_duration(),
                    metrics.histogram.p99()
                ));
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turn_metrics() {
        let mut metrics = TurnMetrics::new();
        metrics.record(Duration::from_millis(100), true);
        metrics.record(Duration::from_millis(200), true);
        metrics.record(Duration::from_millis(60), false);

        assert_eq!(metrics.turns, 3);
        assert_eq!(metrics.failures, 1);
        assert_eq!(metrics.avg_duration(), Duration::from_millis(120));
        assert!((metrics.success_rate() - 0.666).abs() < 0.01);
    }

    #[test]
    fn test_histogram_percentiles() {
        let mut hist = Histogram::default();
        for _ in 0..100 {
            hist.record(Duration::from_millis(500));
        }
        assert_eq!(hist.p50(), Duration::from_secs(1));
        assert_eq!(hist.p99(), Duration::from_secs(1));
    }

    #[test]
    fn test_histogram_overflow_bucket() {
        let mut hist = Histogram::with_buckets(vec![100]);
        hist.record(Duration::from_micros(50));
        hist.record(Duration::from_secs(1));
        assert_eq!(hist.counts(), &[1, 1]);
        assert_eq!(hist.p99(), Duration::from_micros(1_000));
    }

    #[test]
    fn test_delegation_counters_and_reset() {
        let metrics = Metrics::new();
        metrics.record_delegation();
        metrics.record_delegation();
        metrics.record_result(true);
        metrics.record_result(false);
        metrics.record_synthetic_failure();
        metrics.record_turn("coder", Duration::from_millis(5), true);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.delegations_issued, 2);
        assert_eq!(snapshot.results_failed, 1);
        assert_eq!(snapshot.synthetic_failures, 1);
        assert!(snapshot.format_report().contains("coder: 1 turns"));

        metrics.reset();
        assert_eq!(metrics.snapshot().delegations_issued, 0);
        assert!(metrics.turn_metrics("coder").is_none());
    }
}
