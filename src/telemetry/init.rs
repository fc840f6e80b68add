// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Subscriber setup.
//!
//! Logs go to stderr so that the CLI's own output on stdout (phase banners,
//! agent transitions, questions) stays readable and pipeable.

use std::io;

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// How the tracing subscriber is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Level used when neither `filter_directive` nor RUST_LOG is set.
    pub default_level: Level,

    /// Emit span close events (with their recorded durations).
    pub span_close_events: bool,

    /// Include file/line information.
    pub include_file_line: bool,

    /// Include the module path of the event.
    pub include_target: bool,

    /// Use ANSI colors.
    pub ansi_colors: bool,

    /// Use the compact formatter.
    pub compact: bool,

    /// Explicit filter, takes precedence over RUST_LOG.
    pub filter_directive: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            default_level: Level::INFO,
            span_close_events: false,
            include_file_line: false,
            include_target: true,
            ansi_colors: true,
            compact: true,
            filter_directive: None,
        }
    }
}

impl TelemetryConfig {
    /// Verbose output with span timings, for working on the crate itself.
    pub fn development() -> Self {
        Self {
            default_level: Level::DEBUG,
            span_close_events: true,
            include_file_line: true,
            compact: false,
            ..Self::default()
        }
    }

    /// Warnings only, no colors.
    pub fn production() -> Self {
        Self {
            default_level: Level::WARN,
            include_target: false,
            ansi_colors: false,
            ..Self::default()
        }
    }

    /// Everything from this crate, for debugging tests.
    pub fn testing() -> Self {
        Self {
            default_level: Level::TRACE,
            span_close_events: true,
            include_file_line: true,
            ansi_colors: false,
            compact: false,
            filter_directive: Some("codetree=trace".to_string()),
            ..Self::default()
        }
    }

    /// Pick a preset from the CLI verbosity flags.
    pub fn from_verbosity(verbose: bool, debug: bool) -> Self {
        if debug {
            Self::development().with_filter("codetree=debug,warn")
        } else if verbose {
            Self::default().with_filter("codetree=info,warn")
        } else {
            Self::production()
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.default_level = level;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter_directive = Some(filter.into());
        self
    }

    pub fn with_ansi(mut self, ansi: bool) -> Self {
        self.ansi_colors = ansi;
        self
    }

    fn env_filter(&self) -> EnvFilter {
        let fallback = || EnvFilter::new(self.default_level.to_string());
        match &self.filter_directive {
            Some(directive) => EnvFilter::try_new(directive).unwrap_or_else(|_| fallback()),
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback()),
        }
    }
}

/// Guard returned by [`init_telemetry`]; logs the metrics report on drop.
///
/// Keep this guard alive for the duration of the program.
pub struct TelemetryGuard {
    _private: (),
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        #[cfg(feature = "telemetry")]
        tracing::debug!(
            report = %super::metrics::GLOBAL_METRICS.snapshot().format_report(),
            "Telemetry shutting down"
        );
    }
}

/// Install the global tracing subscriber.
///
/// Fails if a global subscriber is already installed.
pub fn init_telemetry(config: &TelemetryConfig) -> io::Result<TelemetryGuard> {
    let span_events = if config.span_close_events {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let fmt_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_ansi(config.ansi_colors)
        .with_target(config.include_target)
        .with_file(config.include_file_line)
        .with_line_number(config.include_file_line)
        .with_span_events(span_events);

    let registry = tracing_subscriber::registry().with(config.env_filter());
    let installed = if config.compact {
        registry.with(fmt_layer.compact()).try_init()
    } else {
        registry.with(fmt_layer).try_init()
    };
    installed.map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

    Ok(TelemetryGuard { _private: () })
}
