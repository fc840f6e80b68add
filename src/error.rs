// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for the collaborators the coordinator consumes.
//!
//! Errors raised by the core itself (lifecycle, bus, coordinator, waves) live
//! next to the code that raises them. This module holds the errors of the
//! pluggable edges: completion providers, directive parsing, the file system,
//! tester runs and configuration. All are defined with `thiserror`; `anyhow`
//! is only used at the binary edge.

use thiserror::Error;

/// Errors that can occur while asking a provider for a completion.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("Authentication failed: {0}")]
    AuthError(String),

    #[error("API error: {message}")]
    ApiError {
        message: String,
        status_code: Option<u16>,
    },

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Response parsing error: {0}")]
    ParseError(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl ProviderError {
    /// Create an API error with status code.
    pub fn api(message: impl Into<String>, status_code: u16) -> Self {
        Self::ApiError {
            message: message.into(),
            status_code: Some(status_code),
        }
    }

    /// Create an API error without status code.
    pub fn api_message(message: impl Into<String>) -> Self {
        Self::ApiError {
            message: message.into(),
            status_code: None,
        }
    }

    /// Check if this error is retryable.
    ///
    /// Server-side failures (5xx) are treated as transient alongside
    /// rate limits, network errors and timeouts.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited(_) | Self::NetworkError(_) | Self::Timeout(_) => true,
            Self::ApiError {
                status_code: Some(code),
                ..
            } => *code >= 500,
            _ => false,
        }
    }
}

/// Malformed directive text.
///
/// Raised by a [`DirectiveInterpreter`](crate::directive::DirectiveInterpreter)
/// and surfaced by the coordinator as a Failure RESULT carrying this message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("line {line}: {message}")]
pub struct ParseError {
    /// 1-based line number of the offending directive.
    pub line: usize,
    /// Human-readable diagnostic.
    pub message: String,
}

impl ParseError {
    pub fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

/// Errors raised by a [`FileSystem`](crate::workspace::FileSystem).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FsError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Path escapes the project root: {0}")]
    OutsideProject(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for FsError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(err.to_string()),
            std::io::ErrorKind::AlreadyExists => Self::AlreadyExists(err.to_string()),
            _ => Self::Io(err.to_string()),
        }
    }
}

/// Errors raised while running an ephemeral tester.
///
/// A failing test suite is not an error; it is a report with `passed = false`.
/// These errors mean the tester could not produce a report at all.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TesterError {
    #[error("Tester not configured: {0}")]
    NotConfigured(String),

    #[error("Failed to launch tester: {0}")]
    LaunchFailed(String),
}

/// Errors that can occur during configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("IO error reading config: {0}")]
    IoError(String),

    #[error("YAML parsing error: {0}")]
    YamlError(String),

    #[error("JSON parsing error: {0}")]
    JsonError(String),
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            _ => Self::IoError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        Self::JsonError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::YamlError(err.to_string())
    }
}

/// Result type alias using anyhow for flexible error handling at the edges.
pub type Result<T> = anyhow::Result<T>;
