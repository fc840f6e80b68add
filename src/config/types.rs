// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration type definitions.
//!
//! [`WorkspaceConfig`] is what a config file may contain (every field
//! optional, camelCase keys, JSON or YAML). [`ResolvedConfig`] is the fully
//! defaulted result of merging all sources.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Workspace configuration for codetree.
/// Can be defined in .codetree.json, .codetree.yaml or .codetree/config.json.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceConfig {
    /// Provider to use (openai, ollama, openai-compatible, scripted)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    /// Model name to use
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Custom base URL for API
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Environment variable holding the API key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Script file for the scripted provider
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<PathBuf>,

    /// HTTP request timeout in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout_secs: Option<u64>,

    /// Per-agent limits
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agents: Option<AgentsConfigPartial>,

    /// Provider retry settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfigPartial>,

    /// Wave convergence settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waves: Option<WavesConfigPartial>,

    /// Tester settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub testing: Option<TestingConfigPartial>,

    /// Clarification and structure phase settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phases: Option<PhasesConfigPartial>,
}

/// Per-agent limits (partial, for workspace config).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentsConfigPartial {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_turns_per_activation: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_context_entries: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child_task_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary_chars: Option<usize>,
}

/// Retry settings (partial).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfigPartial {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_backoff_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_backoff_ms: Option<u64>,
}

/// Wave settings (partial).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WavesConfigPartial {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_waves: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_revision_after: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_consecutive_root_failures: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_file_prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_patterns: Option<Vec<String>>,
}

/// Tester settings (partial).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestingConfigPartial {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// Phase settings (partial).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhasesConfigPartial {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_clarification_rounds: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_clarification: Option<bool>,
}

// ============================================================================
// Resolved configuration
// ============================================================================

/// Per-agent limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentsConfig {
    /// LLM turns one activation may take before it fails.
    pub max_turns_per_activation: u32,
    /// Capacity of a node's context history.
    pub max_context_entries: usize,
    /// Child tasks older than this are surfaced as timed out.
    pub child_task_timeout_secs: Option<u64>,
    /// Length of result summaries in context and snapshots.
    pub summary_chars: usize,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            max_turns_per_activation: 8,
            max_context_entries: 64,
            child_task_timeout_secs: None,
            summary_chars: 240,
        }
    }
}

/// Provider retry settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
        }
    }
}

/// Wave convergence settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WavesConfig {
    /// Cap on total phase runs in the wave loop.
    pub max_waves: u32,
    /// Consecutive Impl failures before the tests are revised.
    pub test_revision_after: u32,
    /// Consecutive root failures before asking the human for guidance. 0 disables.
    pub max_consecutive_root_failures: u32,
    /// Prefix of the test file that pairs with a source file.
    pub test_file_prefix: String,
    /// Globs classifying a path as a test file.
    pub test_patterns: Vec<String>,
}

impl Default for WavesConfig {
    fn default() -> Self {
        Self {
            max_waves: 12,
            test_revision_after: 2,
            max_consecutive_root_failures: 3,
            test_file_prefix: "test_".to_string(),
            test_patterns: vec!["**/test_*".to_string()],
        }
    }
}

/// Tester settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestingConfig {
    /// Shell command template; `{scope}` is replaced by the directory under test.
    pub command: String,
    pub timeout_secs: u64,
}

impl Default for TestingConfig {
    fn default() -> Self {
        Self {
            command: "python -m pytest -q {scope}".to_string(),
            timeout_secs: 300,
        }
    }
}

/// Clarification and structure phase settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhasesConfig {
    pub max_clarification_rounds: u32,
    pub skip_clarification: bool,
}

impl Default for PhasesConfig {
    fn default() -> Self {
        Self {
            max_clarification_rounds: 3,
            skip_clarification: false,
        }
    }
}

/// Fully resolved configuration with defaults applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedConfig {
    pub provider: String,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub api_key_env: Option<String>,
    pub script: Option<PathBuf>,
    pub request_timeout_secs: u64,
    pub agents: AgentsConfig,
    pub retry: RetryConfig,
    pub waves: WavesConfig,
    pub testing: TestingConfig,
    pub phases: PhasesConfig,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: None,
            base_url: None,
            api_key_env: None,
            script: None,
            request_timeout_secs: 300,
            agents: AgentsConfig::default(),
            retry: RetryConfig::default(),
            waves: WavesConfig::default(),
            testing: TestingConfig::default(),
            phases: PhasesConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_config_camel_case() {
        let json = r#"{"provider":"ollama","agents":{"maxTurnsPerActivation":4},"waves":{"testFilePrefix":"spec_"}}"#;
        let config: WorkspaceConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.provider.as_deref(), Some("ollama"));
        assert_eq!(config.agents.unwrap().max_turns_per_activation, Some(4));
        assert_eq!(config.waves.unwrap().test_file_prefix.as_deref(), Some("spec_"));
    }

    #[test]
    fn test_workspace_config_yaml() {
        let yaml = "provider: scripted\nscript: run.yaml\ntesting:\n  command: cargo test\n";
        let config: WorkspaceConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.script, Some(PathBuf::from("run.yaml")));
        assert_eq!(config.testing.unwrap().command.as_deref(), Some("cargo test"));
    }

    #[test]
    fn test_resolved_defaults() {
        let config = ResolvedConfig::default();
        assert_eq!(config.provider, "openai");
        assert_eq!(config.waves.test_file_prefix, "test_");
        assert!(config.agents.child_task_timeout_secs.is_none());
        assert!(config.retry.max_backoff_ms >= config.retry.initial_backoff_ms);
    }
}
