// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration merging.
//!
//! Handles merging configurations from different sources with proper precedence.

use std::path::PathBuf;

use super::types::{ResolvedConfig, WorkspaceConfig};

/// CLI options that can override configuration.
#[derive(Debug, Clone, Default)]
pub struct CliOptions {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub script: Option<PathBuf>,
    pub max_waves: Option<u32>,
    pub test_command: Option<String>,
    pub skip_clarification: Option<bool>,
}

/// Default configuration values.
pub fn default_config() -> ResolvedConfig {
    ResolvedConfig::default()
}

/// Merge multiple configurations with precedence.
///
/// Precedence (highest to lowest):
/// 1. CLI options
/// 2. Local config (.codetree.local.json)
/// 3. Workspace config (.codetree.json)
/// 4. Global config (~/.codetree/config.json)
/// 5. Default values
pub fn merge_config(
    global: Option<WorkspaceConfig>,
    workspace: Option<WorkspaceConfig>,
    local: Option<WorkspaceConfig>,
    cli: CliOptions,
) -> ResolvedConfig {
    let mut result = default_config();

    for config in [global, workspace, local].into_iter().flatten() {
        apply_workspace_config(&mut result, &config);
    }

    apply_cli_options(&mut result, &cli);

    result
}

fn apply_workspace_config(result: &mut ResolvedConfig, config: &WorkspaceConfig) {
    if let Some(ref provider) = config.provider {
        result.provider = provider.clone();
    }

    if config.model.is_some() {
        result.model = config.model.clone();
    }

    if config.base_url.is_some() {
        result.base_url = config.base_url.clone();
    }

    if config.api_key_env.is_some() {
        result.api_key_env = config.api_key_env.clone();
    }

    if config.script.is_some() {
        result.script = config.script.clone();
    }

    if let Some(timeout) = config.request_timeout_secs {
        result.request_timeout_secs = timeout;
    }

    if let Some(ref agents) = config.agents {
        if let Some(turns) = agents.max_turns_per_activation {
            result.agents.max_turns_per_activation = turns;
        }
        if let Some(entries) = agents.max_context_entries {
            result.agents.max_context_entries = entries;
        }
        if agents.child_task_timeout_secs.is_some() {
            result.agents.child_task_timeout_secs = agents.child_task_timeout_secs;
        }
        if let Some(chars) = agents.summary_chars {
            result.agents.summary_chars = chars;
        }
    }

    if let Some(ref retry) = config.retry {
        if let Some(max) = retry.max_retries {
            result.retry.max_retries = max;
        }
        if let Some(initial) = retry.initial_backoff_ms {
            result.retry.initial_backoff_ms = initial;
        }
        if let Some(max) = retry.max_backoff_ms {
            result.retry.max_backoff_ms = max;
        }
    }

    if let Some(ref waves) = config.waves {
        if let Some(max) = waves.max_waves {
            result.waves.max_waves = max;
        }
        if let Some(after) = waves.test_revision_after {
            result.waves.test_revision_after = after;
        }
        if let Some(failures) = waves.max_consecutive_root_failures {
            result.waves.max_consecutive_root_failures = failures;
        }
        if let Some(ref prefix) = waves.test_file_prefix {
            result.waves.test_file_prefix = prefix.clone();
        }
        if let Some(ref patterns) = waves.test_patterns {
            // Replaces the defaults.
            result.waves.test_patterns = patterns.clone();
        }
    }

    if let Some(ref testing) = config.testing {
        if let Some(ref command) = testing.command {
            result.testing.command = command.clone();
        }
        if let Some(timeout) = testing.timeout_secs {
            result.testing.timeout_secs = timeout;
        }
    }

    if let Some(ref phases) = config.phases {
        if let Some(rounds) = phases.max_clarification_rounds {
            result.phases.max_clarification_rounds = rounds;
        }
        if let Some(skip) = phases.skip_clarification {
            result.phases.skip_clarification = skip;
        }
    }
}

fn apply_cli_options(result: &mut ResolvedConfig, cli: &CliOptions) {
    if let Some(ref provider) = cli.provider {
        result.provider = provider.clone();
    }

    if cli.model.is_some() {
        result.model = cli.model.clone();
    }

    if cli.base_url.is_some() {
        result.base_url = cli.base_url.clone();
    }

    if let Some(ref script) = cli.script {
        result.script = Some(script.clone());
        // A script on the command line implies the scripted provider.
        if cli.provider.is_none() {
            result.provider = "scripted".to_string();
        }
    }

    if let Some(max) = cli.max_waves {
        result.waves.max_waves = max;
    }

    if let Some(ref command) = cli.test_command {
        result.testing.command = command.clone();
    }

    if let Some(skip) = cli.skip_clarification {
        result.phases.skip_clarification = skip;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{AgentsConfigPartial, WavesConfigPartial};

    #[test]
    fn test_merge_defaults() {
        let config = merge_config(None, None, None, CliOptions::default());
        assert_eq!(config, ResolvedConfig::default());
    }

    #[test]
    fn test_merge_precedence() {
        let global = WorkspaceConfig {
            provider: Some("ollama".to_string()),
            model: Some("llama3.2".to_string()),
            ..Default::default()
        };
        let workspace = WorkspaceConfig {
            model: Some("qwen2.5-coder".to_string()),
            agents: Some(AgentsConfigPartial {
                max_turns_per_activation: Some(5),
                ..Default::default()
            }),
            ..Default::default()
        };
        let local = WorkspaceConfig {
            agents: Some(AgentsConfigPartial {
                child_task_timeout_secs: Some(600),
                ..Default::default()
            }),
            ..Default::default()
        };

        let config = merge_config(Some(global), Some(workspace), Some(local), CliOptions::default());
        assert_eq!(config.provider, "ollama");
        assert_eq!(config.model.as_deref(), Some("qwen2.5-coder"));
        assert_eq!(config.agents.max_turns_per_activation, 5);
        assert_eq!(config.agents.child_task_timeout_secs, Some(600));
    }

    #[test]
    fn test_cli_overrides_everything() {
        let workspace = WorkspaceConfig {
            provider: Some("openai".to_string()),
            waves: Some(WavesConfigPartial {
                max_waves: Some(20),
                ..Default::default()
            }),
            ..Default::default()
        };
        let cli = CliOptions {
            provider: Some("ollama".to_string()),
            max_waves: Some(4),
            ..Default::default()
        };
        let config = merge_config(None, Some(workspace), None, cli);
        assert_eq!(config.provider, "ollama");
        assert_eq!(config.waves.max_waves, 4);
    }

    #[test]
    fn test_cli_script_implies_scripted_provider() {
        let cli = CliOptions {
            script: Some(PathBuf::from("demo.yaml")),
            ..Default::default()
        };
        let config = merge_config(None, None, None, cli);
        assert_eq!(config.provider, "scripted");
        assert_eq!(config.script, Some(PathBuf::from("demo.yaml")));
    }

    #[test]
    fn test_test_patterns_replace_defaults() {
        let workspace = WorkspaceConfig {
            waves: Some(WavesConfigPartial {
                test_patterns: Some(vec!["tests/**".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let config = merge_config(None, Some(workspace), None, CliOptions::default());
        assert_eq!(config.waves.test_patterns, vec!["tests/**".to_string()]);
    }
}
