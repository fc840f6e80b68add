// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Layered configuration for a codetree project.
//!
//! Layers, lowest first: built-in defaults, `~/.codetree/config.json`, the
//! project file (`.codetree.json`, `.codetree.yaml` or
//! `.codetree/config.json`), `.codetree.local.json`, then CLI flags.

mod loader;
mod merger;
mod types;

pub use loader::{
    find_workspace_root, global_config_path, init_config, read_config, starter_config, ConfigLayer,
    GLOBAL_DIR, LOCAL_FILE, PROJECT_FILES,
};

pub use merger::{default_config, merge_config, CliOptions};

pub use types::{
    AgentsConfig, AgentsConfigPartial, PhasesConfig, PhasesConfigPartial, ResolvedConfig,
    RetryConfig, RetryConfigPartial, TestingConfig, TestingConfigPartial, WavesConfig,
    WavesConfigPartial, WorkspaceConfig,
};

use crate::error::ConfigError;
use std::path::Path;

/// Load and merge all configuration sources for a workspace.
pub fn load_config(
    workspace_root: &Path,
    cli_options: CliOptions,
) -> Result<ResolvedConfig, ConfigError> {
    let global = ConfigLayer::Global.load(workspace_root)?;
    let workspace = ConfigLayer::Project.load(workspace_root)?;
    let local = ConfigLayer::Local.load(workspace_root)?;

    Ok(merge_config(global, workspace, local, cli_options))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_config_with_workspace_and_local() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join(".codetree.json"),
            r#"{"provider": "ollama", "waves": {"maxWaves": 5}}"#,
        )
        .unwrap();
        std::fs::write(
            temp.path().join(LOCAL_FILE),
            r#"{"waves": {"maxWaves": 2}}"#,
        )
        .unwrap();

        let config = load_config(temp.path(), CliOptions::default()).unwrap();
        assert_eq!(config.provider, "ollama");
        assert_eq!(config.waves.max_waves, 2);
    }

    #[test]
    fn test_load_config_cli_override() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(".codetree.json"), r#"{"provider": "openai"}"#).unwrap();

        let cli = CliOptions {
            provider: Some("ollama".to_string()),
            ..Default::default()
        };

        let config = load_config(temp.path(), cli).unwrap();
        assert_eq!(config.provider, "ollama");
    }
}
