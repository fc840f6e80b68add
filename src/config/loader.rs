// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Reading config layers from disk.
//!
//! A project can carry three layers: the user's global file, the project
//! file and a personal override next to it. Each layer is optional and is
//! read as JSON unless its extension says YAML.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::ConfigError;

use super::types::{
    AgentsConfigPartial, PhasesConfigPartial, TestingConfigPartial, WavesConfigPartial,
    WorkspaceConfig,
};

/// Project config names, first match wins.
pub const PROJECT_FILES: &[&str] = &[".codetree.json", ".codetree.yaml", ".codetree/config.json"];

/// Personal override, kept out of version control.
pub const LOCAL_FILE: &str = ".codetree.local.json";

/// Directory under the home directory holding the global layer.
pub const GLOBAL_DIR: &str = ".codetree";

/// One source of configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigLayer {
    Global,
    Project,
    Local,
}

impl ConfigLayer {
    /// Where this layer lives for `project_root`, if the file exists.
    pub fn locate(self, project_root: &Path) -> Option<PathBuf> {
        match self {
            Self::Global => global_config_path().filter(|p| p.is_file()),
            Self::Project => PROJECT_FILES
                .iter()
                .map(|name| project_root.join(name))
                .find(|p| p.is_file()),
            Self::Local => Some(project_root.join(LOCAL_FILE)).filter(|p| p.is_file()),
        }
    }

    /// Read this layer; a missing file is not an error.
    pub fn load(self, project_root: &Path) -> Result<Option<WorkspaceConfig>, ConfigError> {
        let Some(path) = self.locate(project_root) else {
            return Ok(None);
        };
        debug!(layer = ?self, path = %path.display(), "Reading config layer");
        read_config(&path).map(Some)
    }
}

/// `~/.codetree/config.json`, when a home directory is known.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(GLOBAL_DIR).join("config.json"))
}

/// Parse one config file.
pub fn read_config(path: &Path) -> Result<WorkspaceConfig, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    let yaml = matches!(
        path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref(),
        Some("yaml" | "yml")
    );
    if yaml {
        Ok(serde_yaml::from_str(&text)?)
    } else {
        Ok(serde_json::from_str(&text)?)
    }
}

/// Write a starter `.codetree.json` into `project_root`.
///
/// Fails when the project already has one.
pub fn init_config(project_root: &Path, config: Option<WorkspaceConfig>) -> Result<PathBuf, ConfigError> {
    let path = project_root.join(PROJECT_FILES[0]);
    if path.exists() {
        return Err(ConfigError::InvalidValue {
            field: "init".to_string(),
            message: format!("{} already exists", path.display()),
        });
    }
    let config = config.unwrap_or_else(starter_config);
    std::fs::write(&path, serde_json::to_string_pretty(&config)?)?;
    Ok(path)
}

/// Nearest directory at or above `start` with a project config.
pub fn find_workspace_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| ConfigLayer::Project.locate(dir).is_some())
        .map(Path::to_path_buf)
}

/// Config written by `codetree config init`: a local model and a pytest run.
pub fn starter_config() -> WorkspaceConfig {
    WorkspaceConfig {
        provider: Some("ollama".to_string()),
        model: Some("qwen2.5-coder".to_string()),
        agents: Some(AgentsConfigPartial {
            max_turns_per_activation: Some(8),
            child_task_timeout_secs: Some(900),
            ..Default::default()
        }),
        waves: Some(WavesConfigPartial {
            max_waves: Some(12),
            test_file_prefix: Some("test_".to_string()),
            ..Default::default()
        }),
        testing: Some(TestingConfigPartial {
            command: Some("python -m pytest -q {scope}".to_string()),
            timeout_secs: Some(300),
        }),
        phases: Some(PhasesConfigPartial {
            max_clarification_rounds: Some(3),
            skip_clarification: Some(false),
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_project_without_config_has_no_layers() {
        let temp = TempDir::new().unwrap();
        assert!(ConfigLayer::Project.load(temp.path()).unwrap().is_none());
        assert!(ConfigLayer::Local.load(temp.path()).unwrap().is_none());
    }

    #[test]
    fn test_json_file_shadows_yaml_file() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(".codetree.json"), r#"{"waves": {"maxWaves": 4}}"#).unwrap();
        std::fs::write(temp.path().join(".codetree.yaml"), "waves:\n  maxWaves: 9\n").unwrap();

        let config = ConfigLayer::Project.load(temp.path()).unwrap().unwrap();
        assert_eq!(config.waves.unwrap().max_waves, Some(4));
    }

    #[test]
    fn test_yaml_project_config_with_wave_and_test_sections() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join(".codetree.yaml"),
            "provider: ollama\nwaves:\n  maxWaves: 3\n  testFilePrefix: check_\ntesting:\n  command: make test\n  timeoutSecs: 60\n",
        )
        .unwrap();

        let config = ConfigLayer::Project.load(temp.path()).unwrap().unwrap();
        assert_eq!(config.provider.as_deref(), Some("ollama"));
        let waves = config.waves.unwrap();
        assert_eq!(waves.max_waves, Some(3));
        assert_eq!(waves.test_file_prefix.as_deref(), Some("check_"));
        let testing = config.testing.unwrap();
        assert_eq!(testing.command.as_deref(), Some("make test"));
        assert_eq!(testing.timeout_secs, Some(60));
    }

    #[test]
    fn test_nested_project_config_is_found() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir(temp.path().join(".codetree")).unwrap();
        std::fs::write(
            temp.path().join(".codetree").join("config.json"),
            r#"{"agents": {"maxTurnsPerActivation": 3}}"#,
        )
        .unwrap();

        let config = ConfigLayer::Project.load(temp.path()).unwrap().unwrap();
        assert_eq!(config.agents.unwrap().max_turns_per_activation, Some(3));
    }

    #[test]
    fn test_local_override_is_its_own_layer() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(LOCAL_FILE), r#"{"phases": {"skipClarification": true}}"#).unwrap();

        assert!(ConfigLayer::Project.load(temp.path()).unwrap().is_none());
        let local = ConfigLayer::Local.load(temp.path()).unwrap().unwrap();
        assert_eq!(local.phases.unwrap().skip_clarification, Some(true));
    }

    #[test]
    fn test_broken_json_is_reported() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(".codetree.json"), "{ waves: ").unwrap();
        assert!(matches!(
            ConfigLayer::Project.load(temp.path()),
            Err(ConfigError::JsonError(_))
        ));
    }

    #[test]
    fn test_init_writes_starter_once() {
        let temp = TempDir::new().unwrap();
        let path = init_config(temp.path(), None).unwrap();
        assert_eq!(path, temp.path().join(".codetree.json"));

        let written = read_config(&path).unwrap();
        assert_eq!(
            written.testing.and_then(|t| t.command).as_deref(),
            Some("python -m pytest -q {scope}")
        );
        assert_eq!(written.waves.and_then(|w| w.max_waves), Some(12));

        std::fs::write(&path, r#"{"provider": "openai"}"#).unwrap();
        assert!(init_config(temp.path(), None).is_err());
        assert_eq!(read_config(&path).unwrap().provider.as_deref(), Some("openai"));
    }

    #[test]
    fn test_workspace_root_found_from_nested_project_dir() {
        let temp = TempDir::new().unwrap();
        let nested = temp.path().join("calc").join("src");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(temp.path().join(".codetree.yaml"), "waves:\n  maxWaves: 1\n").unwrap();

        assert_eq!(find_workspace_root(&nested).as_deref(), Some(temp.path()));
    }

    #[test]
    fn test_global_path_is_under_home() {
        if let Some(path) = global_config_path() {
            assert!(path.ends_with(".codetree/config.json"));
        }
    }
}
