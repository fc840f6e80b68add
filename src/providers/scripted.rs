// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Provider that replays scripted replies per agent scope.
//!
//! Scripts are YAML documents keyed by scope path (`.` is the project root):
//!
//! ```yaml
//! fallback: "FINISH SUCCESS: nothing left to do"
//! agents:
//!   ".":
//!     - "CREATE src/"
//!     - reply: "FINISH"
//!       delayMs: 50
//!   src/lib.rs:
//!     - error: rate_limited
//!     - "CHANGE src/lib.rs <<<\npub fn add(a: i32, b: i32) -> i32 { a + b }\n>>>\nFINISH"
//! ```
//!
//! Each call for a scope consumes that scope's next step. Once a scope's steps
//! are exhausted, the fallback reply is used.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
#[cfg(feature = "telemetry")]
use tracing::debug;

use super::{CompletionProvider, PromptContext};
use crate::agent::AgentId;
use crate::error::ProviderError;

/// Reply used when a scope has no scripted steps left.
pub const DEFAULT_FALLBACK: &str = "FINISH SUCCESS";

/// Failure a script step can inject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptedFailure {
    RateLimited,
    Network,
    Timeout,
    Auth,
    Server,
}

impl ScriptedFailure {
    fn to_error(self) -> ProviderError {
        match self {
            Self::RateLimited => ProviderError::RateLimited("scripted rate limit".to_string()),
            Self::Network => ProviderError::NetworkError("scripted network failure".to_string()),
            Self::Timeout => ProviderError::Timeout(0),
            Self::Auth => ProviderError::AuthError("scripted auth failure".to_string()),
            Self::Server => ProviderError::api("scripted server error", 500),
        }
    }
}

/// One scripted turn.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ScriptStep {
    Text(String),
    Detailed(DetailedStep),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailedStep {
    #[serde(default)]
    pub reply: Option<String>,
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default)]
    pub error: Option<ScriptedFailure>,
}

impl From<&str> for ScriptStep {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for ScriptStep {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

#[derive(Debug, Default, Deserialize)]
struct ScriptFile {
    #[serde(default)]
    fallback: Option<String>,
    #[serde(default)]
    agents: HashMap<String, Vec<ScriptStep>>,
}

/// A call the provider answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedCall {
    pub agent_id: AgentId,
    pub scope_path: PathBuf,
    pub last_user_message: Option<String>,
}

#[derive(Debug, Default)]
struct ScriptState {
    steps: HashMap<PathBuf, VecDeque<ScriptStep>>,
    calls: Vec<ScriptedCall>,
}

/// Deterministic provider backed by a script.
#[derive(Debug)]
pub struct ScriptedProvider {
    state: Mutex<ScriptState>,
    fallback: String,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ScriptState::default()),
            fallback: DEFAULT_FALLBACK.to_string(),
        }
    }

    /// Queue replies for the agent owning `scope`.
    pub fn on<I, S>(mut self, scope: impl AsRef<str>, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ScriptStep>,
    {
        self.state
            .get_mut()
            .steps
            .entry(scope_key(scope.as_ref()))
            .or_default()
            .extend(steps.into_iter().map(Into::into));
        self
    }

    pub fn with_fallback(mut self, fallback: impl Into<String>) -> Self {
        self.fallback = fallback.into();
        self
    }

    /// Parse a YAML script.
    pub fn from_yaml(yaml: &str) -> Result<Self, ProviderError> {
        let file: ScriptFile = serde_yaml::from_str(yaml)
            .map_err(|e| ProviderError::NotConfigured(format!("invalid script: {e}")))?;

        let steps = file
            .agents
            .into_iter()
            .map(|(scope, steps)| (scope_key(&scope), VecDeque::from(steps)))
            .collect();

        Ok(Self {
            state: Mutex::new(ScriptState {
                steps,
                calls: Vec::new(),
            }),
            fallback: file.fallback.unwrap_or_else(|| DEFAULT_FALLBACK.to_string()),
        })
    }

    /// Load a YAML script from disk.
    pub fn from_file(path: &Path) -> Result<Self, ProviderError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ProviderError::NotConfigured(format!("cannot read script {}: {e}", path.display()))
        })?;
        Self::from_yaml(&text)
    }

    /// Calls answered so far, in order.
    pub async fn calls(&self) -> Vec<ScriptedCall> {
        self.state.lock().await.calls.clone()
    }

    /// Number of calls answered for `scope`.
    pub async fn calls_for(&self, scope: &str) -> usize {
        let key = scope_key(scope);
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| c.scope_path == key)
            .count()
    }
}

/// Normalize a script key to the tree's project-relative form.
fn scope_key(scope: &str) -> PathBuf {
    let trimmed = scope.trim().trim_matches('/');
    match trimmed {
        "" | "." => PathBuf::new(),
        other => PathBuf::from(other.trim_start_matches("./")),
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    async fn complete(&self, prompt: &PromptContext) -> Result<String, ProviderError> {
        let step = {
            let mut state = self.state.lock().await;
            state.calls.push(ScriptedCall {
                agent_id: prompt.agent_id,
                scope_path: prompt.scope_path.clone(),
                last_user_message: prompt.last_user_message().map(str::to_string),
            });
            state
                .steps
                .get_mut(&prompt.scope_path)
                .and_then(VecDeque::pop_front)
        };

        #[cfg(feature = "telemetry")]
        debug!(
            agent = %prompt.agent_id,
            scope = %prompt.scope_path.display(),
            scripted = step.is_some(),
            "Scripted completion"
        );

        match step {
            None => Ok(self.fallback.clone()),
            Some(ScriptStep::Text(text)) => Ok(text),
            Some(ScriptStep::Detailed(detail)) => {
                if detail.delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(detail.delay_ms)).await;
                }
                match (detail.error, detail.reply) {
                    (Some(failure), _) => Err(failure.to_error()),
                    (None, Some(reply)) => Ok(reply),
                    (None, None) => Ok(self.fallback.clone()),
                }
            }
        }
    }

    fn name(&self) -> &str {
        "Scripted"
    }

    fn model(&self) -> &str {
        "script"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentRole;

    fn prompt_for(scope: &str) -> PromptContext {
        PromptContext {
            agent_id: AgentId(1),
            role: AgentRole::Coder,
            scope_path: scope_key(scope),
            system: String::new(),
            messages: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_steps_consumed_in_order_then_fallback() {
        let provider = ScriptedProvider::new()
            .on("src/lib.rs", ["first", "second"])
            .with_fallback("FINISH");

        let p = prompt_for("src/lib.rs");
        assert_eq!(provider.complete(&p).await.unwrap(), "first");
        assert_eq!(provider.complete(&p).await.unwrap(), "second");
        assert_eq!(provider.complete(&p).await.unwrap(), "FINISH");
        assert_eq!(provider.calls_for("src/lib.rs").await, 3);
    }

    #[tokio::test]
    async fn test_yaml_script_with_errors() {
        let yaml = r#"
fallback: "FINISH FAILURE: out of script"
agents:
  ".":
    - error: rate_limited
    - reply: "CREATE src/"
      delayMs: 5
"#;
        let provider = ScriptedProvider::from_yaml(yaml).unwrap();
        let root = prompt_for(".");

        let err = provider.complete(&root).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(provider.complete(&root).await.unwrap(), "CREATE src/");
        assert_eq!(
            provider.complete(&prompt_for("other")).await.unwrap(),
            "FINISH FAILURE: out of script"
        );
    }

    #[test]
    fn test_invalid_yaml() {
        assert!(matches!(
            ScriptedProvider::from_yaml("agents: [1, 2"),
            Err(ProviderError::NotConfigured(_))
        ));
    }

    #[test]
    fn test_scope_key_normalization() {
        assert_eq!(scope_key("."), PathBuf::new());
        assert_eq!(scope_key("/"), PathBuf::new());
        assert_eq!(scope_key("./src/"), PathBuf::from("src"));
    }
}
