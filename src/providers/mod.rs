// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Completion providers.
//!
//! Every agent turn is one call to [`CompletionProvider::complete`]: the
//! coordinator hands over a [`PromptContext`] built from the node's role,
//! memory and context history, and gets back raw text that the directive
//! interpreter parses.
//!
//! - [`openai::OpenAiCompatibleProvider`] - OpenAI, Ollama and any
//!   chat-completions compatible endpoint
//! - [`scripted::ScriptedProvider`] - replays canned replies per agent scope
//!
//! Transient failures are retried by [`retry::complete_with_retry`].
//!
//! ```rust,ignore
//! use codetree::providers::{create_provider, complete_with_retry, RetryPolicy};
//!
//! let provider = create_provider(&config)?;
//! let text = complete_with_retry(provider.as_ref(), &prompt, &RetryPolicy::default()).await?;
//! ```

pub mod openai;
pub mod retry;
pub mod scripted;

pub use openai::OpenAiCompatibleProvider;
pub use retry::{complete_with_retry, RetryPolicy};
pub use scripted::ScriptedProvider;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::agent::{AgentId, AgentRole};
use crate::config::ResolvedConfig;
use crate::error::ProviderError;

/// Speaker of one prompt message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptRole {
    User,
    Assistant,
}

/// One message of a prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: PromptRole,
    pub content: String,
}

impl PromptMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::Assistant,
            content: content.into(),
        }
    }
}

/// Everything a provider needs for one agent turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptContext {
    pub agent_id: AgentId,
    pub role: AgentRole,
    pub scope_path: PathBuf,
    pub system: String,
    pub messages: Vec<PromptMessage>,
}

impl PromptContext {
    /// Content of the most recent user message, if any.
    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == PromptRole::User)
            .map(|m| m.content.as_str())
    }
}

/// A backend that turns a prompt into text.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, prompt: &PromptContext) -> Result<String, ProviderError>;

    /// Display name of the backend.
    fn name(&self) -> &str;

    /// Model identifier in use.
    fn model(&self) -> &str;
}

/// Shared provider handle.
pub type BoxedProvider = Arc<dyn CompletionProvider>;

/// Supported provider types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderType {
    /// OpenAI GPT models
    OpenAI,
    /// Ollama local models
    Ollama,
    /// Any OpenAI-compatible API
    OpenAICompatible,
    /// Replies replayed from a script file
    Scripted,
}

impl ProviderType {
    /// Get the default model for this provider.
    pub fn default_model(&self) -> &'static str {
        match self {
            Self::OpenAI | Self::OpenAICompatible => "gpt-4o",
            Self::Ollama => "llama3.2",
            Self::Scripted => "script",
        }
    }

    /// Get the default base URL for this provider.
    pub fn default_base_url(&self) -> &'static str {
        match self {
            Self::OpenAI | Self::OpenAICompatible => openai::OPENAI_BASE_URL,
            Self::Ollama => openai::OLLAMA_BASE_URL,
            Self::Scripted => "",
        }
    }

    /// Environment variable consulted for the API key when none is configured.
    pub fn default_api_key_env(&self) -> Option<&'static str> {
        match self {
            Self::OpenAI => Some("OPENAI_API_KEY"),
            Self::OpenAICompatible => Some("OPENAI_API_KEY"),
            Self::Ollama | Self::Scripted => None,
        }
    }
}

/// Error type for parsing a provider type from a string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseProviderTypeError;

impl std::fmt::Display for ParseProviderTypeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid provider type")
    }
}

impl std::error::Error for ParseProviderTypeError {}

impl std::str::FromStr for ProviderType {
    type Err = ParseProviderTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" | "gpt" => Ok(Self::OpenAI),
            "ollama" => Ok(Self::Ollama),
            "openai-compatible" | "openai_compatible" => Ok(Self::OpenAICompatible),
            "scripted" | "script" => Ok(Self::Scripted),
            _ => Err(ParseProviderTypeError),
        }
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OpenAI => write!(f, "OpenAI"),
            Self::Ollama => write!(f, "Ollama"),
            Self::OpenAICompatible => write!(f, "OpenAI-Compatible"),
            Self::Scripted => write!(f, "Scripted"),
        }
    }
}

/// Create the provider selected by a resolved configuration.
///
/// # Errors
///
/// Returns `ProviderError::NotConfigured` for an unknown provider name, a
/// scripted provider without a script, or a hosted provider without a key.
pub fn create_provider(config: &ResolvedConfig) -> Result<BoxedProvider, ProviderError> {
    let provider_type: ProviderType = config
        .provider
        .parse()
        .map_err(|_| ProviderError::NotConfigured(format!("unknown provider: {}", config.provider)))?;

    let model = config
        .model
        .clone()
        .unwrap_or_else(|| provider_type.default_model().to_string());

    match provider_type {
        ProviderType::Scripted => {
            let path = config.script.as_ref().ok_or_else(|| {
                ProviderError::NotConfigured("scripted provider requires a script file".to_string())
            })?;
            Ok(Arc::new(ScriptedProvider::from_file(path)?))
        }
        ProviderType::OpenAI | ProviderType::Ollama | ProviderType::OpenAICompatible => {
            let base_url = config
                .base_url
                .clone()
                .unwrap_or_else(|| provider_type.default_base_url().to_string());

            let key_env = config
                .api_key_env
                .as_deref()
                .or(provider_type.default_api_key_env());
            let api_key = key_env.and_then(|var| std::env::var(var).ok());

            if provider_type == ProviderType::OpenAI && api_key.is_none() {
                return Err(ProviderError::NotConfigured(format!(
                    "set {} to use the OpenAI provider",
                    key_env.unwrap_or("OPENAI_API_KEY")
                )));
            }

            let provider = OpenAiCompatibleProvider::new(api_key, model, base_url)
                .with_timeout(std::time::Duration::from_secs(config.request_timeout_secs))?;
            Ok(Arc::new(provider))
        }
    }
}
