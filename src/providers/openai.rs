// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! OpenAI-compatible chat-completions provider.
//!
//! Works with OpenAI, Ollama and any endpoint that speaks the
//! `/chat/completions` protocol. Only plain text completions are used; the
//! directive language is carried in the message content.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

#[cfg(feature = "telemetry")]
use tracing::debug;

#[cfg(feature = "telemetry")]
use crate::telemetry::metrics::GLOBAL_METRICS;

use super::{CompletionProvider, PromptContext, PromptRole};
use crate::error::ProviderError;

/// Default OpenAI API base URL.
pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Default Ollama API base URL.
pub const OLLAMA_BASE_URL: &str = "http://localhost:11434/v1";

/// Default max tokens if not specified.
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// OpenAI-compatible provider.
pub struct OpenAiCompatibleProvider {
    client: Client,
    api_key: Option<String>,
    model: String,
    base_url: String,
    max_tokens: u32,
    temperature: Option<f32>,
    provider_name: String,
}

impl OpenAiCompatibleProvider {
    pub fn new(api_key: Option<String>, model: impl Into<String>, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        let provider_name = Self::detect_provider_name(&base_url);
        Self {
            client: Client::new(),
            api_key,
            model: model.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: None,
            provider_name,
        }
    }

    /// Create a provider for Ollama (no API key needed).
    pub fn ollama(model: impl Into<String>) -> Self {
        Self::new(None, model, OLLAMA_BASE_URL)
    }

    /// Rebuild the HTTP client with a request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, ProviderError> {
        let timeout = if timeout.is_zero() {
            Duration::from_secs(DEFAULT_TIMEOUT_SECS)
        } else {
            timeout
        };
        self.client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("failed to build HTTP client: {e}")))?;
        Ok(self)
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Detect provider name from base URL.
    fn detect_provider_name(base_url: &str) -> String {
        if base_url.contains("openai.com") {
            "OpenAI".to_string()
        } else if base_url.contains("localhost:11434") || base_url.contains("ollama") {
            "Ollama".to_string()
        } else if base_url.contains("groq") {
            "Groq".to_string()
        } else if base_url.contains("deepseek") {
            "DeepSeek".to_string()
        } else {
            "OpenAI-Compatible".to_string()
        }
    }

    fn build_request(&self, prompt: &PromptContext) -> ChatRequest {
        let mut messages = Vec::with_capacity(prompt.messages.len() + 1);
        if !prompt.system.is_empty() {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: prompt.system.clone(),
            });
        }
        for message in &prompt.messages {
            messages.push(ChatMessage {
                role: match message.role {
                    PromptRole::User => "user".to_string(),
                    PromptRole::Assistant => "assistant".to_string(),
                },
                content: message.content.clone(),
            });
        }

        ChatRequest {
            model: self.model.clone(),
            messages,
            max_tokens: Some(self.max_tokens),
            temperature: self.temperature,
        }
    }

    /// Map an error response body onto a [`ProviderError`].
    fn handle_error_response(&self, status_code: u16, body: &str) -> ProviderError {
        if let Ok(error) = serde_json::from_str::<ApiError>(body) {
            let message = error.error.message;
            match error.error.error_type.as_deref() {
                Some("authentication_error") | Some("invalid_api_key") => {
                    ProviderError::AuthError(message)
                }
                Some("rate_limit_error") | Some("rate_limit_exceeded") => {
                    ProviderError::RateLimited(message)
                }
                Some("model_not_found") => ProviderError::ModelNotFound(message),
                _ => ProviderError::api(message, status_code),
            }
        } else if status_code == 429 {
            ProviderError::RateLimited(body.to_string())
        } else if status_code == 401 {
            ProviderError::AuthError(body.to_string())
        } else {
            ProviderError::api(body.to_string(), status_code)
        }
    }
}

#[async_trait]
impl CompletionProvider for OpenAiCompatibleProvider {
    async fn complete(&self, prompt: &PromptContext) -> Result<String, ProviderError> {
        let request = self.build_request(prompt);
        let start = Instant::now();
        let operation_name = format!(
            "{}.complete",
            self.provider_name.to_lowercase().replace(' ', "_")
        );

        #[cfg(feature = "telemetry")]
        debug!(
            model = %self.model,
            agent = %prompt.agent_id,
            messages = request.messages.len(),
            "Sending completion request"
        );

        let mut req = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("content-type", "application/json");

        if let Some(ref api_key) = self.api_key {
            req = req.header("authorization", format!("Bearer {api_key}"));
        }

        let response = req.json(&request).send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(start.elapsed().as_millis() as u64)
            } else {
                ProviderError::NetworkError(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            #[cfg(feature = "telemetry")]
            GLOBAL_METRICS.record_operation(&operation_name, start.elapsed());
            return Err(self.handle_error_response(status.as_u16(), &error_text));
        }

        let api_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::ParseError(e.to_string()))?;

        #[cfg(feature = "telemetry")]
        {
            GLOBAL_METRICS.record_operation(&operation_name, start.elapsed());
            if let Some(ref usage) = api_response.usage {
                GLOBAL_METRICS.record_tokens(usage.prompt_tokens, usage.completion_tokens);
            }
        }
        #[cfg(not(feature = "telemetry"))]
        let _ = operation_name;

        api_response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ProviderError::ParseError("response contained no choices".to_string()))
    }

    fn name(&self) -> &str {
        &self.provider_name
    }

    fn model(&self) -> &str {
        &self.model
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
    #[serde(rename = "type")]
    error_type: Option<String>,
}
