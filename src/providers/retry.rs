// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Retry with exponential backoff for transient provider failures.

use std::time::Duration;

#[cfg(feature = "telemetry")]
use tracing::warn;

use super::{CompletionProvider, PromptContext};
use crate::config::RetryConfig;
use crate::error::ProviderError;

/// Backoff parameters for provider calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Call `provider`, retrying retryable errors according to `policy`.
///
/// Non-retryable errors are returned immediately; the last retryable error is
/// returned once the retries are exhausted.
pub async fn complete_with_retry(
    provider: &dyn CompletionProvider,
    prompt: &PromptContext,
    policy: &RetryPolicy,
) -> Result<String, ProviderError> {
    let mut attempt = 0;
    loop {
        match provider.complete(prompt).await {
            Ok(text) => return Ok(text),
            Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.backoff_for(attempt);
                #[cfg(feature = "telemetry")]
                warn!(
                    agent = %prompt.agent_id,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying provider call"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentId, AgentRole};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails `failures` times with `error`, then answers "ok".
    struct Flaky {
        failures: u32,
        error: ProviderError,
        calls: AtomicU32,
    }

    #[async_trait]
    impl CompletionProvider for Flaky {
        async fn complete(&self, _prompt: &PromptContext) -> Result<String, ProviderError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(self.error.clone())
            } else {
                Ok("ok".to_string())
            }
        }

        fn name(&self) -> &str {
            "flaky"
        }

        fn model(&self) -> &str {
            "flaky"
        }
    }

    fn prompt() -> PromptContext {
        PromptContext {
            agent_id: AgentId(1),
            role: AgentRole::Coder,
            scope_path: PathBuf::from("a.rs"),
            system: String::new(),
            messages: Vec::new(),
        }
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(250),
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let p = policy(5);
        assert_eq!(p.backoff_for(0), Duration::from_millis(100));
        assert_eq!(p.backoff_for(1), Duration::from_millis(200));
        assert_eq!(p.backoff_for(2), Duration::from_millis(250));
        assert_eq!(p.backoff_for(40), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_errors() {
        let provider = Flaky {
            failures: 2,
            error: ProviderError::RateLimited("busy".to_string()),
            calls: AtomicU32::new(0),
        };
        let text = complete_with_retry(&provider, &prompt(), &policy(3)).await.unwrap();
        assert_eq!(text, "ok");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let provider = Flaky {
            failures: 10,
            error: ProviderError::NetworkError("down".to_string()),
            calls: AtomicU32::new(0),
        };
        let err = complete_with_retry(&provider, &prompt(), &policy(2)).await.unwrap_err();
        assert!(matches!(err, ProviderError::NetworkError(_)));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_fast() {
        let provider = Flaky {
            failures: 1,
            error: ProviderError::AuthError("bad key".to_string()),
            calls: AtomicU32::new(0),
        };
        let err = complete_with_retry(&provider, &prompt(), &policy(3)).await.unwrap_err();
        assert!(matches!(err, ProviderError::AuthError(_)));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }
}
