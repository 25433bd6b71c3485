//! Single entry point for text generation.
//!
//! The gateway owns the provider chosen by configuration, plus every other
//! configured provider for health reporting only. Generation always goes to
//! the chosen one, and the same rules apply to every call: parameters are clamped to the configured caps, prompts
//! estimated above the context cap are refused before dispatch, and the whole
//! call is bounded by the request timeout. Dropping the returned future
//! cancels the in-flight HTTP request.

use crate::config::{LlmConfig, ProviderKind};
use crate::error::{ConfigError, GenerationError};
use crate::providers::{OllamaProvider, OpenAiProvider};
use crate::traits::{GenerationParams, LlmProvider, ProviderStatus};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const CHARS_PER_TOKEN: usize = 4;

/// Rough token count used to refuse oversized prompts up front.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

pub struct LlmGateway {
    provider: Box<dyn LlmProvider>,
    standby: Vec<Box<dyn LlmProvider>>,
    timeout: Duration,
    health_timeout: Duration,
    caps: GenerationParams,
}

impl LlmGateway {
    /// Ollama counts as configured always, OpenAI once an API key is set.
    pub fn from_config(config: &LlmConfig) -> Result<Self, ConfigError> {
        let mut gateway = Self::new(build_provider(config.provider, config)?, config);
        for kind in [ProviderKind::Ollama, ProviderKind::OpenAi] {
            if kind == config.provider || !is_configured(kind, config) {
                continue;
            }
            match build_provider(kind, config) {
                Ok(provider) => gateway.standby.push(provider),
                Err(error) => warn!(provider = kind.as_str(), %error, "configured provider skipped"),
            }
        }
        Ok(gateway)
    }

    pub fn new(provider: Box<dyn LlmProvider>, config: &LlmConfig) -> Self {
        Self {
            provider,
            standby: Vec::new(),
            timeout: config.request_timeout,
            health_timeout: config.health_timeout,
            caps: GenerationParams::from_config(config),
        }
    }

    /// Adds a provider that is reported by [`statuses`](Self::statuses) but
    /// never used for generation.
    pub fn with_standby(mut self, provider: Box<dyn LlmProvider>) -> Self {
        self.standby.push(provider);
        self
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn default_params(&self) -> GenerationParams {
        self.caps
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Health of the provider used for generation.
    pub async fn status(&self) -> ProviderStatus {
        self.check_health(&*self.provider).await
    }

    /// Health of every configured provider, the active one first.
    pub async fn statuses(&self) -> Vec<(String, ProviderStatus)> {
        let mut statuses = Vec::with_capacity(1 + self.standby.len());
        for provider in std::iter::once(&self.provider).chain(&self.standby) {
            statuses.push((provider.name().to_string(), self.check_health(&**provider).await));
        }
        statuses
    }

    async fn check_health(&self, provider: &dyn LlmProvider) -> ProviderStatus {
        match tokio::time::timeout(self.health_timeout, provider.status()).await {
            Ok(status) => status,
            Err(_) => ProviderStatus::Unavailable(format!(
                "health check did not answer within {:?}",
                self.health_timeout
            )),
        }
    }

    /// Fails fast with `ProviderUnavailable` when the health check fails.
    pub async fn ensure_available(&self) -> Result<(), GenerationError> {
        match self.status().await {
            ProviderStatus::Available => Ok(()),
            ProviderStatus::Unavailable(reason) => {
                warn!(provider = self.provider_name(), %reason, "provider unavailable");
                Err(GenerationError::ProviderUnavailable {
                    provider: self.provider_name().to_string(),
                    reason,
                })
            }
        }
    }

    pub async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, GenerationError> {
        let params = params.clamped_to(&self.caps);
        let estimated = estimate_tokens(prompt);
        if estimated > params.context_tokens as usize {
            return Err(GenerationError::RequestTooLarge {
                provider: self.provider_name().to_string(),
                details: format!(
                    "prompt is about {estimated} tokens, limit is {}",
                    params.context_tokens
                ),
            });
        }

        let started = Instant::now();
        let outcome = tokio::time::timeout(self.timeout, self.provider.generate(prompt, &params)).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(Ok(text)) => {
                debug!(
                    provider = self.provider_name(),
                    prompt_tokens = estimated,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "generation finished"
                );
                Ok(text)
            }
            Ok(Err(GenerationError::Timeout { provider, .. })) => Err(GenerationError::Timeout {
                provider,
                after: elapsed,
            }),
            Ok(Err(error)) => Err(error),
            Err(_) => {
                warn!(
                    provider = self.provider_name(),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "generation timed out"
                );
                Err(GenerationError::Timeout {
                    provider: self.provider_name().to_string(),
                    after: self.timeout,
                })
            }
        }
    }
}

fn is_configured(kind: ProviderKind, config: &LlmConfig) -> bool {
    match kind {
        ProviderKind::Ollama => true,
        ProviderKind::OpenAi => config.openai.api_key.as_deref().is_some_and(|key| !key.is_empty()),
    }
}

fn build_provider(kind: ProviderKind, config: &LlmConfig) -> Result<Box<dyn LlmProvider>, ConfigError> {
    Ok(match kind {
        ProviderKind::Ollama => Box::new(OllamaProvider::new(config)?),
        ProviderKind::OpenAi => Box::new(OpenAiProvider::new(config)?),
    })
}
