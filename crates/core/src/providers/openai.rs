use super::{non_empty, status_error, transport_error};
use crate::config::{parse_endpoint, LlmConfig};
use crate::error::{ConfigError, GenerationError};
use crate::traits::{GenerationParams, LlmProvider, ProviderStatus};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;
use url::Url;

const PROVIDER: &str = "openai";

/// Hosted chat-completions API.
pub struct OpenAiProvider {
    base: Url,
    api_key: String,
    model: String,
    client: Client,
    request_timeout: Duration,
    health_timeout: Duration,
}

impl OpenAiProvider {
    pub fn new(config: &LlmConfig) -> Result<Self, ConfigError> {
        let api_key = config
            .openai
            .api_key
            .clone()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| ConfigError("the openai provider requires an API key".to_string()))?;

        Ok(Self {
            base: parse_endpoint(&config.openai.base_url)?,
            api_key,
            model: config.openai.model.clone(),
            client: Client::new(),
            request_timeout: config.request_timeout,
            health_timeout: config.health_timeout,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, GenerationError> {
        self.base
            .join(path)
            .map_err(|error| GenerationError::ProviderUnavailable {
                provider: PROVIDER.to_string(),
                reason: format!("bad endpoint: {error}"),
            })
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, GenerationError> {
        let response = self
            .client
            .post(self.endpoint("chat/completions")?)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": [{ "role": "user", "content": prompt }],
                "max_tokens": params.max_output_tokens,
                "temperature": params.temperature,
            }))
            .send()
            .await
            .map_err(|error| transport_error(PROVIDER, error, self.request_timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(PROVIDER, status, &body));
        }

        let parsed: Value = response
            .json()
            .await
            .map_err(|error| transport_error(PROVIDER, error, self.request_timeout))?;
        debug!(
            model = %self.model,
            total_tokens = parsed.pointer("/usage/total_tokens").and_then(serde_json::Value::as_u64),
            "openai completion finished"
        );

        if parsed.pointer("/choices/0/finish_reason").and_then(Value::as_str) == Some("length") {
            debug!("openai completion stopped at the output token cap");
        }

        let text = parsed
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string);
        non_empty(PROVIDER, text)
    }

    async fn status(&self) -> ProviderStatus {
        let url = match self.endpoint("models") {
            Ok(url) => url,
            Err(error) => return ProviderStatus::Unavailable(error.to_string()),
        };
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.api_key)
            .timeout(self.health_timeout)
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => ProviderStatus::Available,
            Ok(response) if response.status() == StatusCode::UNAUTHORIZED => {
                ProviderStatus::Unavailable("invalid API key".to_string())
            }
            Ok(response) => ProviderStatus::Unavailable(format!("openai answered {}", response.status())),
            Err(error) => ProviderStatus::Unavailable(format!("openai unreachable: {error}")),
        }
    }
}
