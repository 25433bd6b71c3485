use super::{non_empty, status_error, transport_error};
use crate::config::{parse_endpoint, LlmConfig};
use crate::error::{ConfigError, GenerationError};
use crate::traits::{GenerationParams, LlmProvider, ProviderStatus};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;
use url::Url;

const PROVIDER: &str = "ollama";

/// Local model server speaking the Ollama HTTP API.
pub struct OllamaProvider {
    base: Url,
    model: String,
    client: Client,
    request_timeout: Duration,
    health_timeout: Duration,
}

impl OllamaProvider {
    pub fn new(config: &LlmConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            base: parse_endpoint(&config.ollama.base_url)?,
            model: config.ollama.model.clone(),
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
impl LlmProvider for OllamaProvider {
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
            .post(self.endpoint("api/generate")?)
            .json(&json!({
                "model": self.model,
                "prompt": prompt,
                "stream": false,
                "options": {
                    "num_ctx": params.context_tokens,
                    "num_predict": params.max_output_tokens,
                    "temperature": params.temperature,
                },
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
            eval_count = parsed.pointer("/eval_count").and_then(serde_json::Value::as_u64),
            "ollama generation finished"
        );

        let text = parsed
            .pointer("/response")
            .and_then(Value::as_str)
            .map(str::to_string);
        non_empty(PROVIDER, text)
    }

    async fn status(&self) -> ProviderStatus {
        let url = match self.endpoint("api/tags") {
            Ok(url) => url,
            Err(error) => return ProviderStatus::Unavailable(error.to_string()),
        };
        let response = match self.client.get(url).timeout(self.health_timeout).send().await {
            Ok(response) => response,
            Err(error) => return ProviderStatus::Unavailable(format!("ollama unreachable: {error}")),
        };
        if !response.status().is_success() {
            return ProviderStatus::Unavailable(format!("ollama answered {}", response.status()));
        }

        let tags: Value = match response.json().await {
            Ok(tags) => tags,
            Err(error) => return ProviderStatus::Unavailable(format!("unreadable model list: {error}")),
        };
        let pulled = tags
            .pointer("/models")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|model| model.pointer("/name").and_then(Value::as_str))
            .any(|name| name == self.model || name.starts_with(&format!("{}:", self.model)));

        if pulled {
            ProviderStatus::Available
        } else {
            ProviderStatus::Unavailable(format!("model {} is not pulled", self.model))
        }
    }
}
