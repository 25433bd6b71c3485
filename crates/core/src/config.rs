//! Process-wide configuration.
//!
//! [`CopilotConfig`] is built once at startup (the CLI fills it from flags and
//! environment variables) and handed to every component by reference. Nothing
//! in the library reads the environment on its own.

use crate::chunking::ChunkingConfig;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

pub const DEFAULT_MAX_DOCUMENTS: usize = 5;
pub const DEFAULT_MAX_FILE_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopilotConfig {
    pub limits: DocumentLimits,
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalConfig,
    pub llm: LlmConfig,
    pub index_dir: PathBuf,
}

impl Default for CopilotConfig {
    fn default() -> Self {
        Self {
            limits: DocumentLimits::default(),
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            llm: LlmConfig::default(),
            index_dir: PathBuf::from("data/index"),
        }
    }
}

impl CopilotConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limits.max_documents == 0 {
            return Err(ConfigError("max_documents must be at least 1".to_string()));
        }
        if self.limits.max_file_bytes == 0 {
            return Err(ConfigError("max_file_bytes must be at least 1".to_string()));
        }
        self.chunking.validate()?;
        self.retrieval.validate()?;
        self.llm.validate()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DocumentLimits {
    pub max_documents: usize,
    pub max_file_bytes: u64,
}

impl Default for DocumentLimits {
    fn default() -> Self {
        Self {
            max_documents: DEFAULT_MAX_DOCUMENTS,
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub top_k: usize,
    /// Inclusive lower bound on the normalized relevance score.
    pub relevance_threshold: f32,
    /// Maximum characters of retrieved chunk text placed in one prompt.
    pub context_char_budget: usize,
    pub embedding_dimensions: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            relevance_threshold: 0.1,
            context_char_budget: 3_000,
            embedding_dimensions: crate::embeddings::DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl RetrievalConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.top_k == 0 {
            return Err(ConfigError("top_k must be greater than zero".to_string()));
        }
        if !(0.0..=1.0).contains(&self.relevance_threshold) {
            return Err(ConfigError(format!(
                "relevance_threshold {} is outside [0, 1]",
                self.relevance_threshold
            )));
        }
        if self.context_char_budget == 0 {
            return Err(ConfigError(
                "context_char_budget must be greater than zero".to_string(),
            ));
        }
        if self.embedding_dimensions == 0 {
            return Err(ConfigError(
                "embedding_dimensions must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Ollama,
    OpenAi,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::OpenAi => "openai",
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "openai" => Ok(Self::OpenAi),
            other => Err(ConfigError(format!("unsupported LLM provider: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub provider: ProviderKind,
    pub request_timeout: Duration,
    pub health_timeout: Duration,
    /// Cap on the estimated prompt size, in tokens.
    pub context_tokens: u32,
    pub max_output_tokens: u32,
    pub temperature: f32,
    pub openai: OpenAiSettings,
    pub ollama: OllamaSettings,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Ollama,
            request_timeout: Duration::from_secs(90),
            health_timeout: Duration::from_secs(5),
            context_tokens: 1_024,
            max_output_tokens: 256,
            temperature: 0.7,
            openai: OpenAiSettings::default(),
            ollama: OllamaSettings::default(),
        }
    }
}

impl LlmConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout.is_zero() {
            return Err(ConfigError("request_timeout must be non-zero".to_string()));
        }
        if self.context_tokens == 0 || self.max_output_tokens == 0 {
            return Err(ConfigError(
                "context_tokens and max_output_tokens must be non-zero".to_string(),
            ));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError(format!(
                "temperature {} is outside [0, 2]",
                self.temperature
            )));
        }
        match self.provider {
            ProviderKind::OpenAi => {
                parse_endpoint(&self.openai.base_url)?;
                if self.openai.api_key.as_deref().map_or(true, str::is_empty) {
                    return Err(ConfigError(
                        "the openai provider requires an API key".to_string(),
                    ));
                }
            }
            ProviderKind::Ollama => {
                parse_endpoint(&self.ollama.base_url)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiSettings {
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
}

impl Default for OpenAiSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "gpt-3.5-turbo".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaSettings {
    pub base_url: String,
    pub model: String,
}

impl Default for OllamaSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "llama3.2".to_string(),
        }
    }
}

/// Parses a provider base URL so that `join` keeps its path segments.
pub fn parse_endpoint(raw: &str) -> Result<Url, ConfigError> {
    let trimmed = raw.trim();
    let with_slash = if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    };
    Url::parse(&with_slash).map_err(|error| ConfigError(format!("invalid endpoint {raw}: {error}")))
}
