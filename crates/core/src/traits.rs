use crate::config::LlmConfig;
use crate::error::GenerationError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Per-request generation bounds. The gateway clamps these to its caps.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub context_tokens: u32,
    pub max_output_tokens: u32,
    pub temperature: f32,
}

impl GenerationParams {
    pub fn from_config(config: &LlmConfig) -> Self {
        Self {
            context_tokens: config.context_tokens,
            max_output_tokens: config.max_output_tokens,
            temperature: config.temperature,
        }
    }

    /// Half the context and output budget, used for the single retry.
    pub fn reduced(&self) -> Self {
        Self {
            context_tokens: (self.context_tokens / 2).max(1),
            max_output_tokens: (self.max_output_tokens / 2).max(1),
            temperature: self.temperature,
        }
    }

    pub fn clamped_to(&self, caps: &GenerationParams) -> Self {
        Self {
            context_tokens: self.context_tokens.clamp(1, caps.context_tokens),
            max_output_tokens: self.max_output_tokens.clamp(1, caps.max_output_tokens),
            temperature: self.temperature.clamp(0.0, 2.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderStatus {
    Available,
    Unavailable(String),
}

impl ProviderStatus {
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available)
    }
}

impl std::fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Available => write!(f, "available"),
            Self::Unavailable(reason) => write!(f, "unavailable ({reason})"),
        }
    }
}

/// A text-generation backend.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, GenerationError>;

    async fn status(&self) -> ProviderStatus;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reduced_params_halve_budgets() {
        let params = GenerationParams {
            context_tokens: 1024,
            max_output_tokens: 256,
            temperature: 0.7,
        };
        let reduced = params.reduced();
        assert_eq!(reduced.context_tokens, 512);
        assert_eq!(reduced.max_output_tokens, 128);
        assert_eq!(reduced.temperature, 0.7);
    }

    #[test]
    fn clamping_never_exceeds_caps() {
        let caps = GenerationParams::from_config(&LlmConfig::default());
        let asked = GenerationParams {
            context_tokens: 8192,
            max_output_tokens: 0,
            temperature: 5.0,
        };
        let clamped = asked.clamped_to(&caps);
        assert_eq!(clamped.context_tokens, 1024);
        assert_eq!(clamped.max_output_tokens, 1);
        assert_eq!(clamped.temperature, 2.0);
    }
}
