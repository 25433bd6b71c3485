use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid document {filename}: {reason}")]
    InvalidDocument { filename: String, reason: String },

    #[error("document limit reached: at most {limit} documents per session")]
    LimitExceeded { limit: usize },

    #[error("no extractable text in {0}")]
    EmptyDocument(String),
}

impl IngestError {
    pub(crate) fn invalid(filename: &str, reason: impl Into<String>) -> Self {
        Self::InvalidDocument {
            filename: filename.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("metadata key `{key}` holds a non-scalar value ({found})")]
    MetadataType { key: String, found: String },

    #[error("embedding dimension {actual} does not match collection dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("invalid collection name: {0}")]
    InvalidCollection(String),

    #[error("index io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("index serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("{provider} did not answer within {after:?}")]
    Timeout { provider: String, after: Duration },

    #[error("{provider} is unavailable: {reason}")]
    ProviderUnavailable { provider: String, reason: String },

    #[error("invalid response from {provider}: {details}")]
    InvalidResponse { provider: String, details: String },

    #[error("request too large for {provider}: {details}")]
    RequestTooLarge { provider: String, details: String },
}

impl GenerationError {
    /// Whether a second attempt with a smaller prompt and output budget may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::ProviderUnavailable { .. })
    }
}

#[derive(Debug, Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub String);

/// A file that could not be ingested, reported next to the ones that were.
#[derive(Debug, Clone)]
pub struct FileFailure {
    pub filename: String,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session {0} was cleared")]
    Cleared(String),

    #[error("question is empty")]
    EmptyQuestion,

    #[error("none of the {} uploaded file(s) could be ingested", failures.len())]
    NothingIngested { failures: Vec<FileFailure> },

    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// What the person asking should do about a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserGuidance {
    RetryLater,
    ShortenQuestion,
    FixInput,
    Internal,
}

impl SessionError {
    pub fn guidance(&self) -> UserGuidance {
        match self {
            Self::Generation(GenerationError::RequestTooLarge { .. }) => {
                UserGuidance::ShortenQuestion
            }
            Self::Generation(_) => UserGuidance::RetryLater,
            Self::EmptyQuestion | Self::NothingIngested { .. } | Self::Ingest(_) => {
                UserGuidance::FixInput
            }
            Self::NotFound(_) | Self::Cleared(_) => UserGuidance::FixInput,
            Self::Index(_) | Self::Config(_) => UserGuidance::Internal,
        }
    }

    pub fn user_message(&self) -> String {
        match self.guidance() {
            UserGuidance::RetryLater => format!(
                "The language model is temporarily unavailable, please retry in a moment ({self})."
            ),
            UserGuidance::ShortenQuestion => {
                "The request is too large for the language model, try a shorter question.".to_string()
            }
            UserGuidance::FixInput => self.to_string(),
            UserGuidance::Internal => format!("Internal error: {self}"),
        }
    }
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
