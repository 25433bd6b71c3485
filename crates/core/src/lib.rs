pub mod agents;
pub mod chunking;
pub mod config;
pub mod context;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod gateway;
pub mod index;
pub mod ingest;
pub mod metadata;
pub mod models;
pub mod orchestrator;
pub mod providers;
pub mod session;
pub mod traits;

pub use agents::{DocumentView, IntentDetector};
pub use chunking::{normalize_whitespace, Chunker, ChunkingConfig};
pub use config::{
    CopilotConfig, DocumentLimits, LlmConfig, OllamaSettings, OpenAiSettings, ProviderKind,
    RetrievalConfig,
};
pub use context::{AssembledContext, ContextAssembler};
pub use embeddings::{Embedder, HashingEmbedder, DEFAULT_EMBEDDING_DIMENSIONS};
pub use error::{
    ConfigError, FileFailure, GenerationError, IndexError, IngestError, SessionError, UserGuidance,
};
pub use extractor::{LopdfExtractor, PageText, PdfExtractor};
pub use gateway::LlmGateway;
pub use index::{EmbeddingIndex, EmbeddingRecord, IndexRegistry, IndexStats, IndexedDocument};
pub use ingest::{discover_pdf_files, DocumentIngestor, Upload};
pub use metadata::{Metadata, MetadataValue};
pub use models::{
    Chunk, Classification, Document, DocumentSummary, FileOutcome, FileStatus, HistoryEntry,
    IngestionReport, QueryAnswer, QueryMode, QueryRequest, QueryTiming, SearchResult, SourceRef,
};
pub use orchestrator::{Copilot, HealthReport};
pub use providers::{OllamaProvider, OpenAiProvider};
pub use session::{Session, SessionState};
pub use traits::{GenerationParams, LlmProvider, ProviderStatus};
