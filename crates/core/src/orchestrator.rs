use crate::agents::{self, DocumentView, IntentDetector};
use crate::chunking::Chunker;
use crate::config::CopilotConfig;
use crate::context::ContextAssembler;
use crate::embeddings::{Embedder, HashingEmbedder};
use crate::error::{ConfigError, FileFailure, GenerationError, IndexError, IngestError, SessionError};
use crate::gateway::LlmGateway;
use crate::index::{EmbeddingIndex, EmbeddingRecord, IndexRegistry, IndexStats, IndexedDocument};
use crate::ingest::{DocumentIngestor, Upload};
use crate::metadata::Metadata;
use crate::models::{
    Chunk, Classification, Document, DocumentSummary, FileOutcome, FileStatus, HistoryEntry,
    IngestionReport, QueryAnswer, QueryMode, QueryRequest, QueryTiming, SourceRef,
};
use crate::session::{Session, SessionState, Workspace};
use crate::traits::ProviderStatus;
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

const COMPARE_HITS_PER_DOCUMENT: usize = 3;

#[derive(Debug, Clone)]
pub struct HealthReport {
    /// Provider that answers questions.
    pub active_provider: String,
    /// Every configured provider with its health, the active one first.
    pub providers: Vec<(String, ProviderStatus)>,
    pub collections: Vec<IndexStats>,
}

struct Prompt {
    text: String,
    sources: Vec<SourceRef>,
    grounded: bool,
}

struct Generated {
    text: String,
    prompt: Prompt,
    attempts: u32,
    elapsed: Duration,
}

#[derive(Default)]
struct Draft {
    answer: String,
    sources: Vec<SourceRef>,
    grounded: bool,
    provider: Option<String>,
    attempts: u32,
    retrieval: Duration,
    generation: Duration,
    classifications: Vec<Classification>,
}

impl Draft {
    fn without_llm(answer: String, sources: Vec<SourceRef>) -> Self {
        Self {
            grounded: !sources.is_empty(),
            answer,
            sources,
            ..Self::default()
        }
    }
}

/// Runs uploads through extraction, chunking and indexing, and questions
/// through retrieval, prompt assembly and generation, one session at a time.
pub struct Copilot {
    config: CopilotConfig,
    registry: Arc<IndexRegistry>,
    ingestor: DocumentIngestor,
    chunker: Chunker,
    embedder: Arc<dyn Embedder>,
    gateway: LlmGateway,
    assembler: ContextAssembler,
    intents: IntentDetector,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl Copilot {
    /// Builds the provider named by the configuration and a registry rooted
    /// at `index_dir`.
    pub fn from_config(config: CopilotConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let gateway = LlmGateway::from_config(&config.llm)?;
        let registry = Arc::new(IndexRegistry::new(config.index_dir.clone()));
        Self::new(config, registry, gateway)
    }

    pub fn new(
        config: CopilotConfig,
        registry: Arc<IndexRegistry>,
        gateway: LlmGateway,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let chunker = Chunker::new(config.chunking)?;
        let intents = IntentDetector::new()
            .map_err(|error| ConfigError(format!("intent patterns: {error}")))?;

        Ok(Self {
            ingestor: DocumentIngestor::new(config.limits),
            chunker,
            embedder: Arc::new(HashingEmbedder::new(config.retrieval.embedding_dimensions)),
            assembler: ContextAssembler::new(config.retrieval.context_char_budget),
            intents,
            registry,
            gateway,
            config,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = embedder;
        self
    }

    pub fn config(&self) -> &CopilotConfig {
        &self.config
    }

    pub async fn create_session(&self) -> Result<Arc<Session>, SessionError> {
        let id = Uuid::new_v4().simple().to_string();
        self.open_session(&id).await
    }

    /// Returns the live session or reopens its persisted collection.
    pub async fn open_session(&self, id: &str) -> Result<Arc<Session>, SessionError> {
        if let Some(session) = self.sessions.read().await.get(id) {
            return Ok(Arc::clone(session));
        }

        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(id) {
            return Ok(Arc::clone(session));
        }
        let index = self.registry.open(id).await?;
        let initial = if index.is_empty().await {
            SessionState::Empty
        } else {
            SessionState::Ready
        };
        let session = Arc::new(Session::new(id, index, initial));
        sessions.insert(id.to_string(), Arc::clone(&session));
        info!(session = id, state = ?initial, "session opened");
        Ok(session)
    }

    pub async fn session(&self, id: &str) -> Result<Arc<Session>, SessionError> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    pub async fn ingest(
        &self,
        session_id: &str,
        uploads: Vec<Upload>,
    ) -> Result<IngestionReport, SessionError> {
        let session = self.session(session_id).await?;
        let mut workspace = session.lock().await;
        let transition = session.enter(SessionState::Ingesting)?;
        let index = session.index();

        let mut known: BTreeSet<String> = workspace.documents.keys().cloned().collect();
        known.extend(index.documents().await.into_iter().map(|document| document.document_id));

        let mut report = IngestionReport::default();
        let mut failures = Vec::new();
        let mut only_limit_failures = true;

        for (filename, parsed) in self.parse_all(uploads).await {
            let committed = match parsed {
                Ok(document) => self
                    .commit(index, &known, &document)
                    .await
                    .map(|chunks| (document, chunks)),
                Err(error) => Err(SessionError::from(error)),
            };

            let status = match committed {
                Ok((document, chunks)) => {
                    info!(
                        session = session_id,
                        filename = %filename,
                        document_id = %document.document_id,
                        chunks,
                        "document ingested"
                    );
                    let status = FileStatus::Ingested {
                        document_id: document.document_id.clone(),
                        pages: document.page_count,
                        chunks,
                        warnings: document.warnings.clone(),
                    };
                    known.insert(document.document_id.clone());
                    workspace.documents.insert(document.document_id.clone(), document);
                    status
                }
                Err(error) => {
                    warn!(session = session_id, filename = %filename, %error, "file not ingested");
                    if !matches!(error, SessionError::Ingest(IngestError::LimitExceeded { .. })) {
                        only_limit_failures = false;
                    }
                    failures.push(FileFailure {
                        filename: filename.clone(),
                        reason: error.to_string(),
                    });
                    FileStatus::Failed {
                        reason: error.to_string(),
                    }
                }
            };
            report.files.push(FileOutcome { filename, status });
        }

        if report.ingested() == 0 {
            if only_limit_failures && !failures.is_empty() {
                return Err(IngestError::LimitExceeded {
                    limit: self.ingestor.limits().max_documents,
                }
                .into());
            }
            return Err(SessionError::NothingIngested { failures });
        }

        transition.complete(SessionState::Ready);
        Ok(report)
    }

    async fn parse_all(&self, uploads: Vec<Upload>) -> Vec<(String, Result<Document, IngestError>)> {
        let handles: Vec<_> = uploads
            .into_iter()
            .map(|upload| {
                let ingestor = self.ingestor.clone();
                let filename = upload.filename.clone();
                let handle = tokio::task::spawn_blocking(move || {
                    ingestor.ingest(&upload.bytes, &upload.filename)
                });
                (filename, handle)
            })
            .collect();

        let mut parsed = Vec::with_capacity(handles.len());
        for (filename, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(error) => Err(IngestError::invalid(
                    &filename,
                    format!("parser task failed: {error}"),
                )),
            };
            parsed.push((filename, outcome));
        }
        parsed
    }

    /// Chunks, embeds and stores one document; returns its chunk count. A new
    /// document that fails partway is removed from the index again.
    async fn commit(
        &self,
        index: &EmbeddingIndex,
        known: &BTreeSet<String>,
        document: &Document,
    ) -> Result<usize, SessionError> {
        if !known.contains(&document.document_id) {
            self.ingestor.ensure_capacity(known.len())?;
        }

        let chunks = self.chunker.chunk(document);
        if chunks.is_empty() {
            return Err(IngestError::EmptyDocument(document.filename.clone()).into());
        }
        let texts: Vec<&str> = chunks.iter().map(|chunk| chunk.text.as_str()).collect();
        let vectors = self.embedder.embed_batch(&texts);
        let extra = document_metadata(document);

        for (chunk, vector) in chunks.iter().zip(vectors) {
            if let Err(error) = insert_with_retry(index, chunk, vector, &extra).await {
                if !known.contains(&document.document_id) {
                    match index.remove_document(&document.document_id).await {
                        Ok(removed) => debug!(
                            document_id = %document.document_id,
                            removed,
                            "rolled back partial document"
                        ),
                        Err(rollback) => warn!(
                            document_id = %document.document_id,
                            error = %rollback,
                            "could not roll back partial document"
                        ),
                    }
                }
                return Err(error.into());
            }
        }
        Ok(chunks.len())
    }

    pub async fn query(
        &self,
        session_id: &str,
        request: QueryRequest,
    ) -> Result<QueryAnswer, SessionError> {
        let question = request.question.trim().to_string();
        if question.is_empty() {
            return Err(SessionError::EmptyQuestion);
        }

        let session = self.session(session_id).await?;
        let mut workspace = session.lock().await;
        let _busy = session.enter(SessionState::Querying)?;
        let started = Instant::now();
        let index = session.index();
        let mode = request
            .mode
            .unwrap_or_else(|| self.intents.detect(&question));
        debug!(session = session_id, mode = mode.as_str(), "query started");

        let draft = match mode {
            QueryMode::Answer => self.answer(index, &question).await?,
            QueryMode::Summarize => {
                let views = document_views(&workspace, index, &request.documents).await;
                self.summarize(&question, &views).await?
            }
            QueryMode::Compare => {
                let views = document_views(&workspace, index, &request.documents).await;
                self.compare(index, &question, &views).await?
            }
            QueryMode::Classify => {
                let views = document_views(&workspace, index, &request.documents).await;
                self.classify(&views).await?
            }
            QueryMode::Metadata => {
                let views = document_views(&workspace, index, &request.documents).await;
                let sources = views.iter().map(DocumentView::source).collect();
                Draft::without_llm(agents::metadata_answer(&views), sources)
            }
        };

        let answer = QueryAnswer {
            question: question.clone(),
            mode,
            answer: draft.answer,
            sources: draft.sources,
            grounded: draft.grounded,
            provider: draft.provider,
            attempts: draft.attempts,
            timing: QueryTiming {
                retrieval: draft.retrieval,
                generation: draft.generation,
                total: started.elapsed(),
            },
            classifications: draft.classifications,
        };

        workspace.history.push(HistoryEntry {
            at: Utc::now(),
            question,
            mode,
            answer: answer.answer.clone(),
            sources: answer.sources.clone(),
        });
        info!(
            session = session_id,
            mode = mode.as_str(),
            grounded = answer.grounded,
            attempts = answer.attempts,
            total_ms = answer.timing.total.as_millis() as u64,
            "query answered"
        );
        Ok(answer)
    }

    async fn answer(&self, index: &EmbeddingIndex, question: &str) -> Result<Draft, SessionError> {
        let started = Instant::now();
        let query = self.embedder.embed(question);
        let results = index
            .search(
                &query,
                self.config.retrieval.top_k,
                self.config.retrieval.relevance_threshold,
            )
            .await?;
        let retrieval = started.elapsed();
        debug!(hits = results.len(), "retrieval finished");

        let generated = self
            .generate(|budget| {
                let context = self.assembler.with_budget(budget).assemble(question, &results);
                Prompt {
                    text: context.prompt,
                    sources: context.sources,
                    grounded: context.has_context,
                }
            })
            .await?;
        Ok(self.draft(generated, retrieval))
    }

    async fn summarize(&self, question: &str, views: &[DocumentView]) -> Result<Draft, SessionError> {
        if views.is_empty() {
            return Ok(Draft::without_llm(agents::metadata_answer(views), Vec::new()));
        }

        let mut sections = Vec::with_capacity(views.len());
        let mut draft = Draft {
            grounded: true,
            provider: Some(self.gateway.provider_name().to_string()),
            ..Draft::default()
        };
        for view in views {
            let generated = self
                .generate(|budget| Prompt {
                    text: agents::summarize_prompt(question, view, budget),
                    sources: vec![view.source()],
                    grounded: true,
                })
                .await?;
            sections.push(format!("## {}\n{}", view.filename, generated.text));
            draft.sources.extend(generated.prompt.sources);
            draft.attempts = draft.attempts.max(generated.attempts);
            draft.generation += generated.elapsed;
        }
        draft.answer = sections.join("\n\n");
        Ok(draft)
    }

    async fn compare(
        &self,
        index: &EmbeddingIndex,
        question: &str,
        views: &[DocumentView],
    ) -> Result<Draft, SessionError> {
        if views.len() < 2 {
            let sources = views.iter().map(DocumentView::source).collect();
            return Ok(Draft::without_llm(
                format!(
                    "Comparison needs at least two documents; this session has {}.",
                    views.len()
                ),
                sources,
            ));
        }

        let started = Instant::now();
        let query = self.embedder.embed(question);
        let mut sections = Vec::with_capacity(views.len());
        for view in views {
            let hits = index
                .search_document(
                    &view.document_id,
                    &query,
                    COMPARE_HITS_PER_DOCUMENT,
                    self.config.retrieval.relevance_threshold,
                )
                .await?;
            sections.push((view.clone(), hits));
        }
        let retrieval = started.elapsed();

        let generated = self
            .generate(|budget| {
                let (text, sources) = agents::compare_prompt(question, &sections, budget);
                Prompt {
                    text,
                    sources,
                    grounded: true,
                }
            })
            .await?;
        Ok(self.draft(generated, retrieval))
    }

    async fn classify(&self, views: &[DocumentView]) -> Result<Draft, SessionError> {
        if views.is_empty() {
            return Ok(Draft::without_llm(agents::metadata_answer(views), Vec::new()));
        }

        let generated = self
            .generate(|budget| Prompt {
                text: agents::classify_prompt(views, budget),
                sources: views.iter().map(DocumentView::source).collect(),
                grounded: true,
            })
            .await?;
        let classifications = agents::parse_classifications(&generated.text, views);
        let mut draft = self.draft(generated, Duration::ZERO);
        draft.answer = classifications
            .iter()
            .map(|item| format!("{}: {}", item.filename, item.category))
            .collect::<Vec<_>>()
            .join("\n");
        draft.classifications = classifications;
        Ok(draft)
    }

    fn draft(&self, generated: Generated, retrieval: Duration) -> Draft {
        Draft {
            answer: generated.text,
            sources: generated.prompt.sources,
            grounded: generated.prompt.grounded,
            provider: Some(self.gateway.provider_name().to_string()),
            attempts: generated.attempts,
            retrieval,
            generation: generated.elapsed,
            classifications: Vec::new(),
        }
    }

    /// One attempt at the full budget; a retryable failure gets one more
    /// attempt with half the context and half the generation parameters.
    async fn generate<F>(&self, build: F) -> Result<Generated, GenerationError>
    where
        F: Fn(usize) -> Prompt,
    {
        self.gateway.ensure_available().await?;
        let budget = self.assembler.char_budget();
        let params = self.gateway.default_params();
        let started = Instant::now();

        let first = build(budget);
        match self.gateway.generate(&first.text, &params).await {
            Ok(text) => Ok(Generated {
                text,
                prompt: first,
                attempts: 1,
                elapsed: started.elapsed(),
            }),
            Err(error) if error.is_retryable() => {
                warn!(
                    provider = self.gateway.provider_name(),
                    %error,
                    "generation failed, retrying with reduced context"
                );
                let second = build(budget / 2);
                let text = self.gateway.generate(&second.text, &params.reduced()).await?;
                Ok(Generated {
                    text,
                    prompt: second,
                    attempts: 2,
                    elapsed: started.elapsed(),
                })
            }
            Err(error) => Err(error),
        }
    }

    pub async fn documents(&self, session_id: &str) -> Result<Vec<DocumentSummary>, SessionError> {
        let session = self.session(session_id).await?;
        let workspace = session.lock().await;
        let views = document_views(&workspace, session.index(), &[]).await;
        Ok(views
            .into_iter()
            .map(|view| DocumentSummary {
                text_chars: view.text.chars().count(),
                document_id: view.document_id,
                filename: view.filename,
                title: view.title,
                author: view.author,
                page_count: view.page_count,
                chunk_count: view.chunk_count,
            })
            .collect())
    }

    pub async fn history(&self, session_id: &str) -> Result<Vec<HistoryEntry>, SessionError> {
        let session = self.session(session_id).await?;
        let workspace = session.lock().await;
        Ok(workspace.history.clone())
    }

    /// Removes the session and deletes its persisted collection. A cleared
    /// session cannot be used again.
    pub async fn clear(&self, session_id: &str) -> Result<(), SessionError> {
        let session = self.session(session_id).await?;
        let _workspace = session.lock().await;
        session.mark_cleared();
        self.sessions.write().await.remove(session_id);
        self.registry.drop_collection(session_id).await?;
        info!(session = session_id, "session cleared");
        Ok(())
    }

    pub async fn session_stats(&self, session_id: &str) -> Result<IndexStats, SessionError> {
        let session = self.session(session_id).await?;
        Ok(session.index().stats().await)
    }

    pub async fn status(&self) -> HealthReport {
        let providers = self.gateway.statuses().await;
        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        let mut collections = Vec::with_capacity(sessions.len());
        for session in sessions {
            collections.push(session.index().stats().await);
        }
        collections.sort_by(|left, right| left.collection.cmp(&right.collection));

        HealthReport {
            active_provider: self.gateway.provider_name().to_string(),
            providers,
            collections,
        }
    }
}

async fn insert_with_retry(
    index: &EmbeddingIndex,
    chunk: &Chunk,
    vector: Vec<f32>,
    extra: &Map<String, Value>,
) -> Result<(), IndexError> {
    match index.add(chunk, vector.clone(), extra).await {
        Ok(()) => Ok(()),
        Err(error) => {
            warn!(chunk_id = %chunk.chunk_id, %error, "index write failed, retrying once");
            index.add(chunk, vector, extra).await
        }
    }
}

/// Document-level fields copied onto every chunk record, coerced to scalars.
fn document_metadata(document: &Document) -> Map<String, Value> {
    let raw = json!({
        "title": document.info.title,
        "author": document.info.author,
        "page_count": document.page_count,
        "byte_size": document.byte_size,
        "warnings": document.warnings,
    });
    match raw {
        Value::Object(map) => Metadata::coerce(&map).to_json_map(),
        _ => Map::new(),
    }
}

/// Views of the selected documents (all when `selected` is empty), taken from
/// memory when this process parsed them and rebuilt from stored chunks
/// otherwise.
async fn document_views(
    workspace: &Workspace,
    index: &EmbeddingIndex,
    selected: &[String],
) -> Vec<DocumentView> {
    let mut views = Vec::new();
    for indexed in index.documents().await {
        let wanted = selected.is_empty()
            || selected.iter().any(|item| {
                item == &indexed.document_id || item.eq_ignore_ascii_case(&indexed.filename)
            });
        if !wanted {
            continue;
        }

        let view = match workspace.documents.get(&indexed.document_id) {
            Some(document) => DocumentView {
                document_id: document.document_id.clone(),
                filename: document.filename.clone(),
                title: document.info.title.clone(),
                author: document.info.author.clone(),
                page_count: document.page_count,
                chunk_count: indexed.chunk_count,
                text: document.text.clone(),
            },
            None => rebuild_view(&indexed, &index.chunks_for(&indexed.document_id).await),
        };
        views.push(view);
    }
    views.sort_by(|left, right| left.filename.cmp(&right.filename));
    views
}

/// Stitches chunk texts back together, dropping the overlapping prefix of
/// each chunk.
fn rebuild_view(indexed: &IndexedDocument, records: &[EmbeddingRecord]) -> DocumentView {
    let mut text = String::new();
    let mut covered = 0usize;
    for record in records {
        let start = record.char_start();
        let chars: Vec<char> = record.text.chars().collect();
        let skip = covered.saturating_sub(start).min(chars.len());
        if !text.is_empty() && start > covered {
            text.push(' ');
        }
        text.extend(&chars[skip..]);
        covered = covered.max(start + chars.len());
    }

    let first = records.first().map(|record| &record.metadata);
    let field = |key: &str| first.and_then(|metadata| metadata.get_str(key)).map(str::to_string);
    DocumentView {
        document_id: indexed.document_id.clone(),
        filename: indexed.filename.clone(),
        title: field("title").unwrap_or_else(|| indexed.filename.clone()),
        author: field("author").unwrap_or_else(|| "Unknown".to_string()),
        page_count: first
            .and_then(|metadata| metadata.get_i64("page_count"))
            .and_then(|pages| u32::try_from(pages).ok())
            .unwrap_or_default(),
        chunk_count: indexed.chunk_count,
        text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::NO_CONTEXT_MARKER;
    use crate::error::UserGuidance;
    use crate::extractor::fixtures::pdf_with_pages;
    use crate::traits::{GenerationParams, LlmProvider};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use crate::chunking::ChunkingConfig;
    use std::sync::Mutex;
    use tempfile::tempdir;
    use tokio::sync::{Notify, Semaphore};

    type Calls = Arc<Mutex<Vec<(String, GenerationParams)>>>;

    struct ScriptedProvider {
        reply: String,
        calls: Calls,
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn generate(
            &self,
            prompt: &str,
            params: &GenerationParams,
        ) -> Result<String, GenerationError> {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push((prompt.to_string(), *params));
            }
            Ok(self.reply.clone())
        }

        async fn status(&self) -> ProviderStatus {
            ProviderStatus::Available
        }
    }

    struct FlakyProvider {
        failures_left: AtomicUsize,
        calls: Calls,
    }

    #[async_trait]
    impl LlmProvider for FlakyProvider {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn generate(
            &self,
            prompt: &str,
            params: &GenerationParams,
        ) -> Result<String, GenerationError> {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push((prompt.to_string(), *params));
            }
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(GenerationError::InvalidResponse {
                    provider: "flaky".to_string(),
                    details: "truncated json".to_string(),
                });
            }
            Ok("recovered".to_string())
        }

        async fn status(&self) -> ProviderStatus {
            ProviderStatus::Available
        }
    }

    struct HangingProvider;

    #[async_trait]
    impl LlmProvider for HangingProvider {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn generate(
            &self,
            _prompt: &str,
            _params: &GenerationParams,
        ) -> Result<String, GenerationError> {
            std::future::pending().await
        }

        async fn status(&self) -> ProviderStatus {
            ProviderStatus::Available
        }
    }

    struct OfflineProvider {
        calls: Calls,
    }

    #[async_trait]
    impl LlmProvider for OfflineProvider {
        fn name(&self) -> &str {
            "offline"
        }

        async fn generate(
            &self,
            prompt: &str,
            params: &GenerationParams,
        ) -> Result<String, GenerationError> {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push((prompt.to_string(), *params));
            }
            Ok("should not be called".to_string())
        }

        async fn status(&self) -> ProviderStatus {
            ProviderStatus::Unavailable("connection refused".to_string())
        }
    }

    /// Holds prompts containing `[hold]` until the gate gets a permit.
    struct GatedProvider {
        entered: Arc<Notify>,
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl LlmProvider for GatedProvider {
        fn name(&self) -> &str {
            "gated"
        }

        async fn generate(
            &self,
            prompt: &str,
            _params: &GenerationParams,
        ) -> Result<String, GenerationError> {
            if prompt.contains("[hold]") {
                self.entered.notify_one();
                let _permit = self.gate.acquire().await.map_err(|_| GenerationError::ProviderUnavailable {
                    provider: "gated".to_string(),
                    reason: "gate closed".to_string(),
                })?;
            }
            Ok("released".to_string())
        }

        async fn status(&self) -> ProviderStatus {
            ProviderStatus::Available
        }
    }

    /// Vectors for chunks mentioning "Beta" have one extra dimension, so they
    /// cannot be stored next to the others.
    struct SplitDimensionEmbedder;

    impl Embedder for SplitDimensionEmbedder {
        fn dimensions(&self) -> usize {
            2
        }

        fn embed(&self, text: &str) -> Vec<f32> {
            if text.contains("Beta") {
                vec![1.0, 0.0, 0.0]
            } else {
                vec![1.0, 0.0]
            }
        }
    }

    fn copilot_with(dir: &Path, provider: Box<dyn LlmProvider>, config: CopilotConfig) -> Result<Copilot, ConfigError> {
        let gateway = LlmGateway::new(provider, &config.llm);
        Copilot::new(config, Arc::new(IndexRegistry::new(dir)), gateway)
    }

    fn scripted(dir: &Path, reply: &str) -> Result<(Copilot, Calls), ConfigError> {
        let calls = Calls::default();
        let provider = ScriptedProvider {
            reply: reply.to_string(),
            calls: Arc::clone(&calls),
        };
        Ok((copilot_with(dir, Box::new(provider), CopilotConfig::default())?, calls))
    }

    fn gated(dir: &Path) -> Result<(Copilot, Arc<Notify>, Arc<Semaphore>), ConfigError> {
        let entered = Arc::new(Notify::new());
        let gate = Arc::new(Semaphore::new(0));
        let provider = GatedProvider {
            entered: Arc::clone(&entered),
            gate: Arc::clone(&gate),
        };
        let copilot = copilot_with(dir, Box::new(provider), CopilotConfig::default())?;
        Ok((copilot, entered, gate))
    }

    fn prompts(calls: &Calls) -> Vec<String> {
        calls
            .lock()
            .map(|calls| calls.iter().map(|(prompt, _)| prompt.clone()).collect())
            .unwrap_or_default()
    }

    fn numbered_pdf(number: usize) -> Upload {
        let line = format!("Document number {number} talks about topic{number}.");
        Upload::new(format!("doc{number}.pdf"), pdf_with_pages(&[&[line.as_str()]], None))
    }

    fn manual_pdf() -> Upload {
        Upload::new(
            "manual.pdf",
            pdf_with_pages(
                &[
                    &["Alpha section describes pump maintenance."],
                    &["Beta section lists pressure limits for software systems."],
                ],
                Some("Pump Manual"),
            ),
        )
    }

    #[tokio::test]
    async fn query_without_documents_takes_no_context_path() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let (copilot, calls) = scripted(dir.path(), "I cannot answer that from your documents.")?;
        let session = copilot.create_session().await?;

        let answer = copilot
            .query(session.id(), QueryRequest::new("What is the warranty period?"))
            .await?;

        assert_eq!(answer.mode, QueryMode::Answer);
        assert!(!answer.grounded);
        assert!(answer.sources.is_empty());
        assert!(answer.answer.contains("cannot answer"));
        assert!(prompts(&calls)[0].starts_with(NO_CONTEXT_MARKER));
        assert_eq!(session.state(), SessionState::Empty);
        Ok(())
    }

    #[tokio::test]
    async fn ingested_document_grounds_the_answer() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let (copilot, calls) = scripted(dir.path(), "It lists pressure limits.")?;
        let session = copilot.create_session().await?;

        let report = copilot.ingest(session.id(), vec![manual_pdf()]).await?;
        assert_eq!(report.ingested(), 1);
        assert_eq!(session.state(), SessionState::Ready);

        let answer = copilot
            .query(session.id(), QueryRequest::new("What does the Beta section list?"))
            .await?;
        assert!(answer.grounded);
        assert_eq!(answer.attempts, 1);
        assert_eq!(answer.provider.as_deref(), Some("scripted"));
        assert_eq!(answer.sources[0].filename, "manual.pdf");
        let prompt = &prompts(&calls)[0];
        assert!(prompt.contains("[Source: manual.pdf, page 1]"));
        assert!(prompt.contains("Beta section"));
        assert_eq!(copilot.history(session.id()).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn sixth_document_is_refused_and_first_five_stay_queryable() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let (copilot, calls) = scripted(dir.path(), "Topic three.")?;
        let session = copilot.create_session().await?;

        let first_five = (1..=5).map(numbered_pdf).collect();
        assert_eq!(copilot.ingest(session.id(), first_five).await?.ingested(), 5);

        let sixth = copilot.ingest(session.id(), vec![numbered_pdf(6)]).await;
        assert!(matches!(
            sixth,
            Err(SessionError::Ingest(IngestError::LimitExceeded { limit: 5 }))
        ));
        assert_eq!(session.state(), SessionState::Ready);

        let again = copilot.ingest(session.id(), vec![numbered_pdf(1)]).await?;
        assert_eq!(again.ingested(), 1, "re-uploading a known document is not a new document");
        assert_eq!(copilot.documents(session.id()).await?.len(), 5);

        let answer = copilot
            .query(session.id(), QueryRequest::new("What does document number 3 talk about?"))
            .await?;
        assert!(answer.grounded);
        assert!(prompts(&calls)[0].contains("topic3"));
        Ok(())
    }

    #[tokio::test]
    async fn partial_batch_reports_each_file() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let (copilot, _) = scripted(dir.path(), "ok")?;
        let session = copilot.create_session().await?;

        let uploads = vec![
            manual_pdf(),
            Upload::new("notes.pdf", b"plain text, not a pdf".to_vec()),
        ];
        let report = copilot.ingest(session.id(), uploads).await?;

        assert_eq!(report.ingested(), 1);
        assert_eq!(report.failed(), 1);
        assert!(matches!(&report.files[1].status, FileStatus::Failed { reason } if reason.contains("not a PDF")));
        Ok(())
    }

    #[tokio::test]
    async fn failed_document_leaves_no_records() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let mut config = CopilotConfig::default();
        config.chunking = ChunkingConfig {
            max_chars: 60,
            overlap_chars: 10,
        };
        let provider = ScriptedProvider {
            reply: "unused".to_string(),
            calls: Calls::default(),
        };
        let copilot = copilot_with(dir.path(), Box::new(provider), config)?
            .with_embedder(Arc::new(SplitDimensionEmbedder));
        let session = copilot.create_session().await?;

        let result = copilot.ingest(session.id(), vec![manual_pdf()]).await;

        match result {
            Err(SessionError::NothingIngested { failures }) => {
                assert_eq!(failures[0].filename, "manual.pdf");
                assert!(failures[0].reason.contains("dimension"));
            }
            other => panic!("expected NothingIngested, got {other:?}"),
        }
        assert!(session.index().is_empty().await);
        assert!(copilot.documents(session.id()).await?.is_empty());
        assert_eq!(session.state(), SessionState::Empty);

        let reopened = EmbeddingIndex::open(dir.path(), session.id()).await?;
        assert!(reopened.is_empty().await);
        Ok(())
    }

    #[tokio::test]
    async fn batch_with_no_valid_file_fails_and_keeps_state() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let (copilot, _) = scripted(dir.path(), "ok")?;
        let session = copilot.create_session().await?;

        let result = copilot
            .ingest(session.id(), vec![Upload::new("empty.pdf", Vec::new())])
            .await;
        match result {
            Err(SessionError::NothingIngested { failures }) => assert_eq!(failures[0].filename, "empty.pdf"),
            other => panic!("expected NothingIngested, got {other:?}"),
        }
        assert_eq!(session.state(), SessionState::Empty);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn unresponsive_provider_surfaces_retry_guidance() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let mut config = CopilotConfig::default();
        config.llm.request_timeout = Duration::from_secs(1);
        let copilot = copilot_with(dir.path(), Box::new(HangingProvider), config)?;
        let session = copilot.create_session().await?;

        let error = match copilot.query(session.id(), QueryRequest::new("Anything there?")).await {
            Err(error) => error,
            Ok(answer) => panic!("expected a timeout, got {answer:?}"),
        };

        assert!(matches!(error, SessionError::Generation(GenerationError::Timeout { .. })));
        assert_eq!(error.guidance(), UserGuidance::RetryLater);
        assert_eq!(session.state(), SessionState::Empty, "session must not stay in Querying");
        Ok(())
    }

    #[tokio::test]
    async fn retry_uses_reduced_parameters() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let calls = Calls::default();
        let provider = FlakyProvider {
            failures_left: AtomicUsize::new(1),
            calls: Arc::clone(&calls),
        };
        let copilot = copilot_with(dir.path(), Box::new(provider), CopilotConfig::default())?;
        let session = copilot.create_session().await?;

        let answer = copilot.query(session.id(), QueryRequest::new("Hello?")).await?;

        assert_eq!(answer.answer, "recovered");
        assert_eq!(answer.attempts, 2);
        let recorded = calls.lock().map(|calls| calls.clone()).unwrap_or_default();
        assert_eq!(recorded[0].1.max_output_tokens, 256);
        assert_eq!(recorded[1].1.max_output_tokens, 128);
        assert_eq!(recorded[1].1.context_tokens, 512);
        Ok(())
    }

    #[tokio::test]
    async fn unavailable_provider_fails_fast() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let calls = Calls::default();
        let provider = OfflineProvider { calls: Arc::clone(&calls) };
        let copilot = copilot_with(dir.path(), Box::new(provider), CopilotConfig::default())?;
        let session = copilot.create_session().await?;

        let result = copilot.query(session.id(), QueryRequest::new("Hello?")).await;
        assert!(matches!(
            result,
            Err(SessionError::Generation(GenerationError::ProviderUnavailable { .. }))
        ));
        assert!(prompts(&calls).is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn metadata_and_compare_modes_answer_without_llm() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let (copilot, calls) = scripted(dir.path(), "unused")?;
        let session = copilot.create_session().await?;
        copilot.ingest(session.id(), vec![manual_pdf()]).await?;

        let metadata = copilot
            .query(session.id(), QueryRequest::new("Who is the author?"))
            .await?;
        assert_eq!(metadata.mode, QueryMode::Metadata);
        assert!(metadata.answer.contains("author Ada"));
        assert!(metadata.answer.contains("Pump Manual"));

        let compare = copilot
            .query(session.id(), QueryRequest::new("compare the pressure limits"))
            .await?;
        assert_eq!(compare.mode, QueryMode::Compare);
        assert!(compare.answer.contains("at least two documents"));
        assert!(compare.provider.is_none());
        assert!(prompts(&calls).is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn compare_and_classify_cover_every_document() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let (copilot, calls) = scripted(dir.path(), "manual.pdf: Technical")?;
        let session = copilot.create_session().await?;
        copilot
            .ingest(session.id(), vec![manual_pdf(), numbered_pdf(2)])
            .await?;

        let compare = copilot
            .query(
                session.id(),
                QueryRequest::new("pressure limits").with_mode(QueryMode::Compare),
            )
            .await?;
        assert!(compare.grounded);
        let compare_prompt = &prompts(&calls)[0];
        assert!(compare_prompt.contains("### Document: doc2.pdf"));
        assert!(compare_prompt.contains("### Document: manual.pdf"));

        let classify = copilot
            .query(session.id(), QueryRequest::new("classify these documents"))
            .await?;
        assert_eq!(classify.mode, QueryMode::Classify);
        assert_eq!(classify.classifications.len(), 2);
        let manual = classify
            .classifications
            .iter()
            .find(|item| item.filename == "manual.pdf")
            .map(|item| item.category.as_str());
        assert_eq!(manual, Some("Technical"));
        Ok(())
    }

    #[tokio::test]
    async fn summaries_survive_a_restart() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let session_id = {
            let (copilot, _) = scripted(dir.path(), "unused")?;
            let session = copilot.create_session().await?;
            copilot.ingest(session.id(), vec![manual_pdf()]).await?;
            session.id().to_string()
        };

        let (restarted, calls) = scripted(dir.path(), "A pump manual.")?;
        let session = restarted.open_session(&session_id).await?;
        assert_eq!(session.state(), SessionState::Ready);

        let summary = restarted
            .query(&session_id, QueryRequest::new("Give me a summary"))
            .await?;
        assert_eq!(summary.mode, QueryMode::Summarize);
        assert!(summary.answer.starts_with("## manual.pdf\nA pump manual."));
        let prompt = &prompts(&calls)[0];
        assert!(prompt.contains("Alpha section"));
        assert!(prompt.contains("Pump Manual"));

        let documents = restarted.documents(&session_id).await?;
        assert_eq!(documents[0].author, "Ada");
        assert_eq!(documents[0].page_count, 2);
        Ok(())
    }

    #[tokio::test]
    async fn cleared_session_is_gone() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let (copilot, _) = scripted(dir.path(), "ok")?;
        let session = copilot.create_session().await?;
        copilot.ingest(session.id(), vec![manual_pdf()]).await?;

        copilot.clear(session.id()).await?;

        assert_eq!(session.state(), SessionState::Cleared);
        assert!(matches!(copilot.session(session.id()).await, Err(SessionError::NotFound(_))));
        assert!(!dir.path().join(format!("{}.jsonl", session.id())).exists());
        assert!(copilot.status().await.collections.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn one_session_runs_one_query_at_a_time() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let (copilot, entered, gate) = gated(dir.path())?;
        let session = copilot.create_session().await?;
        copilot.ingest(session.id(), vec![manual_pdf()]).await?;

        let first = copilot.query(session.id(), QueryRequest::new("[hold] first question"));
        tokio::pin!(first);
        tokio::select! {
            _ = &mut first => panic!("held query finished before the gate opened"),
            _ = entered.notified() => {}
        }
        assert_eq!(session.state(), SessionState::Querying);

        let second = copilot.query(session.id(), QueryRequest::new("second question"));
        tokio::pin!(second);
        let waited = tokio::time::timeout(Duration::from_millis(50), &mut second).await;
        assert!(waited.is_err(), "second query must wait for the first");

        gate.add_permits(1);
        let (first, second) = tokio::join!(first, second);
        assert_eq!(first?.answer, "released");
        assert_eq!(second?.answer, "released");

        let history = copilot.history(session.id()).await?;
        assert_eq!(history.len(), 2);
        assert!(history[0].question.contains("first"));
        assert_eq!(session.state(), SessionState::Ready);
        Ok(())
    }

    #[tokio::test]
    async fn other_sessions_are_not_blocked() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let (copilot, entered, gate) = gated(dir.path())?;
        let busy = copilot.create_session().await?;
        let other = copilot.create_session().await?;

        let held = copilot.query(busy.id(), QueryRequest::new("[hold] slow question"));
        tokio::pin!(held);
        tokio::select! {
            _ = &mut held => panic!("held query finished before the gate opened"),
            _ = entered.notified() => {}
        }

        let quick = tokio::time::timeout(
            Duration::from_secs(5),
            copilot.query(other.id(), QueryRequest::new("quick question")),
        )
        .await??;
        assert_eq!(quick.answer, "released");
        assert_eq!(busy.state(), SessionState::Querying);

        gate.add_permits(1);
        assert_eq!(held.await?.answer, "released");
        assert_eq!(busy.state(), SessionState::Empty);
        Ok(())
    }

    #[tokio::test]
    async fn dropped_query_returns_session_to_ready() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let (copilot, entered, gate) = gated(dir.path())?;
        let session = copilot.create_session().await?;
        copilot.ingest(session.id(), vec![manual_pdf()]).await?;

        {
            let abandoned = copilot.query(session.id(), QueryRequest::new("[hold] abandoned question"));
            tokio::pin!(abandoned);
            tokio::select! {
                _ = &mut abandoned => panic!("held query finished before the gate opened"),
                _ = entered.notified() => {}
            }
            assert_eq!(session.state(), SessionState::Querying);
        }
        assert_eq!(session.state(), SessionState::Ready);

        gate.add_permits(1);
        let next = tokio::time::timeout(
            Duration::from_secs(5),
            copilot.query(session.id(), QueryRequest::new("[hold] follow-up question")),
        )
        .await??;
        assert_eq!(next.answer, "released");
        assert_eq!(copilot.history(session.id()).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn blank_question_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let (copilot, _) = scripted(dir.path(), "ok")?;
        let session = copilot.create_session().await?;
        let result = copilot.query(session.id(), QueryRequest::new("   ")).await;
        assert!(matches!(result, Err(SessionError::EmptyQuestion)));
        Ok(())
    }

    #[tokio::test]
    async fn status_reports_provider_and_collections() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let (copilot, _) = scripted(dir.path(), "ok")?;
        let session = copilot.create_session().await?;
        copilot.ingest(session.id(), vec![manual_pdf()]).await?;

        let report = copilot.status().await;
        assert_eq!(report.active_provider, "scripted");
        assert_eq!(report.providers.len(), 1);
        assert!(report.providers[0].1.is_available());
        assert_eq!(report.collections[0].document_count, 1);
        assert!(report.collections[0].chunk_count >= 1);
        Ok(())
    }
}
