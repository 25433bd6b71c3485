use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use pdf_copilot_core::{
    discover_pdf_files, ChunkingConfig, Copilot, CopilotConfig, DocumentLimits, FileStatus,
    LlmConfig, OllamaSettings, OpenAiSettings, ProviderKind, QueryAnswer, QueryMode, QueryRequest,
    RetrievalConfig, SessionError, Upload, DEFAULT_EMBEDDING_DIMENSIONS,
};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "pdf-copilot", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Session to work in; its index survives restarts.
    #[arg(long, env = "SESSION_ID", default_value = "default")]
    session: String,

    /// LLM provider: ollama or openai
    #[arg(long, env = "LLM_PROVIDER", default_value = "ollama")]
    provider: ProviderKind,

    /// OpenAI API key
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    openai_api_key: Option<String>,

    /// OpenAI model
    #[arg(long, env = "OPENAI_MODEL", default_value = "gpt-3.5-turbo")]
    openai_model: String,

    /// OpenAI base URL
    #[arg(long, env = "OPENAI_BASE_URL", default_value = "https://api.openai.com/v1")]
    openai_base_url: String,

    /// Ollama base URL
    #[arg(long, env = "OLLAMA_BASE_URL", default_value = "http://localhost:11434")]
    ollama_base_url: String,

    /// Ollama model
    #[arg(long, env = "OLLAMA_MODEL", default_value = "llama3.2")]
    ollama_model: String,

    /// Directory holding the persisted session indexes
    #[arg(long, env = "INDEX_DIR", default_value = "data/index")]
    index_dir: PathBuf,

    /// Maximum documents per session
    #[arg(long, env = "MAX_PDF_FILES", default_value = "5")]
    max_pdf_files: usize,

    /// Maximum size of one PDF, in megabytes
    #[arg(long, env = "MAX_FILE_SIZE_MB", default_value = "50")]
    max_file_size_mb: u64,

    /// Maximum characters per chunk
    #[arg(long, env = "CHUNK_SIZE", default_value = "1000")]
    chunk_size: usize,

    /// Characters shared by consecutive chunks
    #[arg(long, env = "CHUNK_OVERLAP", default_value = "200")]
    chunk_overlap: usize,

    /// Number of chunks retrieved per question
    #[arg(long, env = "TOP_K", default_value = "5")]
    top_k: usize,

    /// Minimum relevance (0 to 1, inclusive) for a chunk to be used
    #[arg(long, env = "RELEVANCE_THRESHOLD", default_value = "0.1")]
    relevance_threshold: f32,

    /// Maximum characters of retrieved text in one prompt
    #[arg(long, env = "CONTEXT_CHAR_BUDGET", default_value = "3000")]
    context_char_budget: usize,

    /// Seconds to wait for the language model
    #[arg(long, env = "LLM_TIMEOUT_SECS", default_value = "90")]
    llm_timeout_secs: u64,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest PDF files into the session.
    Ingest {
        /// PDF file to ingest; repeatable.
        #[arg(long)]
        file: Vec<PathBuf>,
        /// Folder searched recursively for PDFs.
        #[arg(long)]
        folder: Option<PathBuf>,
    },
    /// Ask one question about the session's documents.
    Ask {
        question: String,
        /// answer, summarize, compare, classify or metadata; detected when omitted.
        #[arg(long)]
        mode: Option<QueryMode>,
        /// Restrict summarize/compare/classify to these files or document ids.
        #[arg(long)]
        document: Vec<String>,
    },
    /// Interactive question loop; `exit` or end of input stops it.
    Chat,
    /// List the session's documents.
    Documents,
    /// Provider availability and index statistics.
    Status,
    /// Delete the session and its index.
    Clear,
}

impl Cli {
    fn config(&self) -> CopilotConfig {
        CopilotConfig {
            limits: DocumentLimits {
                max_documents: self.max_pdf_files,
                max_file_bytes: self.max_file_size_mb * 1024 * 1024,
            },
            chunking: ChunkingConfig {
                max_chars: self.chunk_size,
                overlap_chars: self.chunk_overlap,
            },
            retrieval: RetrievalConfig {
                top_k: self.top_k,
                relevance_threshold: self.relevance_threshold,
                context_char_budget: self.context_char_budget,
                embedding_dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
            },
            llm: LlmConfig {
                provider: self.provider,
                request_timeout: Duration::from_secs(self.llm_timeout_secs),
                openai: OpenAiSettings {
                    api_key: self.openai_api_key.clone(),
                    model: self.openai_model.clone(),
                    base_url: self.openai_base_url.clone(),
                },
                ollama: OllamaSettings {
                    base_url: self.ollama_base_url.clone(),
                    model: self.ollama_model.clone(),
                },
                ..LlmConfig::default()
            },
            index_dir: self.index_dir.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = cli.config();
    let copilot = Copilot::from_config(config).context("invalid configuration")?;
    info!(
        version = app_version,
        provider = cli.provider.as_str(),
        session = %cli.session,
        started_at = %Utc::now().to_rfc3339(),
        "pdf-copilot boot"
    );

    let session = copilot.open_session(&cli.session).await?;

    match cli.command {
        Command::Ingest { file, folder } => {
            let mut paths = file;
            if let Some(folder) = folder {
                let found = discover_pdf_files(&folder);
                info!(folder = %folder.display(), pdf_count = found.len(), "scanned folder");
                paths.extend(found);
            }
            if paths.is_empty() {
                anyhow::bail!("nothing to ingest: pass --file or --folder");
            }

            let mut uploads = Vec::with_capacity(paths.len());
            for path in &paths {
                match Upload::from_path(path) {
                    Ok(upload) => uploads.push(upload),
                    Err(error) => warn!(path = %path.display(), %error, "unreadable file skipped"),
                }
            }

            let report = match copilot.ingest(session.id(), uploads).await {
                Ok(report) => report,
                Err(error) => anyhow::bail!(error.user_message()),
            };
            for outcome in &report.files {
                match &outcome.status {
                    FileStatus::Ingested {
                        pages,
                        chunks,
                        warnings,
                        ..
                    } => {
                        println!("ok      {} ({pages} pages, {chunks} chunks)", outcome.filename);
                        for warning in warnings {
                            println!("        warning: {warning}");
                        }
                    }
                    FileStatus::Failed { reason } => {
                        println!("failed  {}: {reason}", outcome.filename);
                    }
                }
            }
            println!(
                "{} of {} file(s) ingested at {}",
                report.ingested(),
                report.files.len(),
                Utc::now().to_rfc3339()
            );
        }
        Command::Ask {
            question,
            mode,
            document,
        } => {
            let request = QueryRequest {
                question,
                mode,
                documents: document,
            };
            match copilot.query(session.id(), request).await {
                Ok(answer) => print_answer(&answer),
                Err(error) => anyhow::bail!(error.user_message()),
            }
        }
        Command::Chat => {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            let mut stdout = tokio::io::stdout();
            loop {
                stdout.write_all(b"> ").await?;
                stdout.flush().await?;
                let Some(line) = lines.next_line().await? else {
                    break;
                };
                let question = line.trim();
                if question.is_empty() {
                    continue;
                }
                if matches!(question, "exit" | "quit") {
                    break;
                }
                match copilot.query(session.id(), QueryRequest::new(question)).await {
                    Ok(answer) => print_answer(&answer),
                    Err(SessionError::EmptyQuestion) => continue,
                    Err(error) => eprintln!("{}", error.user_message()),
                }
            }
        }
        Command::Documents => {
            let documents = copilot.documents(session.id()).await?;
            if documents.is_empty() {
                println!("no documents in session {}", session.id());
            }
            for document in documents {
                println!(
                    "{}  {}  \"{}\" by {}  pages={} chunks={} chars={}",
                    &document.document_id[..12.min(document.document_id.len())],
                    document.filename,
                    document.title,
                    document.author,
                    document.page_count,
                    document.chunk_count,
                    document.text_chars
                );
            }
        }
        Command::Status => {
            let report = copilot.status().await;
            for (name, status) in &report.providers {
                let marker = if *name == report.active_provider { " [active]" } else { "" };
                println!("provider: {name}{marker} ({status})");
            }
            for stats in report.collections {
                println!(
                    "session: {} documents={} chunks={} dimensions={}",
                    stats.collection,
                    stats.document_count,
                    stats.chunk_count,
                    stats
                        .dimensions
                        .map_or_else(|| "-".to_string(), |dimensions| dimensions.to_string())
                );
            }
        }
        Command::Clear => {
            copilot.clear(session.id()).await?;
            println!("session {} cleared", session.id());
        }
    }

    Ok(())
}

fn print_answer(answer: &QueryAnswer) {
    println!("{}", answer.answer);
    if !answer.sources.is_empty() {
        println!();
        println!("sources:");
        for source in &answer.sources {
            println!("  - {source}");
        }
    }
    for classification in &answer.classifications {
        info!(filename = %classification.filename, category = %classification.category, "classified");
    }
    println!(
        "[mode={} grounded={} attempts={} retrieval={}ms generation={}ms total={}ms]",
        answer.mode.as_str(),
        answer.grounded,
        answer.attempts,
        answer.timing.retrieval.as_millis(),
        answer.timing.generation.as_millis(),
        answer.timing.total.as_millis()
    );
}
