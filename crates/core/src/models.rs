use crate::metadata::Metadata;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Character range of one page inside [`Document::text`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageSpan {
    pub number: u32,
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DocumentInfo {
    pub title: String,
    pub author: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub document_id: String,
    pub filename: String,
    pub byte_size: u64,
    pub page_count: u32,
    pub text: String,
    pub pages: Vec<PageSpan>,
    pub info: DocumentInfo,
    pub checksum: String,
    pub ingested_at: DateTime<Utc>,
    /// Pages that could not be read, kept for the upload report.
    pub warnings: Vec<String>,
}

impl Document {
    /// Page number containing the given character offset of `text`.
    pub fn page_at(&self, char_offset: usize) -> Option<u32> {
        self.pages
            .iter()
            .find(|span| char_offset >= span.start && char_offset < span.end)
            .or_else(|| self.pages.last().filter(|span| char_offset >= span.end))
            .map(|span| span.number)
    }

    pub fn char_len(&self) -> usize {
        self.pages.last().map_or(0, |span| span.end)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub chunk_id: String,
    pub document_id: String,
    pub filename: String,
    pub chunk_index: u64,
    pub page_start: u32,
    pub page_end: u32,
    /// Character offset of the chunk inside the document text.
    pub char_start: usize,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub chunk_id: String,
    /// Normalized relevance in `[0, 1]`, higher is better.
    pub score: f32,
    pub text: String,
    pub metadata: Metadata,
}

impl SearchResult {
    pub fn document_id(&self) -> Option<&str> {
        self.metadata.get_str("document_id")
    }

    pub fn filename(&self) -> Option<&str> {
        self.metadata.get_str("source_file")
    }

    pub fn page(&self) -> Option<u32> {
        self.metadata
            .get_i64("page_start")
            .and_then(|page| u32::try_from(page).ok())
    }

    /// Last page the chunk touches, when stored.
    pub fn page_end(&self) -> Option<u32> {
        self.metadata
            .get_i64("page_end")
            .and_then(|page| u32::try_from(page).ok())
    }

    pub fn source(&self) -> SourceRef {
        SourceRef {
            document_id: self.document_id().unwrap_or_default().to_string(),
            filename: self.filename().unwrap_or("unknown").to_string(),
            page: self.page(),
            page_end: self.page_end(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SourceRef {
    pub document_id: String,
    pub filename: String,
    pub page: Option<u32>,
    #[serde(default)]
    pub page_end: Option<u32>,
}

impl std::fmt::Display for SourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.page, self.page_end) {
            (Some(first), Some(last)) if last > first => {
                write!(f, "{}, page {}-{}", self.filename, first, last)
            }
            (Some(page), _) => write!(f, "{}, page {}", self.filename, page),
            (None, _) => write!(f, "{}", self.filename),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum QueryMode {
    Answer,
    Summarize,
    Compare,
    Classify,
    Metadata,
}

impl QueryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Answer => "answer",
            Self::Summarize => "summarize",
            Self::Compare => "compare",
            Self::Classify => "classify",
            Self::Metadata => "metadata",
        }
    }
}

impl std::str::FromStr for QueryMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "answer" => Ok(Self::Answer),
            "summarize" | "summary" => Ok(Self::Summarize),
            "compare" => Ok(Self::Compare),
            "classify" => Ok(Self::Classify),
            "metadata" => Ok(Self::Metadata),
            other => Err(format!("unknown query mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QueryRequest {
    pub question: String,
    /// Detected from the question when absent.
    pub mode: Option<QueryMode>,
    /// Document ids to restrict summarize/compare/classify to; empty means all.
    pub documents: Vec<String>,
}

impl QueryRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            ..Self::default()
        }
    }

    pub fn with_mode(mut self, mode: QueryMode) -> Self {
        self.mode = Some(mode);
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct QueryTiming {
    pub retrieval: Duration,
    pub generation: Duration,
    pub total: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Classification {
    pub filename: String,
    pub category: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryAnswer {
    pub question: String,
    pub mode: QueryMode,
    pub answer: String,
    pub sources: Vec<SourceRef>,
    /// False when no retrieved context backed the answer.
    pub grounded: bool,
    pub provider: Option<String>,
    pub attempts: u32,
    pub timing: QueryTiming,
    pub classifications: Vec<Classification>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FileStatus {
    Ingested {
        document_id: String,
        pages: u32,
        chunks: usize,
        warnings: Vec<String>,
    },
    Failed {
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileOutcome {
    pub filename: String,
    pub status: FileStatus,
}

impl FileOutcome {
    pub fn is_ingested(&self) -> bool {
        matches!(self.status, FileStatus::Ingested { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IngestionReport {
    pub files: Vec<FileOutcome>,
}

impl IngestionReport {
    pub fn ingested(&self) -> usize {
        self.files.iter().filter(|file| file.is_ingested()).count()
    }

    pub fn failed(&self) -> usize {
        self.files.len() - self.ingested()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub document_id: String,
    pub filename: String,
    pub title: String,
    pub author: String,
    pub page_count: u32,
    pub chunk_count: usize,
    pub text_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub at: DateTime<Utc>,
    pub question: String,
    pub mode: QueryMode,
    pub answer: String,
    pub sources: Vec<SourceRef>,
}
