use crate::chunking::normalize_whitespace;
use crate::config::DocumentLimits;
use crate::error::IngestError;
use crate::extractor::{LopdfExtractor, PdfExtractor};
use crate::models::{Document, PageSpan};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

const PDF_MAGIC: &[u8] = b"%PDF";

/// One uploaded file: its name and raw bytes.
#[derive(Debug, Clone)]
pub struct Upload {
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl Upload {
    pub fn new(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            bytes,
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, IngestError> {
        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| IngestError::invalid(&path.display().to_string(), "path has no file name"))?
            .to_string();
        Ok(Self {
            filename,
            bytes: fs::read(path)?,
        })
    }
}

pub fn discover_pdf_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let is_pdf = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));

        if is_pdf {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

pub fn digest_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Turns uploaded bytes into a [`Document`], enforcing the per-file and
/// per-session limits.
#[derive(Debug, Clone)]
pub struct DocumentIngestor<E = LopdfExtractor> {
    extractor: E,
    limits: DocumentLimits,
}

impl DocumentIngestor<LopdfExtractor> {
    pub fn new(limits: DocumentLimits) -> Self {
        Self {
            extractor: LopdfExtractor,
            limits,
        }
    }
}

impl<E: PdfExtractor> DocumentIngestor<E> {
    pub fn with_extractor(extractor: E, limits: DocumentLimits) -> Self {
        Self { extractor, limits }
    }

    pub fn limits(&self) -> DocumentLimits {
        self.limits
    }

    /// Fails with `LimitExceeded` when a session already holds `live` documents
    /// and one more would break the limit.
    pub fn ensure_capacity(&self, live: usize) -> Result<(), IngestError> {
        if live >= self.limits.max_documents {
            return Err(IngestError::LimitExceeded {
                limit: self.limits.max_documents,
            });
        }
        Ok(())
    }

    pub fn validate(&self, bytes: &[u8], filename: &str) -> Result<(), IngestError> {
        if bytes.is_empty() {
            return Err(IngestError::invalid(filename, "file is empty"));
        }
        if bytes.len() as u64 > self.limits.max_file_bytes {
            return Err(IngestError::invalid(
                filename,
                format!(
                    "file is {} bytes, limit is {} bytes",
                    bytes.len(),
                    self.limits.max_file_bytes
                ),
            ));
        }
        if !bytes.starts_with(PDF_MAGIC) {
            return Err(IngestError::invalid(filename, "not a PDF file"));
        }
        Ok(())
    }

    pub fn ingest(&self, bytes: &[u8], filename: &str) -> Result<Document, IngestError> {
        self.validate(bytes, filename)?;
        let extracted = self.extractor.extract(bytes, filename)?;

        let mut text = String::new();
        let mut pages = Vec::with_capacity(extracted.pages.len());
        let mut cursor = 0usize;
        for page in &extracted.pages {
            let normalized = normalize_whitespace(&page.text);
            if normalized.is_empty() {
                continue;
            }
            if !text.is_empty() {
                text.push_str("\n\n");
                cursor += 2;
            }
            let length = normalized.chars().count();
            text.push_str(&normalized);
            pages.push(PageSpan {
                number: page.number,
                start: cursor,
                end: cursor + length,
            });
            cursor += length;
        }

        if pages.is_empty() {
            return Err(IngestError::EmptyDocument(filename.to_string()));
        }

        for warning in &extracted.warnings {
            warn!(filename, warning = %warning, "page skipped during extraction");
        }

        let checksum = digest_bytes(bytes);
        let document = Document {
            document_id: checksum.clone(),
            filename: filename.to_string(),
            byte_size: bytes.len() as u64,
            page_count: extracted.page_count,
            text,
            pages,
            info: extracted.info,
            checksum,
            ingested_at: Utc::now(),
            warnings: extracted.warnings,
        };

        info!(
            filename,
            document_id = %document.document_id,
            pages = document.page_count,
            chars = cursor,
            "document extracted"
        );
        Ok(document)
    }
}
