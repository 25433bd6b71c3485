//! Persistent embedding index.
//!
//! Each collection lives in memory as a map from chunk id to record and on
//! disk as an append-only JSON Lines log at `<root>/<collection>.jsonl`.
//! Every insert appends and flushes exactly one line, so an interrupted batch
//! leaves the inserts that completed. A write that fails partway is cut back
//! to the last acknowledged line before the error is returned, so a retried
//! insert never lands behind torn bytes. On reopen the log is replayed (later
//! lines for a chunk id replace earlier ones, a torn trailing line is
//! skipped) and compacted when it held duplicates.
//!
//! Writes are serialized by the log writer lock. Searches only take the read
//! side of the record map and may miss an insert that is still in flight.

use crate::error::IndexError;
use crate::metadata::{Metadata, MetadataValue};
use crate::models::{Chunk, SearchResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbeddingRecord {
    pub chunk_id: String,
    pub vector: Vec<f32>,
    pub text: String,
    pub metadata: Metadata,
}

impl EmbeddingRecord {
    pub fn document_id(&self) -> Option<&str> {
        self.metadata.get_str("document_id")
    }

    pub fn chunk_index(&self) -> i64 {
        self.metadata.get_i64("chunk_index").unwrap_or_default()
    }

    pub fn char_start(&self) -> usize {
        self.metadata
            .get_i64("char_start")
            .and_then(|offset| usize::try_from(offset).ok())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexedDocument {
    pub document_id: String,
    pub filename: String,
    pub chunk_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexStats {
    pub collection: String,
    pub document_count: usize,
    pub chunk_count: usize,
    pub dimensions: Option<usize>,
}

#[derive(Debug, Default)]
struct Records {
    by_id: HashMap<String, EmbeddingRecord>,
    dimensions: Option<usize>,
}

/// Append handle plus the length of the log up to its last acknowledged line.
#[derive(Debug)]
struct LogWriter {
    file: File,
    len: u64,
}

impl LogWriter {
    async fn open(path: &Path) -> Result<Self, IndexError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        let len = file.metadata().await?.len();
        Ok(Self { file, len })
    }

    async fn append(&mut self, line: &[u8]) -> std::io::Result<()> {
        let on_disk = self.file.metadata().await?.len();
        if on_disk > self.len {
            warn!(bytes = on_disk - self.len, "cutting unacknowledged bytes from index log");
            self.file.set_len(self.len).await?;
        } else if on_disk < self.len {
            warn!(expected = self.len, on_disk, "index log shorter than expected");
            self.len = on_disk;
        }

        let written = async {
            self.file.write_all(line).await?;
            self.file.flush().await
        }
        .await;
        if let Err(error) = written {
            if let Err(truncate) = self.file.set_len(self.len).await {
                warn!(error = %truncate, "could not cut back a failed index write");
            }
            return Err(error);
        }
        self.len += line.len() as u64;
        Ok(())
    }

    async fn truncate(&mut self) -> std::io::Result<()> {
        self.file.set_len(0).await?;
        self.file.flush().await?;
        self.len = 0;
        Ok(())
    }
}

#[derive(Debug)]
pub struct EmbeddingIndex {
    collection: String,
    path: PathBuf,
    records: RwLock<Records>,
    writer: Mutex<LogWriter>,
}

impl EmbeddingIndex {
    pub async fn open(root: &Path, collection: &str) -> Result<Self, IndexError> {
        validate_collection_name(collection)?;
        fs::create_dir_all(root).await?;
        let path = root.join(format!("{collection}.jsonl"));

        let (records, needs_compaction) = replay(&path).await?;
        if needs_compaction {
            compact(&path, &records.by_id).await?;
        }

        let writer = LogWriter::open(&path).await?;

        info!(
            collection,
            chunks = records.by_id.len(),
            path = %path.display(),
            "embedding index opened"
        );

        Ok(Self {
            collection: collection.to_string(),
            path,
            records: RwLock::new(records),
            writer: Mutex::new(writer),
        })
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Inserts or replaces the record for `chunk.chunk_id`.
    ///
    /// `extra` must hold scalar values only; the chunk's own attribution
    /// fields (`document_id`, `source_file`, pages, `chunk_index`) are always
    /// written from the chunk.
    pub async fn add(
        &self,
        chunk: &Chunk,
        vector: Vec<f32>,
        extra: &Map<String, Value>,
    ) -> Result<(), IndexError> {
        let mut metadata = Metadata::from_json(extra)?;
        metadata.insert("document_id", chunk.document_id.as_str());
        metadata.insert("source_file", chunk.filename.as_str());
        metadata.insert("page_start", chunk.page_start);
        metadata.insert("page_end", chunk.page_end);
        metadata.insert("chunk_index", MetadataValue::Int(chunk.chunk_index as i64));
        metadata.insert("char_start", MetadataValue::Int(chunk.char_start as i64));

        let record = EmbeddingRecord {
            chunk_id: chunk.chunk_id.clone(),
            vector,
            text: chunk.text.clone(),
            metadata,
        };
        self.insert(record).await
    }

    async fn insert(&self, record: EmbeddingRecord) -> Result<(), IndexError> {
        let mut writer = self.writer.lock().await;

        let dimensions = self.records.read().await.dimensions;
        if let Some(expected) = dimensions {
            if record.vector.len() != expected {
                return Err(IndexError::DimensionMismatch {
                    expected,
                    actual: record.vector.len(),
                });
            }
        }

        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        writer.append(&line).await?;

        let mut records = self.records.write().await;
        records.dimensions.get_or_insert(record.vector.len());
        debug!(collection = %self.collection, chunk_id = %record.chunk_id, "record stored");
        records.by_id.insert(record.chunk_id.clone(), record);
        Ok(())
    }

    /// Highest relevance first; scores are clamped cosine similarity and only
    /// those `>= relevance_threshold` are kept.
    pub async fn search(
        &self,
        query: &[f32],
        k: usize,
        relevance_threshold: f32,
    ) -> Result<Vec<SearchResult>, IndexError> {
        self.search_where(query, k, relevance_threshold, |_| true).await
    }

    /// Same as [`search`](Self::search), restricted to one document.
    pub async fn search_document(
        &self,
        document_id: &str,
        query: &[f32],
        k: usize,
        relevance_threshold: f32,
    ) -> Result<Vec<SearchResult>, IndexError> {
        self.search_where(query, k, relevance_threshold, |record| {
            record.document_id() == Some(document_id)
        })
        .await
    }

    async fn search_where<F>(
        &self,
        query: &[f32],
        k: usize,
        relevance_threshold: f32,
        keep: F,
    ) -> Result<Vec<SearchResult>, IndexError>
    where
        F: Fn(&EmbeddingRecord) -> bool,
    {
        let records = self.records.read().await;
        if let Some(expected) = records.dimensions {
            if query.len() != expected {
                return Err(IndexError::DimensionMismatch {
                    expected,
                    actual: query.len(),
                });
            }
        }

        let mut scored: Vec<(f32, &EmbeddingRecord)> = records
            .by_id
            .values()
            .filter(|record| keep(record))
            .map(|record| (relevance(query, &record.vector), record))
            .filter(|(score, _)| *score >= relevance_threshold)
            .collect();

        scored.sort_by(|left, right| {
            right
                .0
                .total_cmp(&left.0)
                .then_with(|| left.1.chunk_id.cmp(&right.1.chunk_id))
        });
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(score, record)| SearchResult {
                chunk_id: record.chunk_id.clone(),
                score,
                text: record.text.clone(),
                metadata: record.metadata.clone(),
            })
            .collect())
    }

    pub async fn contains(&self, chunk_id: &str) -> bool {
        self.records.read().await.by_id.contains_key(chunk_id)
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.by_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn documents(&self) -> Vec<IndexedDocument> {
        let records = self.records.read().await;
        let mut documents: BTreeMap<String, IndexedDocument> = BTreeMap::new();
        for record in records.by_id.values() {
            let Some(document_id) = record.document_id() else {
                continue;
            };
            let entry = documents
                .entry(document_id.to_string())
                .or_insert_with(|| IndexedDocument {
                    document_id: document_id.to_string(),
                    filename: record
                        .metadata
                        .get_str("source_file")
                        .unwrap_or("unknown")
                        .to_string(),
                    chunk_count: 0,
                });
            entry.chunk_count += 1;
        }
        documents.into_values().collect()
    }

    /// Stored chunks of one document in chunk order.
    pub async fn chunks_for(&self, document_id: &str) -> Vec<EmbeddingRecord> {
        let records = self.records.read().await;
        let mut chunks: Vec<EmbeddingRecord> = records
            .by_id
            .values()
            .filter(|record| record.document_id() == Some(document_id))
            .cloned()
            .collect();
        chunks.sort_by_key(EmbeddingRecord::chunk_index);
        chunks
    }

    pub async fn stats(&self) -> IndexStats {
        let document_count = self.documents().await.len();
        let records = self.records.read().await;
        IndexStats {
            collection: self.collection.clone(),
            document_count,
            chunk_count: records.by_id.len(),
            dimensions: records.dimensions,
        }
    }

    /// Drops every record, in memory and on disk.
    pub async fn clear(&self) -> Result<(), IndexError> {
        let mut writer = self.writer.lock().await;
        writer.truncate().await?;
        let mut records = self.records.write().await;
        records.by_id.clear();
        records.dimensions = None;
        info!(collection = %self.collection, "embedding index cleared");
        Ok(())
    }

    /// Drops every record of `document_id` and rewrites the log without them.
    /// Returns how many records were removed.
    pub async fn remove_document(&self, document_id: &str) -> Result<usize, IndexError> {
        let mut writer = self.writer.lock().await;
        let mut records = self.records.write().await;

        let remaining: HashMap<String, EmbeddingRecord> = records
            .by_id
            .iter()
            .filter(|(_, record)| record.document_id() != Some(document_id))
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect();
        let removed = records.by_id.len() - remaining.len();
        if removed == 0 {
            return Ok(0);
        }

        compact(&self.path, &remaining).await?;
        *writer = LogWriter::open(&self.path).await?;
        records.by_id = remaining;
        if records.by_id.is_empty() {
            records.dimensions = None;
        }
        info!(collection = %self.collection, document_id, removed, "document removed from index");
        Ok(removed)
    }
}

/// Clamped cosine similarity: opposite or degenerate vectors score 0.
pub fn relevance(query: &[f32], candidate: &[f32]) -> f32 {
    if query.len() != candidate.len() {
        return 0.0;
    }
    let dot: f32 = query.iter().zip(candidate).map(|(a, b)| a * b).sum();
    let norm_query = query.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_candidate = candidate.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_query == 0.0 || norm_candidate == 0.0 {
        return 0.0;
    }
    let cosine = dot / (norm_query * norm_candidate);
    if cosine.is_finite() {
        cosine.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn validate_collection_name(name: &str) -> Result<(), IndexError> {
    let valid = !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(IndexError::InvalidCollection(name.to_string()))
    }
}

async fn replay(path: &Path) -> Result<(Records, bool), IndexError> {
    let mut records = Records::default();
    if !fs::try_exists(path).await? {
        return Ok((records, false));
    }

    let raw = fs::read_to_string(path).await?;
    let mut lines = 0usize;
    let mut skipped = 0usize;
    for line in raw.lines().filter(|line| !line.trim().is_empty()) {
        lines += 1;
        match serde_json::from_str::<EmbeddingRecord>(line) {
            Ok(record) => {
                if records.dimensions.is_none() {
                    records.dimensions = Some(record.vector.len());
                }
                if records.dimensions != Some(record.vector.len()) {
                    skipped += 1;
                    warn!(
                        path = %path.display(),
                        chunk_id = %record.chunk_id,
                        expected = records.dimensions.unwrap_or_default(),
                        actual = record.vector.len(),
                        "skipping index line with mismatched dimensions"
                    );
                    continue;
                }
                records.by_id.insert(record.chunk_id.clone(), record);
            }
            Err(error) => {
                skipped += 1;
                warn!(path = %path.display(), %error, "skipping unreadable index line");
            }
        }
    }

    let needs_compaction = skipped > 0 || lines != records.by_id.len();
    Ok((records, needs_compaction))
}

async fn compact(path: &Path, records: &HashMap<String, EmbeddingRecord>) -> Result<(), IndexError> {
    let mut ordered: Vec<&EmbeddingRecord> = records.values().collect();
    ordered.sort_by(|left, right| left.chunk_id.cmp(&right.chunk_id));

    let mut contents = Vec::new();
    for record in ordered {
        contents.extend(serde_json::to_vec(record)?);
        contents.push(b'\n');
    }

    let temporary = path.with_extension("jsonl.tmp");
    fs::write(&temporary, contents).await?;
    fs::rename(&temporary, path).await?;
    info!(path = %path.display(), chunks = records.len(), "index log compacted");
    Ok(())
}

/// Owns every open collection of this process, keyed by collection name.
#[derive(Debug)]
pub struct IndexRegistry {
    root: PathBuf,
    open: Mutex<HashMap<String, Arc<EmbeddingIndex>>>,
}

impl IndexRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            open: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn open(&self, collection: &str) -> Result<Arc<EmbeddingIndex>, IndexError> {
        let mut open = self.open.lock().await;
        if let Some(index) = open.get(collection) {
            return Ok(Arc::clone(index));
        }
        let index = Arc::new(EmbeddingIndex::open(&self.root, collection).await?);
        open.insert(collection.to_string(), Arc::clone(&index));
        Ok(index)
    }

    /// Clears the collection and removes its log file.
    pub async fn drop_collection(&self, collection: &str) -> Result<(), IndexError> {
        validate_collection_name(collection)?;
        let removed = self.open.lock().await.remove(collection);
        if let Some(index) = removed {
            index.clear().await?;
        }
        let path = self.root.join(format!("{collection}.jsonl"));
        if fs::try_exists(&path).await? {
            fs::remove_file(&path).await?;
        }
        Ok(())
    }

    pub async fn collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.open.lock().await.keys().cloned().collect();
        names.sort();
        names
    }
}
