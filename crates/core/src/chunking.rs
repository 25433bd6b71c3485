use crate::error::ConfigError;
use crate::models::{Chunk, Document};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub max_chars: usize,
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: 1_000,
            overlap_chars: 200,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_chars == 0 {
            return Err(ConfigError("chunk max_chars must be greater than zero".to_string()));
        }
        if self.overlap_chars >= self.max_chars {
            return Err(ConfigError(format!(
                "chunk overlap ({}) must be smaller than chunk size ({})",
                self.overlap_chars, self.max_chars
            )));
        }
        Ok(())
    }
}

/// Collapses runs of spaces inside lines and keeps at most one blank line
/// between paragraphs, so paragraph and line breaks survive for splitting.
pub fn normalize_whitespace(text: &str) -> String {
    let mut paragraphs = Vec::new();
    let mut current: Vec<String> = Vec::new();

    for line in text.lines() {
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            if !current.is_empty() {
                paragraphs.push(current.join("\n"));
                current.clear();
            }
        } else {
            current.push(collapsed);
        }
    }
    if !current.is_empty() {
        paragraphs.push(current.join("\n"));
    }

    paragraphs.join("\n\n")
}

/// Half-open character range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextSpan {
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Boundary {
    Paragraph,
    Line,
    Sentence,
    Word,
}

const BOUNDARIES: [Boundary; 4] = [
    Boundary::Paragraph,
    Boundary::Line,
    Boundary::Sentence,
    Boundary::Word,
];

/// Splits `chars` into spans of at most `max_chars`, each starting at most
/// `overlap_chars` before the previous one ends. Cuts land on the coarsest
/// boundary available (paragraph, line, sentence, word) before falling back
/// to a hard cut.
pub fn split_spans(chars: &[char], config: ChunkingConfig) -> Vec<TextSpan> {
    let len = chars.len();
    let mut spans = Vec::new();
    let mut start = skip_whitespace(chars, 0);

    while start < len {
        let hard_end = (start + config.max_chars).min(len);
        let end = if hard_end == len {
            len
        } else {
            find_break(chars, start, hard_end, config.overlap_chars)
        };

        if let Some(span) = trimmed(chars, start, end) {
            spans.push(span);
        }
        if end >= len {
            break;
        }
        start = skip_whitespace(chars, next_start(chars, start, end, config.overlap_chars));
    }

    spans
}

fn find_break(chars: &[char], start: usize, hard_end: usize, overlap: usize) -> usize {
    // Cuts past `start + overlap` keep the full overlap available.
    let floor = start + overlap + 1;
    for boundary in BOUNDARIES {
        for position in (floor..=hard_end).rev() {
            if is_boundary(chars, position, boundary) {
                return position;
            }
        }
    }
    for position in (start + 1..floor.min(hard_end)).rev() {
        if is_boundary(chars, position, Boundary::Word) {
            return position;
        }
    }
    hard_end
}

fn is_boundary(chars: &[char], position: usize, boundary: Boundary) -> bool {
    if position == 0 || position >= chars.len() {
        return false;
    }
    let before = chars[position - 1];
    let at = chars[position];
    match boundary {
        Boundary::Paragraph => position >= 2 && before == '\n' && chars[position - 2] == '\n',
        Boundary::Line => before == '\n',
        Boundary::Sentence => matches!(before, '.' | '!' | '?') && at.is_whitespace(),
        Boundary::Word => at.is_whitespace() && !before.is_whitespace(),
    }
}

/// Start of the next span: the first word start inside the overlap window,
/// the cut itself when the window holds no word start, or a mid-word
/// position when the text had no boundary to cut on.
fn next_start(chars: &[char], start: usize, end: usize, overlap: usize) -> usize {
    if overlap == 0 {
        return end;
    }
    let window_start = end.saturating_sub(overlap).max(start + 1);
    let word_start = (window_start..end).find(|&position| {
        chars[position - 1].is_whitespace() && !chars[position].is_whitespace()
    });
    if let Some(position) = word_start {
        return position;
    }
    let hard_cut = !chars[end - 1].is_whitespace() && !chars[end].is_whitespace();
    if hard_cut && window_start < end {
        window_start
    } else {
        end
    }
}

fn skip_whitespace(chars: &[char], mut position: usize) -> usize {
    while position < chars.len() && chars[position].is_whitespace() {
        position += 1;
    }
    position
}

fn trimmed(chars: &[char], start: usize, end: usize) -> Option<TextSpan> {
    let start = skip_whitespace(chars, start).min(end);
    let mut end = end;
    while end > start && chars[end - 1].is_whitespace() {
        end -= 1;
    }
    (end > start).then_some(TextSpan { start, end })
}

#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    config: ChunkingConfig,
}

impl Chunker {
    pub fn new(config: ChunkingConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> ChunkingConfig {
        self.config
    }

    /// Deterministic: the same document and configuration always yield the
    /// same chunks, ids included.
    pub fn chunk(&self, document: &Document) -> Vec<Chunk> {
        let chars: Vec<char> = document.text.chars().collect();

        split_spans(&chars, self.config)
            .into_iter()
            .enumerate()
            .map(|(index, span)| {
                let text: String = chars[span.start..span.end].iter().collect();
                let chunk_index = index as u64;
                let page_start = document.page_at(span.start).unwrap_or(1);
                let page_end = document.page_at(span.end - 1).unwrap_or(page_start);
                Chunk {
                    chunk_id: make_chunk_id(&document.document_id, chunk_index, &text),
                    document_id: document.document_id.clone(),
                    filename: document.filename.clone(),
                    chunk_index,
                    page_start,
                    page_end,
                    char_start: span.start,
                    text,
                }
            })
            .collect()
    }
}

fn make_chunk_id(document_id: &str, index: u64, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update(index.to_le_bytes());
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
