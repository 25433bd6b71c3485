//! Prompt builders for the specialized query modes and parsing of their replies.

use crate::models::{Classification, QueryMode, SearchResult, SourceRef};
use regex::Regex;
use serde::{Deserialize, Serialize};

const SUMMARY_PATTERN: &str = r"(?i)\b(resumen|resume|resúmenes|summari[sz]e|summary)\b";
const COMPARE_PATTERN: &str = r"(?i)\b(compara|comparación|diferencias|compare|comparison|differences|vs|versus)\b";
const CLASSIFY_PATTERN: &str = r"(?i)\b(clasificar|categorías|temas|topics|classify|categori[sz]e)\b";
const METADATA_PATTERN: &str = r"(?i)\b(autor|author|fecha|páginas|metadatos|metadata)\b";

pub const UNCATEGORIZED: &str = "Uncategorized";

/// Keyword lists used as hints for classification, by category.
pub const CATEGORIES: &[(&str, &[&str])] = &[
    ("Business", &["negocio", "empresa", "comercial", "ventas", "marketing", "strategy", "business"]),
    ("Technical", &["técnico", "technology", "sistema", "software", "desarrollo", "programming", "system"]),
    ("Legal", &["legal", "ley", "contrato", "regulación", "compliance", "derecho", "contract"]),
    ("Financial", &["financiero", "dinero", "presupuesto", "costo", "investment", "budget", "revenue"]),
    ("Academic", &["académico", "investigación", "estudio", "análisis", "research", "university"]),
    ("Healthcare", &["salud", "médico", "hospital", "patient", "treatment", "medicina"]),
    ("Education", &["educación", "enseñanza", "estudiante", "curso", "learning", "school"]),
    ("Government", &["gobierno", "público", "política", "policy", "administrative", "state"]),
];

/// Picks a query mode from keywords in the question.
pub struct IntentDetector {
    summary: Regex,
    compare: Regex,
    classify: Regex,
    metadata: Regex,
}

impl IntentDetector {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            summary: Regex::new(SUMMARY_PATTERN)?,
            compare: Regex::new(COMPARE_PATTERN)?,
            classify: Regex::new(CLASSIFY_PATTERN)?,
            metadata: Regex::new(METADATA_PATTERN)?,
        })
    }

    pub fn detect(&self, question: &str) -> QueryMode {
        if self.summary.is_match(question) {
            QueryMode::Summarize
        } else if self.compare.is_match(question) {
            QueryMode::Compare
        } else if self.classify.is_match(question) {
            QueryMode::Classify
        } else if self.metadata.is_match(question) {
            QueryMode::Metadata
        } else {
            QueryMode::Answer
        }
    }
}

/// Full text and metadata of one document, as the agents see it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentView {
    pub document_id: String,
    pub filename: String,
    pub title: String,
    pub author: String,
    pub page_count: u32,
    pub chunk_count: usize,
    pub text: String,
}

impl DocumentView {
    pub fn source(&self) -> SourceRef {
        SourceRef {
            document_id: self.document_id.clone(),
            filename: self.filename.clone(),
            page: None,
            page_end: None,
        }
    }
}

/// Longest prefix of `text` within `max_chars`, cut at a word boundary when
/// there is one.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let prefix: String = trimmed.chars().take(max_chars).collect();
    match prefix.rfind(char::is_whitespace) {
        Some(cut) if cut > 0 => prefix[..cut].trim_end().to_string(),
        _ => prefix,
    }
}

pub fn summarize_prompt(question: &str, view: &DocumentView, char_budget: usize) -> String {
    format!(
        "Summarize the document \"{}\" (title: {}, author: {}).\n\
         Cover its purpose, main points and conclusions in a few short paragraphs.\n\
         Use only the text below. The user asked: {}\n\n\
         Text:\n{}\n\n\
         Summary:",
        view.filename,
        view.title,
        view.author,
        question.trim(),
        excerpt(&view.text, char_budget)
    )
}

/// One section per document; retrieved passages first, the opening of the
/// document when nothing was retrieved. Returns the prompt and its sources.
pub fn compare_prompt(
    question: &str,
    sections: &[(DocumentView, Vec<SearchResult>)],
    char_budget: usize,
) -> (String, Vec<SourceRef>) {
    let per_document = char_budget / sections.len().max(1);
    let mut blocks = Vec::new();
    let mut sources = Vec::new();

    for (view, hits) in sections {
        let mut used = 0usize;
        let mut passages = Vec::new();
        for hit in hits {
            let text = hit.text.trim();
            let length = text.chars().count();
            if length == 0 || used + length > per_document {
                continue;
            }
            used += length;
            let source = hit.source();
            passages.push(format!("[Source: {source}]\n{text}"));
            if !sources.contains(&source) {
                sources.push(source);
            }
        }
        if passages.is_empty() {
            passages.push(excerpt(&view.text, per_document));
            sources.push(view.source());
        }
        blocks.push(format!("### Document: {}\n{}", view.filename, passages.join("\n\n")));
    }

    let prompt = format!(
        "Compare the following documents with respect to: {}\n\
         Point out the main similarities and differences and name the document each point comes from.\n\
         Use only the passages below.\n\n\
         {}\n\n\
         Comparison:",
        question.trim(),
        blocks.join("\n\n")
    );
    (prompt, sources)
}

/// Keyword hits per category, highest first; categories without hits are left out.
pub fn keyword_hints(text: &str) -> Vec<(&'static str, usize)> {
    let lowered = text.to_lowercase();
    let mut hints: Vec<(&'static str, usize)> = CATEGORIES
        .iter()
        .map(|(category, keywords)| {
            let hits = keywords
                .iter()
                .map(|keyword| lowered.matches(keyword).count())
                .sum();
            (*category, hits)
        })
        .filter(|(_, hits)| *hits > 0)
        .collect();
    hints.sort_by(|left, right| right.1.cmp(&left.1).then_with(|| left.0.cmp(right.0)));
    hints
}

pub fn classify_prompt(views: &[DocumentView], char_budget: usize) -> String {
    let per_document = char_budget / views.len().max(1);
    let categories = CATEGORIES
        .iter()
        .map(|(category, _)| *category)
        .collect::<Vec<_>>()
        .join(", ");

    let blocks = views
        .iter()
        .map(|view| {
            let hints = keyword_hints(&view.text)
                .iter()
                .take(3)
                .map(|(category, hits)| format!("{category} ({hits})"))
                .collect::<Vec<_>>();
            let hints = if hints.is_empty() {
                "none".to_string()
            } else {
                hints.join(", ")
            };
            format!(
                "### {}\nTitle: {}\nKeyword hints: {}\n{}",
                view.filename,
                view.title,
                hints,
                excerpt(&view.text, per_document)
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "Classify each document below into exactly one of these categories: {categories}, Other.\n\
         Reply with one line per document in the form `filename: Category` and nothing else.\n\n\
         {blocks}\n\n\
         Classification:"
    )
}

/// Reads `filename: Category` lines for the known files. Files the reply
/// skips fall back to their strongest keyword hint.
pub fn parse_classifications(reply: &str, views: &[DocumentView]) -> Vec<Classification> {
    views
        .iter()
        .map(|view| {
            let from_reply = reply.lines().find_map(|line| {
                let cleaned = line.trim().trim_start_matches(|c: char| matches!(c, '-' | '*' | ' ' | '`'));
                let (name, category) = cleaned.rsplit_once(':')?;
                let name = name.trim().trim_matches(|c: char| matches!(c, '*' | '`' | '"'));
                let category = category
                    .trim()
                    .trim_matches(|c: char| matches!(c, '*' | '`' | '.' | '"'));
                (name.eq_ignore_ascii_case(&view.filename) && !category.is_empty())
                    .then(|| category.to_string())
            });

            let category = from_reply.unwrap_or_else(|| {
                keyword_hints(&view.text)
                    .first()
                    .map(|(category, _)| category.to_string())
                    .unwrap_or_else(|| UNCATEGORIZED.to_string())
            });

            Classification {
                filename: view.filename.clone(),
                category,
            }
        })
        .collect()
}

pub fn metadata_answer(views: &[DocumentView]) -> String {
    if views.is_empty() {
        return "No documents have been uploaded yet.".to_string();
    }
    let lines = views
        .iter()
        .map(|view| {
            format!(
                "- {}: title \"{}\", author {}, {} page(s), {} chunk(s), {} characters",
                view.filename,
                view.title,
                view.author,
                view.page_count,
                view.chunk_count,
                view.text.chars().count()
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!("{} document(s) in this session:\n{lines}", views.len())
}
