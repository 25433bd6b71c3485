use crate::models::{SearchResult, SourceRef};

pub const NO_CONTEXT_MARKER: &str = "No relevant context found in the uploaded documents.";

#[derive(Debug, Clone, PartialEq)]
pub struct AssembledContext {
    pub prompt: String,
    /// Distinct sources of the included chunks, in inclusion order.
    pub sources: Vec<SourceRef>,
    pub included_chunks: usize,
    /// Characters of chunk text placed in the prompt; never above the budget.
    pub included_chars: usize,
    pub has_context: bool,
}

/// Builds the answer prompt from ranked search results under a character budget.
#[derive(Debug, Clone, Copy)]
pub struct ContextAssembler {
    char_budget: usize,
}

impl ContextAssembler {
    pub fn new(char_budget: usize) -> Self {
        Self { char_budget }
    }

    pub fn char_budget(&self) -> usize {
        self.char_budget
    }

    pub fn with_budget(&self, char_budget: usize) -> Self {
        Self { char_budget }
    }

    /// Chunks go in whole, highest relevance first, until the next one would
    /// not fit.
    pub fn assemble(&self, question: &str, results: &[SearchResult]) -> AssembledContext {
        let mut ranked: Vec<&SearchResult> = results.iter().collect();
        ranked.sort_by(|left, right| right.score.total_cmp(&left.score));

        let mut blocks = Vec::new();
        let mut sources: Vec<SourceRef> = Vec::new();
        let mut included_chars = 0usize;

        for result in ranked {
            let text = result.text.trim();
            let length = text.chars().count();
            if length == 0 {
                continue;
            }
            if included_chars + length > self.char_budget {
                break;
            }
            included_chars += length;

            let source = result.source();
            blocks.push(format!("[Source: {source}]\n{text}"));
            if !sources.contains(&source) {
                sources.push(source);
            }
        }

        if blocks.is_empty() {
            return AssembledContext {
                prompt: no_context_prompt(question),
                sources,
                included_chunks: 0,
                included_chars: 0,
                has_context: false,
            };
        }

        let prompt = format!(
            "You answer questions about the user's PDF documents.\n\
             Use only the context below and cite the sources you rely on as (file, page N).\n\
             If the context does not contain the answer, say that you cannot answer from the documents.\n\n\
             Context:\n{}\n\n\
             Question: {}\n\
             Answer:",
            blocks.join("\n\n"),
            question.trim()
        );

        AssembledContext {
            prompt,
            sources,
            included_chunks: blocks.len(),
            included_chars,
            has_context: true,
        }
    }
}

fn no_context_prompt(question: &str) -> String {
    format!(
        "{NO_CONTEXT_MARKER}\n\
         Tell the user that you cannot answer this question from their documents. \
         Do not guess and do not use outside knowledge.\n\n\
         Question: {}\n\
         Answer:",
        question.trim()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Metadata;

    fn hit(id: &str, score: f32, text: &str, page: u32) -> SearchResult {
        let mut metadata = Metadata::new();
        metadata.insert("document_id", "doc-1");
        metadata.insert("source_file", "manual.pdf");
        metadata.insert("page_start", page);
        SearchResult {
            chunk_id: id.to_string(),
            score,
            text: text.to_string(),
            metadata,
        }
    }

    #[test]
    fn includes_whole_chunks_within_budget() {
        let assembler = ContextAssembler::new(25);
        let results = vec![
            hit("b", 0.4, "second chunk text", 2),
            hit("a", 0.9, "first chunk", 1),
            hit("c", 0.1, "x", 3),
        ];
        let context = assembler.assemble("What is first?", &results);

        assert!(context.has_context);
        assert_eq!(context.included_chunks, 1);
        assert_eq!(context.included_chars, "first chunk".len());
        assert!(context.prompt.contains("[Source: manual.pdf, page 1]\nfirst chunk"));
        assert!(!context.prompt.contains("second chunk"));
        assert!(!context.prompt.contains("\nx\n"), "assembly stops at the first chunk that does not fit");
    }

    #[test]
    fn sources_are_deduplicated() {
        let assembler = ContextAssembler::new(3_000);
        let results = vec![hit("a", 0.9, "one", 4), hit("b", 0.8, "two", 4)];
        let context = assembler.assemble("q", &results);
        assert_eq!(context.sources.len(), 1);
        assert_eq!(context.sources[0].to_string(), "manual.pdf, page 4");
    }

    #[test]
    fn chunk_spanning_pages_cites_the_range() {
        let mut spanning = hit("a", 0.9, "crosses a page break", 2);
        spanning.metadata.insert("page_end", 3u32);
        let context = ContextAssembler::new(3_000).assemble("q", &[spanning]);
        assert!(context.prompt.contains("[Source: manual.pdf, page 2-3]\ncrosses a page break"));
        assert_eq!(context.sources[0].page_end, Some(3));
    }

    #[test]
    fn empty_results_produce_no_context_prompt() {
        let context = ContextAssembler::new(3_000).assemble("Who wrote this?", &[]);
        assert!(!context.has_context);
        assert!(context.prompt.starts_with(NO_CONTEXT_MARKER));
        assert!(context.prompt.contains("cannot answer"));
        assert!(context.prompt.contains("Who wrote this?"));
    }

    #[test]
    fn oversized_first_chunk_is_excluded() {
        let context = ContextAssembler::new(5).assemble("q", &[hit("a", 0.9, "far too long", 1)]);
        assert!(!context.has_context);
        assert_eq!(context.included_chars, 0);
    }
}
