use crate::error::IngestError;
use crate::models::DocumentInfo;
use lopdf::{Document, Object};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct PageText {
    pub number: u32,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct ExtractedPdf {
    pub page_count: u32,
    /// Pages that produced text, in page order.
    pub pages: Vec<PageText>,
    pub info: DocumentInfo,
    pub warnings: Vec<String>,
}

pub trait PdfExtractor: Send + Sync {
    fn extract(&self, bytes: &[u8], filename: &str) -> Result<ExtractedPdf, IngestError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LopdfExtractor;

impl PdfExtractor for LopdfExtractor {
    fn extract(&self, bytes: &[u8], filename: &str) -> Result<ExtractedPdf, IngestError> {
        let document = Document::load_mem(bytes)
            .map_err(|error| IngestError::invalid(filename, format!("unreadable pdf: {error}")))?;

        let page_numbers: Vec<u32> = document.get_pages().keys().copied().collect();
        if page_numbers.is_empty() {
            return Err(IngestError::invalid(filename, "pdf has no pages"));
        }

        let mut pages = Vec::new();
        let mut warnings = Vec::new();
        for page_no in &page_numbers {
            match document.extract_text(&[*page_no]) {
                Ok(text) if !text.trim().is_empty() => pages.push(PageText {
                    number: *page_no,
                    text,
                }),
                Ok(_) => warnings.push(format!("page {page_no}: no text")),
                Err(error) => {
                    warn!(filename, page = page_no, %error, "skipping unreadable page");
                    warnings.push(format!("page {page_no}: {error}"));
                }
            }
        }

        if pages.is_empty() {
            return Err(IngestError::EmptyDocument(filename.to_string()));
        }

        Ok(ExtractedPdf {
            page_count: page_numbers.len() as u32,
            pages,
            info: read_info(&document, filename),
            warnings,
        })
    }
}

fn read_info(document: &Document, filename: &str) -> DocumentInfo {
    let info = document.trailer.get(b"Info").ok().and_then(|object| match object {
        Object::Reference(id) => document.get_object(*id).ok().and_then(|o| o.as_dict().ok()),
        Object::Dictionary(dictionary) => Some(dictionary),
        _ => None,
    });

    let field = |key: &[u8]| {
        info.and_then(|dictionary| dictionary.get(key).ok())
            .and_then(|object| match object {
                Object::String(bytes, _) => Some(decode_pdf_string(bytes)),
                _ => None,
            })
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    };

    DocumentInfo {
        title: field(b"Title").unwrap_or_else(|| filename.to_string()),
        author: field(b"Author").unwrap_or_else(|| "Unknown".to_string()),
    }
}

/// Text strings are UTF-16BE with a byte order mark, or single-byte otherwise.
fn decode_pdf_string(bytes: &[u8]) -> String {
    if let Some(utf16) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        let units: Vec<u16> = utf16
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    bytes.iter().map(|byte| char::from(*byte)).collect()
}

#[cfg(test)]
pub(crate) mod fixtures {
    use lopdf::content::{Content, Operation};
    use lopdf::{dictionary, Document, Object, Stream};

    /// Builds a PDF with one page per entry, each page showing its lines.
    pub fn pdf_with_pages(pages: &[&[&str]], title: Option<&str>) -> Vec<u8> {
        let mut document = Document::with_version("1.5");
        let pages_id = document.new_object_id();
        let font_id = document.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Courier",
        });
        let resources_id = document.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });

        let mut kids = Vec::new();
        for lines in pages {
            let mut operations = vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 12.into()]),
                Operation::new("Td", vec![72.into(), 720.into()]),
            ];
            for line in lines.iter() {
                operations.push(Operation::new("Tj", vec![Object::string_literal(*line)]));
                operations.push(Operation::new("Td", vec![0.into(), (-16).into()]));
            }
            operations.push(Operation::new("ET", vec![]));
            let content = Content { operations };
            let encoded = content.encode().unwrap_or_default();
            let content_id = document.add_object(Stream::new(dictionary! {}, encoded));
            let page_id = document.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
                "Resources" => resources_id,
                "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            });
            kids.push(Object::Reference(page_id));
        }

        let count = kids.len() as i64;
        document.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count,
            }),
        );
        let catalog_id = document.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        document.trailer.set("Root", catalog_id);
        if let Some(title) = title {
            let info_id = document.add_object(dictionary! {
                "Title" => Object::string_literal(title),
                "Author" => Object::string_literal("Ada"),
            });
            document.trailer.set("Info", info_id);
        }

        let mut bytes = Vec::new();
        document
            .save_to(&mut bytes)
            .expect("in-memory pdf should serialize");
        bytes
    }
}
