
use anyhow::{Context, Result};
use lopdf::Document;
use tracing::{debug, warn};

const PAGE_SEPARATOR: &str = "\n\n";

/// Extract page text in page order, skipping pages that have none
#[inline]
pub fn extract(bytes: &[u8]) -> Result<String> {
    let document = Document::load_mem(bytes).context("Failed to parse PDF document")?;
    let pages = document.get_pages();

    debug!("Extracting text from {} PDF pages", pages.len());

    let mut page_texts = Vec::with_capacity(pages.len());
    for page_number in pages.keys() {
        match document.extract_text(&[*page_number]) {
            Ok(text) => {
                let text = text.trim();
                if text.is_empty() {
                    debug!("PDF page {} has no extractable text", page_number);
                } else {
                    page_texts.push(text.to_string());
                }
            }
            Err(e) => {
                warn!("Skipping PDF page {}: {}", page_number, e);
            }
        }
    }

    Ok(page_texts.join(PAGE_SEPARATOR))
}
