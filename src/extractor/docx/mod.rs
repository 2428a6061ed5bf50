
use std::io::{Cursor, Read};

use anyhow::{Context, Result};
use quick_xml::Reader;
use quick_xml::events::Event;
use tracing::debug;

const DOCUMENT_PART: &str = "word/document.xml";
const PARAGRAPH_SEPARATOR: &str = "\n\n";

/// Extract non-blank paragraph text from an Office Open XML document
#[inline]
pub fn extract(bytes: &[u8]) -> Result<String> {
    let mut archive =
        zip::ZipArchive::new(Cursor::new(bytes)).context("Failed to open DOCX archive")?;

    let mut xml = String::new();
    archive
        .by_name(DOCUMENT_PART)
        .with_context(|| format!("DOCX archive has no {}", DOCUMENT_PART))?
        .read_to_string(&mut xml)
        .with_context(|| format!("Failed to read {}", DOCUMENT_PART))?;

    let paragraphs = paragraphs_from_xml(&xml)?;
    debug!("Extracted {} DOCX paragraphs", paragraphs.len());

    Ok(paragraphs.join(PARAGRAPH_SEPARATOR))
}

#[derive(Debug, Default)]
struct OpenParagraph {
    text: String,
    /// Depth of `w:r` elements open in this paragraph
    run_depth: usize,
}

/// Walk WordprocessingML and collect the text of each `w:p`.
///
/// Tabs and breaks count only inside runs; `w:tab` under `w:pPr` defines a tab
/// stop. Paragraphs nested in text boxes are emitted before the paragraph that
/// contains them.
fn paragraphs_from_xml(xml: &str) -> Result<Vec<String>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(false);

    let mut paragraphs = Vec::new();
    let mut open: Vec<OpenParagraph> = Vec::new();
    let mut in_text_run = false;

    loop {
        let event = reader.read_event().with_context(|| {
            format!(
                "Malformed DOCX XML at position {}",
                reader.buffer_position()
            )
        })?;

        match event {
            Event::Start(e) => match e.local_name().as_ref() {
                b"p" => open.push(OpenParagraph::default()),
                b"r" => {
                    if let Some(current) = open.last_mut() {
                        current.run_depth += 1;
                    }
                }
                b"t" => in_text_run = true,
                _ => {}
            },
            Event::Empty(e) => {
                if let Some(current) = open.last_mut().filter(|p| p.run_depth > 0) {
                    match e.local_name().as_ref() {
                        b"tab" => current.text.push('\t'),
                        b"br" | b"cr" => current.text.push('\n'),
                        _ => {}
                    }
                }
            }
            Event::Text(e) if in_text_run => {
                let text = e.unescape().context("Invalid escape in DOCX text")?;
                if let Some(current) = open.last_mut() {
                    current.text.push_str(&text);
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"t" => in_text_run = false,
                b"r" => {
                    if let Some(current) = open.last_mut() {
                        current.run_depth = current.run_depth.saturating_sub(1);
                    }
                }
                b"p" => {
                    if let Some(paragraph) = open.pop() {
                        if !paragraph.text.trim().is_empty() {
                            paragraphs.push(paragraph.text);
                        }
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(paragraphs)
}
