// Extractor module
// Converts uploaded file bytes into plain UTF-8 text


pub mod docx;
pub mod pdf;
pub mod text;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{KnowledgeError, Result};

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_PLAIN_TEXT: &str = "text/plain";
pub const MIME_MARKDOWN: &str = "text/markdown";
pub const MIME_MARKDOWN_LEGACY: &str = "text/x-markdown";
pub const MIME_OCTET_STREAM: &str = "application/octet-stream";

/// File formats the extractor understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Pdf,
    Docx,
    PlainText,
    Markdown,
}

impl FileType {
    /// Resolve a declared MIME type, ignoring parameters and case.
    ///
    /// `application/octet-stream` resolves to [`FileType::Markdown`] since uploads
    /// from some clients carry no better type; the text path never rejects bytes.
    #[inline]
    pub fn from_mime(mime: &str) -> Option<Self> {
        let essence = mime_essence(mime);

        match essence.as_str() {
            MIME_PDF => Some(Self::Pdf),
            MIME_DOCX => Some(Self::Docx),
            MIME_PLAIN_TEXT => Some(Self::PlainText),
            MIME_MARKDOWN | MIME_MARKDOWN_LEGACY | MIME_OCTET_STREAM => Some(Self::Markdown),
            _ => None,
        }
    }

    #[inline]
    pub const fn mime_type(self) -> &'static str {
        match self {
            Self::Pdf => MIME_PDF,
            Self::Docx => MIME_DOCX,
            Self::PlainText => MIME_PLAIN_TEXT,
            Self::Markdown => MIME_MARKDOWN,
        }
    }
}

fn mime_essence(mime: &str) -> String {
    mime.split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Extract the text content of a file given its declared MIME type.
///
/// Well-formed input of a supported type always yields a string, possibly empty.
#[inline]
pub fn extract_text(bytes: &[u8], declared_mime_type: &str) -> Result<String> {
    let file_type = FileType::from_mime(declared_mime_type).ok_or_else(|| {
        KnowledgeError::UnsupportedFileType(declared_mime_type.trim().to_string())
    })?;

    if mime_essence(declared_mime_type) == MIME_OCTET_STREAM {
        warn!(
            "Treating {} byte upload declared as {} as Markdown",
            bytes.len(),
            MIME_OCTET_STREAM
        );
    }

    let text = match file_type {
        FileType::Pdf => pdf::extract(bytes).map_err(KnowledgeError::Extraction)?,
        FileType::Docx => docx::extract(bytes).map_err(KnowledgeError::Extraction)?,
        FileType::PlainText => text::decode(bytes),
        FileType::Markdown => text::markdown_to_text(&text::decode(bytes)),
    };

    debug!(
        "Extracted {} chars from {} bytes of {:?}",
        text.len(),
        bytes.len(),
        file_type
    );

    Ok(text)
}
