// Embeddings module
// Token chunking and the embedding API client

pub mod chunking;
pub mod voyage;

use serde::{Deserialize, Serialize};

use crate::{KnowledgeError, Result};

pub use chunking::{Chunk, ChunkingConfig, TokenChunker, chunk_text, count_tokens};
pub use voyage::VoyageClient;

/// Whether text is embedded for storage or for searching.
///
/// Models with asymmetric embeddings prepend a different instruction for each,
/// so search-time text must always be embedded as [`InputType::Query`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    Document,
    Query,
}

impl InputType {
    #[inline]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Query => "query",
        }
    }
}

/// Maps text to fixed-dimension vectors
pub trait Embedder: Send + Sync {
    /// Model identifier sent with each request
    fn model(&self) -> &str;

    /// Length of every vector this embedder returns
    fn dimension(&self) -> usize;

    /// Embed a batch of texts, one vector per input in input order.
    ///
    /// All-or-nothing: no partial results are returned on failure.
    fn embed(&self, texts: &[String], input_type: InputType) -> Result<Vec<Vec<f32>>>;

    /// Embed a single text
    #[inline]
    fn embed_one(&self, text: &str, input_type: InputType) -> Result<Vec<f32>> {
        self.embed(&[text.to_string()], input_type)?
            .into_iter()
            .next()
            .ok_or_else(|| KnowledgeError::Embedding(anyhow::anyhow!("Empty embedding response")))
    }
}
