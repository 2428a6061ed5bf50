use thiserror::Error;

pub type Result<T> = std::result::Result<T, KnowledgeError>;

#[derive(Error, Debug)]
pub enum KnowledgeError {
    #[error("Unsupported file type: {0}")]
    UnsupportedFileType(String),

    #[error("Extraction error: {0:#}")]
    Extraction(anyhow::Error),

    #[error("Invalid chunking parameters: overlap ({overlap}) must be smaller than chunk size ({chunk_size})")]
    InvalidChunkingParameters { chunk_size: usize, overlap: usize },

    #[error("Embedding error: {0:#}")]
    Embedding(anyhow::Error),

    #[error("Vector store error: {0:#}")]
    VectorStore(anyhow::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl KnowledgeError {
    /// Whether the caller may retry the whole batch with the same input.
    ///
    /// Embedding requests and upserts are idempotent per batch/id, so failures
    /// talking to the remote services are worth another attempt. Everything else
    /// fails the same way on every attempt.
    #[inline]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Embedding(_) | Self::VectorStore(_))
    }
}

pub mod config;
pub mod embeddings;
pub mod extractor;
pub mod http;
pub mod indexer;
pub mod vector_index;

pub use config::Config;
pub use embeddings::chunking::{Chunk, ChunkingConfig, TokenChunker, chunk_text, count_tokens};
pub use embeddings::{Embedder, InputType, VoyageClient};
pub use extractor::{FileType, extract_text};
pub use indexer::{
    FileLocks, IngestReport, KnowledgeIndexer, SearchHit, SearchRequest, SourceFile,
};
pub use vector_index::{
    IndexStats, IndexedVector, LanceIndex, MetadataFilter, PineconeIndex, QueryMatch, VectorIndex,
    VectorMetadata,
};
