
use std::sync::LazyLock;

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use tiktoken_rs::{CoreBPE, Rank};
use tracing::debug;

use crate::{KnowledgeError, Result};

static SHARED_CHUNKER: LazyLock<std::result::Result<TokenChunker, String>> =
    LazyLock::new(|| TokenChunker::new(ChunkingConfig::default()).map_err(|e| e.to_string()));

/// A token-bounded slice of a document's text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Decoded text of the token window
    pub content: String,
    /// Number of tokens in the window
    pub token_count: usize,
    /// Position of this chunk within the document, starting at 0
    pub chunk_index: usize,
}

/// Configuration for token window chunking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Window size in tokens
    pub chunk_size: usize,
    /// Tokens shared between adjacent windows
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    #[inline]
    fn default() -> Self {
        Self {
            chunk_size: 500,
            overlap: 50,
        }
    }
}

impl ChunkingConfig {
    /// Distance between the starts of two consecutive windows
    #[inline]
    pub fn step(&self) -> Result<usize> {
        if self.chunk_size == 0 || self.overlap >= self.chunk_size {
            return Err(KnowledgeError::InvalidChunkingParameters {
                chunk_size: self.chunk_size,
                overlap: self.overlap,
            });
        }
        Ok(self.chunk_size - self.overlap)
    }
}

/// Splits text into overlapping windows of `cl100k_base` tokens
pub struct TokenChunker {
    config: ChunkingConfig,
    bpe: CoreBPE,
}

impl std::fmt::Debug for TokenChunker {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenChunker")
            .field("config", &self.config)
            .field("encoding", &"cl100k_base")
            .finish()
    }
}

impl TokenChunker {
    #[inline]
    pub fn new(config: ChunkingConfig) -> Result<Self> {
        config.step()?;

        let bpe = tiktoken_rs::cl100k_base().context("Failed to load cl100k_base tokenizer")?;

        Ok(Self { config, bpe })
    }

    #[inline]
    pub const fn config(&self) -> ChunkingConfig {
        self.config
    }

    /// Number of tokens the text costs the downstream model
    #[inline]
    pub fn count_tokens(&self, text: &str) -> usize {
        self.bpe.encode_ordinary(text).len()
    }

    /// Chunk text with this chunker's window parameters
    #[inline]
    pub fn chunk_text(&self, text: &str) -> Result<Vec<Chunk>> {
        self.chunk_with(text, self.config)
    }

    /// Chunk text with explicit window parameters, reusing the loaded tokenizer
    #[inline]
    pub fn chunk_with(&self, text: &str, config: ChunkingConfig) -> Result<Vec<Chunk>> {
        let step = config.step()?;

        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let tokens = self.bpe.encode_ordinary(text);
        let mut chunks = Vec::with_capacity(tokens.len().div_ceil(step));
        let mut start = 0;

        loop {
            let end = (start + config.chunk_size).min(tokens.len());
            let window = &tokens[start..end];

            chunks.push(Chunk {
                content: self.decode_window(window),
                token_count: window.len(),
                chunk_index: chunks.len(),
            });

            if end == tokens.len() {
                break;
            }
            start += step;
        }

        debug!(
            "Chunked {} tokens into {} chunks (size {}, overlap {})",
            tokens.len(),
            chunks.len(),
            config.chunk_size,
            config.overlap
        );

        Ok(chunks)
    }

    /// Decode a token window byte-for-byte.
    ///
    /// Only the bytes of a character cut by a window edge become U+FFFD; every
    /// complete character in the window is kept.
    fn decode_window(&self, window: &[Rank]) -> String {
        let bytes: Vec<u8> = self
            .bpe
            ._decode_native_and_split(window.to_vec())
            .flatten()
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

fn shared_chunker() -> Result<&'static TokenChunker> {
    SHARED_CHUNKER
        .as_ref()
        .map_err(|e| KnowledgeError::Other(anyhow!("Tokenizer unavailable: {}", e)))
}

/// Chunk text using the process-wide `cl100k_base` tokenizer
#[inline]
pub fn chunk_text(text: &str, config: &ChunkingConfig) -> Result<Vec<Chunk>> {
    shared_chunker()?.chunk_with(text, *config)
}

/// Count `cl100k_base` tokens using the process-wide tokenizer
#[inline]
pub fn count_tokens(text: &str) -> Result<usize> {
    Ok(shared_chunker()?.count_tokens(text))
}
