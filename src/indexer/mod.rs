// Indexer module
// Coordinates extraction, chunking, embedding and vector storage per file

pub mod locks;

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{Config, VectorBackend};
use crate::embeddings::chunking::TokenChunker;
use crate::embeddings::{Embedder, InputType, VoyageClient};
use crate::extractor::extract_text;
use crate::vector_index::{
    FIELD_FILE_ID, IndexStats, IndexedVector, LanceIndex, MetadataFilter, PineconeIndex,
    QueryMatch, VectorIndex,
};
use crate::{KnowledgeError, Result};

pub use locks::{FileLockGuard, FileLocks};

/// An uploaded file to be indexed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFile {
    pub file_id: String,
    pub organization_id: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
    /// Extra scoping fields copied into every vector's metadata
    #[serde(default)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub file_id: String,
    pub chunk_count: usize,
    pub token_count: usize,
    pub upserted_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    pub organization_id: String,
    #[serde(default)]
    pub file_id: Option<String>,
    pub top_k: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub file_id: String,
    pub chunk_index: u32,
    pub score: f32,
    pub content: Option<String>,
}

impl SearchHit {
    fn from_match(found: QueryMatch) -> Option<Self> {
        match found.metadata {
            Some(metadata) => Some(Self {
                id: found.id,
                file_id: metadata.file_id,
                chunk_index: metadata.chunk_index,
                score: found.score,
                content: metadata.content,
            }),
            None => {
                // ids are `<file_id>:<chunk_index>`, and file ids may contain ':'
                let (file_id, chunk_index) = found.id.rsplit_once(':')?;
                Some(Self {
                    file_id: file_id.to_string(),
                    chunk_index: chunk_index.parse().ok()?,
                    id: found.id.clone(),
                    score: found.score,
                    content: None,
                })
            }
        }
    }
}

/// Turns uploaded files into searchable vectors and answers searches over them
pub struct KnowledgeIndexer {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    chunker: Arc<TokenChunker>,
    locks: FileLocks,
}

impl std::fmt::Debug for KnowledgeIndexer {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnowledgeIndexer")
            .field("model", &self.embedder.model())
            .field("dimension", &self.embedder.dimension())
            .field("chunker", &self.chunker)
            .field("locks", &self.locks)
            .finish_non_exhaustive()
    }
}

impl KnowledgeIndexer {
    #[inline]
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        chunker: TokenChunker,
    ) -> Self {
        Self {
            embedder,
            index,
            chunker: Arc::new(chunker),
            locks: FileLocks::new(),
        }
    }

    /// Build the Voyage client, the configured vector backend and the chunker
    #[inline]
    pub async fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;

        let embedder: Arc<dyn Embedder> = Arc::new(VoyageClient::new(&config.embedding)?);
        let index: Arc<dyn VectorIndex> = match config.vector_store.backend {
            VectorBackend::Pinecone => Arc::new(PineconeIndex::new(&config.vector_store.pinecone)?),
            VectorBackend::LanceDb => Arc::new(LanceIndex::from_config(config).await?),
        };
        let chunker = TokenChunker::new(config.chunking)?;

        info!(
            "Knowledge indexer ready with {} ({} dimensions) and {:?} backend",
            embedder.model(),
            embedder.dimension(),
            config.vector_store.backend
        );
        Ok(Self::new(embedder, index, chunker))
    }

    #[inline]
    pub fn locks(&self) -> &FileLocks {
        &self.locks
    }

    /// Index a file, replacing every vector a previous ingestion of it wrote.
    ///
    /// On failure before the delete step the file's previous vectors are untouched.
    #[inline]
    pub async fn ingest_file(&self, file: SourceFile) -> Result<IngestReport> {
        let _guard = self.locks.lock(&file.file_id).await;
        let SourceFile {
            file_id,
            organization_id,
            mime_type,
            bytes,
            extra,
        } = file;

        debug!(
            "Ingesting file {} ({} bytes, {})",
            file_id,
            bytes.len(),
            mime_type
        );

        let chunker = Arc::clone(&self.chunker);
        let chunks = run_blocking(move || {
            let text = extract_text(&bytes, &mime_type)?;
            chunker.chunk_text(&text)
        })
        .await?;

        if chunks.is_empty() {
            self.index.delete_by_file(&file_id).await?;
            warn!("File {} has no text to index, removed its vectors", file_id);
            return Ok(IngestReport {
                file_id,
                chunk_count: 0,
                token_count: 0,
                upserted_count: 0,
            });
        }

        let texts: Vec<String> = chunks.iter().map(|chunk| chunk.content.clone()).collect();
        let embedder = Arc::clone(&self.embedder);
        let embeddings =
            run_blocking(move || embedder.embed(&texts, InputType::Document)).await?;

        if embeddings.len() != chunks.len() {
            return Err(KnowledgeError::Embedding(anyhow!(
                "Received {} embeddings for {} chunks",
                embeddings.len(),
                chunks.len()
            )));
        }

        let vectors = chunks
            .iter()
            .zip(embeddings)
            .map(|(chunk, values)| {
                IndexedVector::for_chunk(&file_id, &organization_id, chunk, values)
                    .map(|vector| vector.with_extra(extra.clone()))
            })
            .collect::<Result<Vec<_>>>()?;

        self.index.delete_by_file(&file_id).await?;
        let upserted_count = self.index.upsert(&vectors).await?;

        let report = IngestReport {
            file_id,
            chunk_count: chunks.len(),
            token_count: chunks.iter().map(|chunk| chunk.token_count).sum(),
            upserted_count,
        };
        info!(
            "Indexed file {}: {} chunks, {} tokens",
            report.file_id, report.chunk_count, report.token_count
        );
        Ok(report)
    }

    /// Remove every vector belonging to a file
    #[inline]
    pub async fn remove_file(&self, file_id: &str) -> Result<()> {
        let _guard = self.locks.lock(file_id).await;
        self.index.delete_by_file(file_id).await?;
        info!("Removed vectors for file {}", file_id);
        Ok(())
    }

    /// Nearest chunks to a query within one organization
    #[inline]
    pub async fn search(&self, request: SearchRequest) -> Result<Vec<SearchHit>> {
        if request.query.trim().is_empty() || request.top_k == 0 {
            return Ok(Vec::new());
        }

        let embedder = Arc::clone(&self.embedder);
        let query = request.query;
        let vector = run_blocking(move || embedder.embed_one(&query, InputType::Query)).await?;

        let mut filter = MetadataFilter::for_organization(&request.organization_id);
        if let Some(file_id) = &request.file_id {
            filter = filter.eq(FIELD_FILE_ID, file_id.as_str());
        }

        let matches = self
            .index
            .query(&vector, request.top_k, &filter, true)
            .await?;

        let hits: Vec<SearchHit> = matches
            .into_iter()
            .filter_map(SearchHit::from_match)
            .collect();
        debug!(
            "Search in organization {} returned {} hits",
            request.organization_id,
            hits.len()
        );
        Ok(hits)
    }

    #[inline]
    pub async fn stats(&self) -> Result<IndexStats> {
        self.index.stats().await
    }
}

/// Run CPU-bound or blocking work on tokio's blocking pool
async fn run_blocking<T, F>(operation: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(operation)
        .await
        .map_err(|e| KnowledgeError::Other(anyhow::Error::new(e).context("Blocking task failed")))?
}
