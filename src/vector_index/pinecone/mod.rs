
use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};
use url::Url;

use super::{IndexStats, IndexedVector, MetadataFilter, QueryMatch, VectorIndex, VectorMetadata};
use crate::config::PineconeConfig;
use crate::http::{RequestError, RetryPolicy, build_agent};
use crate::{KnowledgeError, Result};

const API_KEY_HEADER: &str = "Api-Key";
const API_VERSION_HEADER: &str = "X-Pinecone-API-Version";
/// Pinecone rejects delete requests naming more ids than this
const MAX_DELETE_IDS: usize = 1000;

/// Client for a single Pinecone index's data plane
#[derive(Clone)]
pub struct PineconeIndex {
    base_url: Url,
    api_key: String,
    api_version: String,
    namespace: String,
    batch_size: usize,
    agent: ureq::Agent,
    retry: RetryPolicy,
}

impl std::fmt::Debug for PineconeIndex {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PineconeIndex")
            .field("base_url", &self.base_url.as_str())
            .field("api_version", &self.api_version)
            .field("namespace", &self.namespace)
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UpsertRequest<'a> {
    vectors: &'a [IndexedVector],
    #[serde(skip_serializing_if = "is_default_namespace")]
    namespace: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpsertResponse {
    #[serde(default)]
    upserted_count: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    vector: &'a [f32],
    top_k: usize,
    include_metadata: bool,
    include_values: bool,
    #[serde(skip_serializing_if = "is_match_all")]
    filter: &'a MetadataFilter,
    #[serde(skip_serializing_if = "is_default_namespace")]
    namespace: &'a str,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<RawMatch>,
}

#[derive(Debug, Deserialize)]
struct RawMatch {
    id: String,
    #[serde(default)]
    score: f32,
    #[serde(default)]
    metadata: Option<VectorMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatsResponse {
    #[serde(default)]
    namespaces: BTreeMap<String, NamespaceSummary>,
    #[serde(default)]
    dimension: Option<usize>,
    #[serde(default)]
    index_fullness: Option<f32>,
    #[serde(default)]
    total_vector_count: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NamespaceSummary {
    #[serde(default)]
    vector_count: u64,
}

fn is_default_namespace(namespace: &&str) -> bool {
    namespace.is_empty()
}

fn is_match_all(filter: &&MetadataFilter) -> bool {
    filter.is_empty()
}

impl PineconeIndex {
    #[inline]
    pub fn new(config: &PineconeConfig) -> crate::Result<Self> {
        let base_url = config.index_url()?;
        let api_key = config.require_api_key()?.to_string();

        Ok(Self {
            base_url,
            api_key,
            api_version: config.api_version.clone(),
            namespace: config.namespace.clone(),
            batch_size: config.batch_size.max(1) as usize,
            agent: build_agent(Duration::from_secs(config.timeout_seconds)),
            retry: RetryPolicy {
                attempts: config.retry_attempts,
                ..RetryPolicy::default()
            },
        })
    }

    #[inline]
    pub const fn with_retry_delay(mut self, base_delay: Duration) -> Self {
        self.retry.base_delay = base_delay;
        self
    }

    fn post(&self, path: &str, body: &str) -> std::result::Result<String, RequestError> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| RequestError::Fatal(format!("Invalid Pinecone URL: {}", e)))?;

        self.retry.send(url.as_str(), || {
            self.agent
                .post(url.as_str())
                .header(API_KEY_HEADER, &self.api_key)
                .header(API_VERSION_HEADER, &self.api_version)
                .header("Content-Type", "application/json")
                .send(body)
                .and_then(|mut resp| resp.body_mut().read_to_string())
        })
    }

    fn upsert_blocking(&self, vectors: &[IndexedVector]) -> anyhow::Result<usize> {
        let mut upserted = 0;

        for batch in vectors.chunks(self.batch_size) {
            let body = serde_json::to_string(&UpsertRequest {
                vectors: batch,
                namespace: &self.namespace,
            })
            .context("Failed to serialize upsert request")?;

            let response_text = self
                .post("/vectors/upsert", &body)
                .with_context(|| format!("Failed to upsert batch of {} vectors", batch.len()))?;
            let response: UpsertResponse = serde_json::from_str(&response_text)
                .context("Failed to parse upsert response")?;

            debug!("Pinecone upserted {} vectors", response.upserted_count);
            upserted += response.upserted_count;
        }

        Ok(upserted)
    }

    fn query_blocking(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &MetadataFilter,
        include_metadata: bool,
    ) -> anyhow::Result<Vec<QueryMatch>> {
        let body = serde_json::to_string(&QueryRequest {
            vector,
            top_k,
            include_metadata,
            include_values: false,
            filter,
            namespace: &self.namespace,
        })
        .context("Failed to serialize query request")?;

        let response_text = self.post("/query", &body).context("Pinecone query failed")?;
        let response: QueryResponse =
            serde_json::from_str(&response_text).context("Failed to parse query response")?;

        let mut matches: Vec<QueryMatch> = response
            .matches
            .into_iter()
            .map(|raw| QueryMatch {
                id: raw.id,
                score: raw.score,
                metadata: if include_metadata { raw.metadata } else { None },
            })
            .collect();
        matches.sort_by(|a, b| b.score.total_cmp(&a.score));
        matches.truncate(top_k);

        Ok(matches)
    }

    fn delete_blocking(&self, body: &serde_json::Value) -> anyhow::Result<()> {
        let body = serde_json::to_string(body).context("Failed to serialize delete request")?;

        match self.post("/vectors/delete", &body) {
            Ok(_) => Ok(()),
            Err(RequestError::Client(404)) => {
                debug!("Pinecone delete matched nothing (404), treating as deleted");
                Ok(())
            }
            Err(e) => Err(anyhow!(e).context("Pinecone delete failed")),
        }
    }

    fn delete_ids_blocking(&self, ids: &[String]) -> anyhow::Result<()> {
        for batch in ids.chunks(MAX_DELETE_IDS) {
            let mut body = json!({ "ids": batch });
            if !self.namespace.is_empty() {
                body["namespace"] = json!(self.namespace);
            }
            self.delete_blocking(&body)?;
        }
        Ok(())
    }

    fn delete_filter_blocking(&self, filter: &MetadataFilter) -> anyhow::Result<()> {
        let mut body = json!({ "filter": filter });
        if !self.namespace.is_empty() {
            body["namespace"] = json!(self.namespace);
        }
        self.delete_blocking(&body)
    }

    fn stats_blocking(&self) -> anyhow::Result<IndexStats> {
        let response_text = self
            .post("/describe_index_stats", "{}")
            .context("Failed to describe index stats")?;
        let response: StatsResponse =
            serde_json::from_str(&response_text).context("Failed to parse index stats")?;

        Ok(IndexStats {
            total_vector_count: response.total_vector_count,
            dimension: response.dimension,
            index_fullness: response.index_fullness,
            namespaces: response
                .namespaces
                .into_iter()
                .map(|(name, summary)| (name, summary.vector_count))
                .collect(),
        })
    }

    /// Run a blocking data-plane call on tokio's blocking pool
    async fn run_blocking<T, F>(&self, operation: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Self) -> anyhow::Result<T> + Send + 'static,
    {
        let client = self.clone();
        tokio::task::spawn_blocking(move || operation(client))
            .await
            .context("Pinecone request task failed")
            .and_then(|result| result)
            .map_err(KnowledgeError::VectorStore)
    }
}

#[async_trait]
impl VectorIndex for PineconeIndex {
    #[inline]
    async fn upsert(&self, vectors: &[IndexedVector]) -> Result<usize> {
        if vectors.is_empty() {
            return Ok(0);
        }

        let vectors = vectors.to_vec();
        let count = self
            .run_blocking(move |client| client.upsert_blocking(&vectors))
            .await?;

        info!("Upserted {} vectors to Pinecone", count);
        Ok(count)
    }

    #[inline]
    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &MetadataFilter,
        include_metadata: bool,
    ) -> Result<Vec<QueryMatch>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let vector = vector.to_vec();
        let filter = filter.clone();
        self.run_blocking(move |client| {
            client.query_blocking(&vector, top_k, &filter, include_metadata)
        })
        .await
    }

    #[inline]
    async fn delete_by_ids(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let ids = ids.to_vec();
        let count = ids.len();
        self.run_blocking(move |client| client.delete_ids_blocking(&ids))
            .await?;

        info!("Deleted {} vector ids from Pinecone", count);
        Ok(())
    }

    #[inline]
    async fn delete_by_filter(&self, filter: &MetadataFilter) -> Result<()> {
        if filter.is_empty() {
            return Err(KnowledgeError::VectorStore(anyhow!(
                "Refusing to delete with an empty filter"
            )));
        }

        let filter = filter.clone();
        self.run_blocking(move |client| client.delete_filter_blocking(&filter))
            .await?;

        info!("Deleted Pinecone vectors by filter");
        Ok(())
    }

    #[inline]
    async fn stats(&self) -> Result<IndexStats> {
        self.run_blocking(|client| client.stats_blocking()).await
    }
}
