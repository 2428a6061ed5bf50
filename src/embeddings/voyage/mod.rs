
use anyhow::{Context, Result, anyhow};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use super::{Embedder, InputType};
use crate::KnowledgeError;
use crate::config::EmbeddingConfig;
use crate::http::{RetryPolicy, build_agent};

pub const DEFAULT_VOYAGE_MODEL: &str = "voyage-3";
pub const DEFAULT_EMBEDDING_DIMENSION: u32 = 1024;

const EMBEDDINGS_PATH: &str = "/v1/embeddings";
const HEALTH_CHECK_TEXT: &str = "knowledge base health check";

/// Client for the Voyage AI embeddings API
#[derive(Clone)]
pub struct VoyageClient {
    base_url: Url,
    api_key: String,
    model: String,
    dimension: usize,
    batch_size: usize,
    agent: ureq::Agent,
    retry: RetryPolicy,
}

impl std::fmt::Debug for VoyageClient {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoyageClient")
            .field("base_url", &self.base_url.as_str())
            .field("model", &self.model)
            .field("dimension", &self.dimension)
            .field("batch_size", &self.batch_size)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    input: &'a [String],
    model: &'a str,
    input_type: InputType,
    truncation: bool,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    data: Vec<EmbeddingData>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[derive(Debug, Deserialize)]
struct Usage {
    total_tokens: u64,
}

impl VoyageClient {
    #[inline]
    pub fn new(config: &EmbeddingConfig) -> crate::Result<Self> {
        let base_url = config.api_url()?;
        let api_key = config.require_api_key()?.to_string();

        Ok(Self {
            base_url,
            api_key,
            model: config.model.clone(),
            dimension: config.dimension as usize,
            batch_size: config.batch_size.max(1) as usize,
            agent: build_agent(Duration::from_secs(config.timeout_seconds)),
            retry: RetryPolicy {
                attempts: config.retry_attempts,
                ..RetryPolicy::default()
            },
        })
    }

    #[inline]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.agent = build_agent(timeout);
        self
    }

    #[inline]
    pub const fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry.attempts = attempts;
        self
    }

    #[inline]
    pub const fn with_retry_delay(mut self, base_delay: Duration) -> Self {
        self.retry.base_delay = base_delay;
        self
    }

    /// Embed a probe text and verify the model returns the configured dimension
    #[inline]
    pub fn health_check(&self) -> Result<()> {
        debug!("Performing health check for Voyage at {}", self.base_url);

        let vectors = self
            .generate_embeddings(&[HEALTH_CHECK_TEXT.to_string()], InputType::Query)
            .context("Health check embedding failed")?;

        if vectors.len() != 1 {
            return Err(anyhow!(
                "Health check returned {} embeddings for one input",
                vectors.len()
            ));
        }

        info!(
            "Health check passed for Voyage at {} with model {} ({} dimensions)",
            self.base_url, self.model, self.dimension
        );
        Ok(())
    }

    /// Generate embeddings for multiple texts, splitting into API-sized batches
    #[inline]
    pub fn generate_embeddings(
        &self,
        texts: &[String],
        input_type: InputType,
    ) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        debug!(
            "Generating {} embeddings for {} texts",
            input_type.as_str(),
            texts.len()
        );

        let mut results = Vec::with_capacity(texts.len());

        for batch in texts.chunks(self.batch_size) {
            let batch_results = self
                .generate_embeddings_single_batch(batch, input_type)
                .with_context(|| format!("Failed to process batch of {} texts", batch.len()))?;

            results.extend(batch_results);
        }

        debug!("Generated {} embeddings total", results.len());
        Ok(results)
    }

    fn generate_embeddings_single_batch(
        &self,
        texts: &[String],
        input_type: InputType,
    ) -> Result<Vec<Vec<f32>>> {
        let request = EmbedRequest {
            input: texts,
            model: &self.model,
            input_type,
            truncation: true,
        };

        let url = self
            .base_url
            .join(EMBEDDINGS_PATH)
            .context("Failed to build embedding URL")?;

        let request_json =
            serde_json::to_string(&request).context("Failed to serialize embedding request")?;
        let authorization = format!("Bearer {}", self.api_key);

        let response_text = self
            .retry
            .send(url.as_str(), || {
                self.agent
                    .post(url.as_str())
                    .header("Authorization", &authorization)
                    .header("Content-Type", "application/json")
                    .send(&request_json)
                    .and_then(|mut resp| resp.body_mut().read_to_string())
            })
            .context("Failed to generate embeddings")?;

        let response: EmbedResponse = serde_json::from_str(&response_text)
            .context("Failed to parse embedding response")?;

        if response.data.len() != texts.len() {
            return Err(anyhow!(
                "Mismatch between request and response counts: {} vs {}",
                texts.len(),
                response.data.len()
            ));
        }

        if let Some(usage) = &response.usage {
            debug!("Embedding batch used {} tokens", usage.total_tokens);
        }

        let ordered = response
            .data
            .into_iter()
            .sorted_by_key(|data| data.index)
            .collect::<Vec<_>>();

        let mut embeddings = Vec::with_capacity(ordered.len());
        for (position, data) in ordered.into_iter().enumerate() {
            if data.index != position {
                return Err(anyhow!(
                    "Embedding response is missing index {} (found {})",
                    position,
                    data.index
                ));
            }
            if data.embedding.len() != self.dimension {
                return Err(anyhow!(
                    "Embedding {} has {} dimensions, expected {}",
                    position,
                    data.embedding.len(),
                    self.dimension
                ));
            }
            embeddings.push(data.embedding);
        }

        Ok(embeddings)
    }
}

impl Embedder for VoyageClient {
    #[inline]
    fn model(&self) -> &str {
        &self.model
    }

    #[inline]
    fn dimension(&self) -> usize {
        self.dimension
    }

    #[inline]
    fn embed(&self, texts: &[String], input_type: InputType) -> crate::Result<Vec<Vec<f32>>> {
        self.generate_embeddings(texts, input_type)
            .map_err(KnowledgeError::Embedding)
    }
}
