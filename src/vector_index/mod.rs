// Vector index module
// Storage and similarity search for chunk embeddings


pub mod lance;
pub mod pinecone;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::Result;
use crate::embeddings::chunking::Chunk;

pub use lance::LanceIndex;
pub use pinecone::PineconeIndex;

pub const FIELD_FILE_ID: &str = "file_id";
pub const FIELD_ORGANIZATION_ID: &str = "organization_id";
pub const FIELD_CHUNK_INDEX: &str = "chunk_index";

/// Id of the vector holding a chunk of a file
#[inline]
pub fn vector_id(file_id: &str, chunk_index: usize) -> String {
    format!("{}:{}", file_id, chunk_index)
}

/// Metadata stored alongside each vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorMetadata {
    pub file_id: String,
    pub organization_id: String,
    #[serde(deserialize_with = "deserialize_whole_number")]
    pub chunk_index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_optional_whole_number"
    )]
    pub token_count: Option<u32>,
    /// RFC 3339 timestamp of the ingestion that wrote this vector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexed_at: Option<String>,
    /// Further scoping fields such as `deal_id` or `uploaded_by`
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// A vector ready to be written to an index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedVector {
    pub id: String,
    pub values: Vec<f32>,
    pub metadata: VectorMetadata,
}

impl IndexedVector {
    /// Build the vector for one chunk of a file, with id `<file_id>:<chunk_index>`
    #[inline]
    pub fn for_chunk(
        file_id: &str,
        organization_id: &str,
        chunk: &Chunk,
        values: Vec<f32>,
    ) -> Result<Self> {
        let chunk_index = u32::try_from(chunk.chunk_index).map_err(|_| {
            crate::KnowledgeError::Other(anyhow::anyhow!(
                "Chunk index {} does not fit in metadata",
                chunk.chunk_index
            ))
        })?;

        Ok(Self {
            id: vector_id(file_id, chunk.chunk_index),
            values,
            metadata: VectorMetadata {
                file_id: file_id.to_string(),
                organization_id: organization_id.to_string(),
                chunk_index,
                content: Some(chunk.content.clone()),
                token_count: u32::try_from(chunk.token_count).ok(),
                indexed_at: Some(chrono::Utc::now().to_rfc3339()),
                extra: BTreeMap::new(),
            },
        })
    }

    #[inline]
    pub fn with_extra(mut self, extra: BTreeMap<String, Value>) -> Self {
        self.metadata.extra = extra;
        self
    }
}

/// A single field condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Condition {
    #[serde(rename = "$eq")]
    Eq(Value),
    #[serde(rename = "$in")]
    In(Vec<Value>),
}

/// Conjunction of field conditions; serializes to the Pinecone filter language.
///
/// An empty filter matches every vector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataFilter {
    conditions: BTreeMap<String, Condition>,
}

impl MetadataFilter {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn for_file(file_id: &str) -> Self {
        Self::new().eq(FIELD_FILE_ID, file_id)
    }

    #[inline]
    pub fn for_organization(organization_id: &str) -> Self {
        Self::new().eq(FIELD_ORGANIZATION_ID, organization_id)
    }

    /// Require `field == value`, replacing any earlier condition on `field`
    #[inline]
    pub fn eq<V: Into<Value>>(mut self, field: &str, value: V) -> Self {
        self.conditions
            .insert(field.to_string(), Condition::Eq(value.into()));
        self
    }

    /// Require `field` to be one of `values`, replacing any earlier condition on `field`
    #[inline]
    pub fn is_in<I, V>(mut self, field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.conditions.insert(
            field.to_string(),
            Condition::In(values.into_iter().map(Into::into).collect()),
        );
        self
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    #[inline]
    pub fn conditions(&self) -> impl Iterator<Item = (&str, &Condition)> {
        self.conditions
            .iter()
            .map(|(field, condition)| (field.as_str(), condition))
    }
}

/// A nearest-neighbour result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryMatch {
    pub id: String,
    pub score: f32,
    #[serde(default)]
    pub metadata: Option<VectorMetadata>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexStats {
    pub total_vector_count: u64,
    pub dimension: Option<usize>,
    pub index_fullness: Option<f32>,
    /// Vector count per namespace
    pub namespaces: BTreeMap<String, u64>,
}

/// A store of id-keyed vectors with metadata-filtered similarity search.
///
/// Tenant isolation is not implicit: callers pass `organization_id` filters.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or overwrite vectors by id, returning how many were written
    async fn upsert(&self, vectors: &[IndexedVector]) -> Result<usize>;

    /// Up to `top_k` matches ordered by descending score
    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &MetadataFilter,
        include_metadata: bool,
    ) -> Result<Vec<QueryMatch>>;

    /// Delete vectors by id; unknown ids are not an error
    async fn delete_by_ids(&self, ids: &[String]) -> Result<()>;

    /// Delete every vector matching a non-empty filter
    async fn delete_by_filter(&self, filter: &MetadataFilter) -> Result<()>;

    async fn delete_by_file(&self, file_id: &str) -> Result<()> {
        self.delete_by_filter(&MetadataFilter::for_file(file_id))
            .await
    }

    async fn stats(&self) -> Result<IndexStats>;
}

fn whole_number_from_value(value: &Value) -> Option<u32> {
    let number = value.as_u64().or_else(|| {
        value
            .as_f64()
            .filter(|f| f.fract() == 0.0 && *f >= 0.0 && *f <= f64::from(u32::MAX))
            .map(|f| f as u64)
    })?;
    u32::try_from(number).ok()
}

// Pinecone stores every number as a float and may return `3.0` for `3`
fn deserialize_whole_number<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    whole_number_from_value(&value)
        .ok_or_else(|| serde::de::Error::custom(format!("expected a whole number, got {}", value)))
}

fn deserialize_optional_whole_number<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(value) => whole_number_from_value(&value).map(Some).ok_or_else(|| {
            serde::de::Error::custom(format!("expected a whole number, got {}", value))
        }),
    }
}
