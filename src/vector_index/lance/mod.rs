
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, anyhow, bail};
use arrow::array::{
    Array, FixedSizeListArray, Float32Array, RecordBatchIterator, StringArray, UInt32Array,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use futures::TryStreamExt;
use itertools::Itertools;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{Connection, DistanceType, Table};
use serde_json::Value;
use tracing::{debug, info};

use super::{
    Condition, FIELD_CHUNK_INDEX, FIELD_FILE_ID, FIELD_ORGANIZATION_ID, IndexStats,
    IndexedVector, MetadataFilter, QueryMatch, VectorIndex, VectorMetadata,
};
use crate::config::Config;
use crate::{KnowledgeError, Result};

const ID_COLUMN: &str = "id";
const VECTOR_COLUMN: &str = "vector";
const DISTANCE_COLUMN: &str = "_distance";

/// Vector index stored in an embedded LanceDB table, searched by cosine distance
pub struct LanceIndex {
    connection: Connection,
    table_name: String,
    dimension: usize,
}

impl std::fmt::Debug for LanceIndex {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LanceIndex")
            .field("table_name", &self.table_name)
            .field("dimension", &self.dimension)
            .finish_non_exhaustive()
    }
}

impl LanceIndex {
    /// Open the index described by the configuration, creating it if needed
    #[inline]
    pub async fn from_config(config: &Config) -> Result<Self> {
        Self::open(
            &config.vector_database_path(),
            &config.vector_store.lancedb.table_name,
            config.embedding.dimension as usize,
        )
        .await
    }

    /// Open or create `table_name` under `path`.
    ///
    /// An existing table with a different vector dimension is an error; it is
    /// never dropped.
    #[inline]
    pub async fn open(path: &Path, table_name: &str, dimension: usize) -> Result<Self> {
        Self::open_inner(path, table_name, dimension)
            .await
            .map_err(KnowledgeError::VectorStore)
    }

    async fn open_inner(path: &Path, table_name: &str, dimension: usize) -> anyhow::Result<Self> {
        if dimension == 0 {
            bail!("Vector dimension must be positive");
        }

        debug!("Opening LanceDB at {:?}", path);
        std::fs::create_dir_all(path)
            .with_context(|| format!("Failed to create vector database directory {:?}", path))?;

        let connection = lancedb::connect(&path.to_string_lossy())
            .execute()
            .await
            .context("Failed to connect to LanceDB")?;

        let index = Self {
            connection,
            table_name: table_name.to_string(),
            dimension,
        };
        index.initialize_table().await?;

        info!(
            "LanceDB index ready: table {} with {} dimensions",
            index.table_name, index.dimension
        );
        Ok(index)
    }

    #[inline]
    pub const fn dimension(&self) -> usize {
        self.dimension
    }

    #[inline]
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    async fn initialize_table(&self) -> anyhow::Result<()> {
        let table_names = self
            .connection
            .table_names()
            .execute()
            .await
            .context("Failed to list tables")?;

        if table_names.contains(&self.table_name) {
            let existing = self.existing_dimension().await?;
            if existing != self.dimension {
                bail!(
                    "Table {} stores {}-dimensional vectors, expected {}",
                    self.table_name,
                    existing,
                    self.dimension
                );
            }
            return Ok(());
        }

        self.connection
            .create_empty_table(&self.table_name, schema(self.dimension)?)
            .execute()
            .await
            .with_context(|| format!("Failed to create table {}", self.table_name))?;

        info!("Created table {}", self.table_name);
        Ok(())
    }

    async fn existing_dimension(&self) -> anyhow::Result<usize> {
        let schema = self
            .table()
            .await?
            .schema()
            .await
            .context("Failed to read table schema")?;

        let field = schema
            .field_with_name(VECTOR_COLUMN)
            .context("Table has no vector column")?;

        match field.data_type() {
            DataType::FixedSizeList(_, size) => {
                usize::try_from(*size).context("Invalid vector column size")
            }
            other => Err(anyhow!("Unexpected vector column type {:?}", other)),
        }
    }

    async fn table(&self) -> anyhow::Result<Table> {
        self.connection
            .open_table(&self.table_name)
            .execute()
            .await
            .with_context(|| format!("Failed to open table {}", self.table_name))
    }

    fn check_dimension(&self, values: &[f32]) -> anyhow::Result<()> {
        if values.len() != self.dimension {
            bail!(
                "Vector has {} dimensions, index expects {}",
                values.len(),
                self.dimension
            );
        }
        Ok(())
    }

    fn record_batch(&self, vectors: &[&IndexedVector]) -> anyhow::Result<RecordBatch> {
        let len = vectors.len();
        let mut ids = Vec::with_capacity(len);
        let mut flat_values = Vec::with_capacity(len * self.dimension);
        let mut file_ids = Vec::with_capacity(len);
        let mut organization_ids = Vec::with_capacity(len);
        let mut chunk_indices = Vec::with_capacity(len);
        let mut contents = Vec::with_capacity(len);
        let mut token_counts = Vec::with_capacity(len);
        let mut indexed_ats = Vec::with_capacity(len);
        let mut extras = Vec::with_capacity(len);

        for vector in vectors {
            self.check_dimension(&vector.values)
                .with_context(|| format!("Cannot upsert vector {}", vector.id))?;

            let metadata = &vector.metadata;
            ids.push(vector.id.as_str());
            flat_values.extend_from_slice(&vector.values);
            file_ids.push(metadata.file_id.as_str());
            organization_ids.push(metadata.organization_id.as_str());
            chunk_indices.push(metadata.chunk_index);
            contents.push(metadata.content.as_deref());
            token_counts.push(metadata.token_count);
            indexed_ats.push(metadata.indexed_at.as_deref());
            extras.push(if metadata.extra.is_empty() {
                None
            } else {
                Some(serde_json::to_string(&metadata.extra).context("Failed to encode metadata")?)
            });
        }

        let item_field = Arc::new(Field::new("item", DataType::Float32, false));
        let vector_array = FixedSizeListArray::try_new(
            item_field,
            vector_size(self.dimension)?,
            Arc::new(Float32Array::from(flat_values)),
            None,
        )
        .context("Failed to create vector array")?;

        let arrays: Vec<Arc<dyn Array>> = vec![
            Arc::new(StringArray::from(ids)),
            Arc::new(vector_array),
            Arc::new(StringArray::from(file_ids)),
            Arc::new(StringArray::from(organization_ids)),
            Arc::new(UInt32Array::from(chunk_indices)),
            Arc::new(StringArray::from(contents)),
            Arc::new(UInt32Array::from(token_counts)),
            Arc::new(StringArray::from(indexed_ats)),
            Arc::new(StringArray::from(extras)),
        ];

        RecordBatch::try_new(schema(self.dimension)?, arrays)
            .context("Failed to create record batch")
    }

    async fn upsert_inner(&self, vectors: &[IndexedVector]) -> anyhow::Result<usize> {
        // the last occurrence of a repeated id wins, as with sequential upserts
        let unique: Vec<&IndexedVector> = vectors.iter().rev().unique_by(|v| v.id.clone()).collect();
        let record_batch = self.record_batch(&unique)?;
        let schema = record_batch.schema();
        let reader = RecordBatchIterator::new(std::iter::once(Ok(record_batch)), schema);

        let table = self.table().await?;
        let mut merge = table.merge_insert(&[ID_COLUMN]);
        merge
            .when_matched_update_all(None)
            .when_not_matched_insert_all();
        merge
            .execute(Box::new(reader))
            .await
            .context("Failed to merge vectors into table")?;

        Ok(unique.len())
    }

    async fn query_inner(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &MetadataFilter,
        include_metadata: bool,
    ) -> anyhow::Result<Vec<QueryMatch>> {
        self.check_dimension(vector)
            .context("Cannot query with vector")?;

        let table = self.table().await?;
        let mut query = table
            .vector_search(vector)
            .context("Failed to create vector search")?
            .column(VECTOR_COLUMN)
            .distance_type(DistanceType::Cosine)
            .limit(top_k);

        if let Some(predicate) = filter_predicate(filter)? {
            query = query.only_if(predicate);
        }

        let mut stream = query.execute().await.context("Failed to execute search")?;

        let mut matches = Vec::new();
        while let Some(batch) = stream
            .try_next()
            .await
            .context("Failed to read result stream")?
        {
            matches.extend(parse_matches(&batch, include_metadata)?);
        }

        matches.sort_by(|a, b| b.score.total_cmp(&a.score));
        matches.truncate(top_k);
        debug!("LanceDB query returned {} matches", matches.len());
        Ok(matches)
    }

    async fn delete_predicate(&self, predicate: &str) -> anyhow::Result<()> {
        self.table()
            .await?
            .delete(predicate)
            .await
            .with_context(|| format!("Failed to delete rows where {}", predicate))?;
        Ok(())
    }

    async fn stats_inner(&self) -> anyhow::Result<IndexStats> {
        let count = self
            .table()
            .await?
            .count_rows(None)
            .await
            .context("Failed to count rows")?;
        let count = count as u64;

        Ok(IndexStats {
            total_vector_count: count,
            dimension: Some(self.dimension),
            index_fullness: None,
            namespaces: BTreeMap::from([(self.table_name.clone(), count)]),
        })
    }
}

#[async_trait]
impl VectorIndex for LanceIndex {
    #[inline]
    async fn upsert(&self, vectors: &[IndexedVector]) -> Result<usize> {
        if vectors.is_empty() {
            return Ok(0);
        }

        let count = self
            .upsert_inner(vectors)
            .await
            .map_err(KnowledgeError::VectorStore)?;
        info!("Upserted {} vectors into {}", count, self.table_name);
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

        self.query_inner(vector, top_k, filter, include_metadata)
            .await
            .map_err(KnowledgeError::VectorStore)
    }

    #[inline]
    async fn delete_by_ids(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let predicate = format!(
            "{} IN ({})",
            ID_COLUMN,
            ids.iter().map(|id| sql_string(id)).join(", ")
        );
        self.delete_predicate(&predicate)
            .await
            .map_err(KnowledgeError::VectorStore)?;

        info!("Deleted {} vector ids from {}", ids.len(), self.table_name);
        Ok(())
    }

    #[inline]
    async fn delete_by_filter(&self, filter: &MetadataFilter) -> Result<()> {
        let predicate = filter_predicate(filter)
            .and_then(|predicate| {
                predicate.ok_or_else(|| anyhow!("Refusing to delete with an empty filter"))
            })
            .map_err(KnowledgeError::VectorStore)?;

        self.delete_predicate(&predicate)
            .await
            .map_err(KnowledgeError::VectorStore)?;

        info!("Deleted vectors from {} where {}", self.table_name, predicate);
        Ok(())
    }

    #[inline]
    async fn stats(&self) -> Result<IndexStats> {
        self.stats_inner().await.map_err(KnowledgeError::VectorStore)
    }
}

fn vector_size(dimension: usize) -> anyhow::Result<i32> {
    i32::try_from(dimension).context("Vector dimension too large")
}

fn schema(dimension: usize) -> anyhow::Result<Arc<Schema>> {
    Ok(Arc::new(Schema::new(vec![
        Field::new(ID_COLUMN, DataType::Utf8, false),
        Field::new(
            VECTOR_COLUMN,
            DataType::FixedSizeList(
                Arc::new(Field::new("item", DataType::Float32, false)),
                vector_size(dimension)?,
            ),
            false,
        ),
        Field::new(FIELD_FILE_ID, DataType::Utf8, false),
        Field::new(FIELD_ORGANIZATION_ID, DataType::Utf8, false),
        Field::new(FIELD_CHUNK_INDEX, DataType::UInt32, false),
        Field::new("content", DataType::Utf8, true),
        Field::new("token_count", DataType::UInt32, true),
        Field::new("indexed_at", DataType::Utf8, true),
        Field::new("extra", DataType::Utf8, true),
    ])))
}

/// Quote a string literal for a LanceDB SQL predicate
fn sql_string(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn sql_literal(field: &str, value: &Value) -> anyhow::Result<String> {
    match (field, value) {
        (FIELD_FILE_ID | FIELD_ORGANIZATION_ID, Value::String(s)) => Ok(sql_string(s)),
        (FIELD_CHUNK_INDEX, Value::Number(n)) => n
            .as_u64()
            .map(|n| n.to_string())
            .ok_or_else(|| anyhow!("chunk_index filter must be a whole number, got {}", n)),
        _ => Err(anyhow!("Unsupported filter value {} for field {}", value, field)),
    }
}

/// Translate a filter into a SQL predicate; `None` for an empty filter
fn filter_predicate(filter: &MetadataFilter) -> anyhow::Result<Option<String>> {
    if filter.is_empty() {
        return Ok(None);
    }

    let clauses = filter
        .conditions()
        .map(|(field, condition)| {
            if ![FIELD_FILE_ID, FIELD_ORGANIZATION_ID, FIELD_CHUNK_INDEX].contains(&field) {
                bail!("Filtering on field {} is not supported by LanceDB", field);
            }

            match condition {
                Condition::Eq(value) => Ok(format!("{} = {}", field, sql_literal(field, value)?)),
                Condition::In(values) if values.is_empty() => Ok("FALSE".to_string()),
                Condition::In(values) => {
                    let literals: Vec<String> = values
                        .iter()
                        .map(|value| sql_literal(field, value))
                        .collect::<anyhow::Result<_>>()?;
                    Ok(format!("{} IN ({})", field, literals.join(", ")))
                }
            }
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(Some(clauses.join(" AND ")))
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> anyhow::Result<&'a T> {
    batch
        .column_by_name(name)
        .with_context(|| format!("Missing {} column", name))?
        .as_any()
        .downcast_ref::<T>()
        .with_context(|| format!("Invalid {} column type", name))
}

fn optional_string(array: &StringArray, row: usize) -> Option<String> {
    (!array.is_null(row)).then(|| array.value(row).to_string())
}

fn parse_matches(batch: &RecordBatch, include_metadata: bool) -> anyhow::Result<Vec<QueryMatch>> {
    let ids = column::<StringArray>(batch, ID_COLUMN)?;
    let distances = column::<Float32Array>(batch, DISTANCE_COLUMN)?;
    let file_ids = column::<StringArray>(batch, FIELD_FILE_ID)?;
    let organization_ids = column::<StringArray>(batch, FIELD_ORGANIZATION_ID)?;
    let chunk_indices = column::<UInt32Array>(batch, FIELD_CHUNK_INDEX)?;
    let contents = column::<StringArray>(batch, "content")?;
    let token_counts = column::<UInt32Array>(batch, "token_count")?;
    let indexed_ats = column::<StringArray>(batch, "indexed_at")?;
    let extras = column::<StringArray>(batch, "extra")?;

    let mut matches = Vec::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        let metadata = if include_metadata {
            let extra = match optional_string(extras, row) {
                Some(json) => serde_json::from_str(&json).context("Invalid stored metadata")?,
                None => BTreeMap::new(),
            };
            Some(VectorMetadata {
                file_id: file_ids.value(row).to_string(),
                organization_id: organization_ids.value(row).to_string(),
                chunk_index: chunk_indices.value(row),
                content: optional_string(contents, row),
                token_count: (!token_counts.is_null(row)).then(|| token_counts.value(row)),
                indexed_at: optional_string(indexed_ats, row),
                extra,
            })
        } else {
            None
        };

        let distance = if distances.is_null(row) {
            0.0
        } else {
            distances.value(row)
        };

        matches.push(QueryMatch {
            id: ids.value(row).to_string(),
            score: 1.0 - distance,
            metadata,
        });
    }

    Ok(matches)
}
