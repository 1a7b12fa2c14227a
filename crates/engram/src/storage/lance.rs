use std::path::Path;
use std::sync::Arc;

use arrow_array::types::Float32Type;
use arrow_array::{Array, FixedSizeListArray, Float32Array, RecordBatch, RecordBatchIterator, StringArray};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{DistanceType, Table};
use uuid::Uuid;

use crate::error::{EngramError, Result};
use crate::storage::filter::{VectorFilter, escape_literal};
use crate::storage::{ScoredId, VectorEntry, VectorIndex};

const DISTANCE_COLUMN: &str = "_distance";

/// LanceDB-backed vector index. Rows carry only the id, the conversation
/// used for scoping, and the vector; content lives in the durable store.
pub struct LanceIndex {
    table: Table,
    dimension: i32,
}

impl std::fmt::Debug for LanceIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LanceIndex")
            .field("dimension", &self.dimension)
            .finish_non_exhaustive()
    }
}

impl LanceIndex {
    /// Connect to the database at `path`, creating `table_name` if it does not exist.
    pub async fn open(path: &Path, table_name: &str, dimension: usize) -> Result<Self> {
        let uri = path
            .to_str()
            .ok_or_else(|| EngramError::Config("Invalid index path encoding".to_string()))?;
        let dimension = i32::try_from(dimension)
            .map_err(|_| EngramError::Config(format!("Embedding dimension {dimension} too large")))?;

        let connection = lancedb::connect(uri)
            .execute()
            .await
            .map_err(|e| EngramError::Fatal(format!("Failed to connect to LanceDB: {e}")))?;

        let names = connection
            .table_names()
            .execute()
            .await
            .map_err(|e| EngramError::Storage(format!("Failed to list tables: {e}")))?;

        let table = if names.iter().any(|n| n == table_name) {
            tracing::debug!("Opening existing vector table {table_name}");
            connection
                .open_table(table_name)
                .execute()
                .await
                .map_err(|e| EngramError::Storage(format!("Failed to open vector table: {e}")))?
        } else {
            tracing::info!("Creating vector table {table_name} ({dimension} dimensions)");
            let schema = Self::schema(dimension);
            let batch = Self::entries_to_batch(&[], schema.clone(), dimension)?;
            let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);
            connection
                .create_table(table_name, Box::new(batches))
                .execute()
                .await
                .map_err(|e| EngramError::Storage(format!("Failed to create vector table: {e}")))?
        };

        Ok(Self { table, dimension })
    }

    fn schema(dimension: i32) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("conversation_id", DataType::Utf8, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    dimension,
                ),
                false,
            ),
        ]))
    }

    fn entries_to_batch(
        entries: &[VectorEntry],
        schema: Arc<Schema>,
        dimension: i32,
    ) -> Result<RecordBatch> {
        let ids: Vec<String> = entries.iter().map(|e| e.id.to_string()).collect();
        let conversations: Vec<&str> = entries.iter().map(|e| e.conversation_id.as_str()).collect();
        let vectors: Vec<Option<Vec<Option<f32>>>> = entries
            .iter()
            .map(|e| Some(e.vector.iter().copied().map(Some).collect()))
            .collect();

        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(ids)),
                Arc::new(StringArray::from(conversations)),
                Arc::new(FixedSizeListArray::from_iter_primitive::<Float32Type, _, _>(
                    vectors, dimension,
                )),
            ],
        )
        .map_err(|e| EngramError::Storage(format!("Failed to build vector batch: {e}")))
    }

    fn id_predicate(id: Uuid) -> String {
        format!("id = '{}'", escape_literal(&id.to_string()))
    }
}

#[async_trait]
impl VectorIndex for LanceIndex {
    async fn upsert(&self, entry: VectorEntry) -> Result<()> {
        if entry.vector.len() != self.dimension as usize {
            return Err(EngramError::InvalidInput(format!(
                "vector for {} has {} dimensions, index expects {}",
                entry.id,
                entry.vector.len(),
                self.dimension
            )));
        }

        let schema = Self::schema(self.dimension);
        let batch = Self::entries_to_batch(std::slice::from_ref(&entry), schema.clone(), self.dimension)?;
        let reader = RecordBatchIterator::new(vec![Ok(batch)], schema);

        let mut merge = self.table.merge_insert(&["id"]);
        merge.when_matched_update_all(None).when_not_matched_insert_all();
        merge
            .execute(Box::new(reader))
            .await
            .map_err(|e| EngramError::TransientInfra(format!("Failed to upsert vector: {e}")))?;

        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: &VectorFilter,
    ) -> Result<Vec<ScoredId>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut query = self
            .table
            .query()
            .nearest_to(vector)
            .map_err(|e| EngramError::Storage(format!("Failed to create vector query: {e}")))?
            .distance_type(DistanceType::Cosine)
            .limit(k);

        if let Some(sql_filter) = filter.to_sql_clause() {
            query = query.only_if(sql_filter);
        }

        let stream = query
            .execute()
            .await
            .map_err(|e| EngramError::TransientInfra(format!("Failed to execute vector query: {e}")))?;

        let batches: Vec<RecordBatch> = stream
            .try_collect()
            .await
            .map_err(|e| EngramError::TransientInfra(format!("Failed to collect results: {e}")))?;

        let mut hits = Vec::new();
        for batch in &batches {
            let ids = batch
                .column_by_name("id")
                .and_then(|c| c.as_any().downcast_ref::<StringArray>())
                .ok_or_else(|| EngramError::Storage("Missing id column".to_string()))?;
            let distances = batch
                .column_by_name(DISTANCE_COLUMN)
                .and_then(|c| c.as_any().downcast_ref::<Float32Array>())
                .ok_or_else(|| EngramError::Storage("Missing distance column".to_string()))?;

            for row in 0..batch.num_rows() {
                let id = ids
                    .value(row)
                    .parse::<Uuid>()
                    .map_err(|e| EngramError::Storage(format!("Invalid UUID in index: {e}")))?;
                let similarity = if distances.is_null(row) {
                    0.0
                } else {
                    1.0 - distances.value(row)
                };
                hits.push(ScoredId { id, similarity });
            }
        }

        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(k);
        Ok(hits)
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        if !self.contains(id).await? {
            return Ok(false);
        }

        self.table
            .delete(&Self::id_predicate(id))
            .await
            .map_err(|e| EngramError::TransientInfra(format!("Failed to delete vector: {e}")))?;

        Ok(true)
    }

    async fn contains(&self, id: Uuid) -> Result<bool> {
        let count = self
            .table
            .count_rows(Some(Self::id_predicate(id)))
            .await
            .map_err(|e| EngramError::TransientInfra(format!("Failed to count rows: {e}")))?;
        Ok(count > 0)
    }

    async fn count(&self) -> Result<usize> {
        self.table
            .count_rows(None)
            .await
            .map_err(|e| EngramError::TransientInfra(format!("Failed to count rows: {e}")))
    }
}
