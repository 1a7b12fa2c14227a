//! Memory Ingestion Pipeline
//!
//! Persists a turn durably first, then embeds and indexes it. The durable
//! write is the acknowledgement; indexing failures only leave the record
//! `failed` for the repair sweep.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::{EngramError, Result};
use crate::inference::{InferenceClient, RetryPolicy};
use crate::memory::types::{EmbeddingStatus, MemoryRecord, Speaker};
use crate::storage::{DurableStore, VectorEntry, VectorIndex};

/// Embed-then-index step shared by ingestion, repair and compaction.
pub struct Indexer {
    store: Arc<dyn DurableStore>,
    index: Arc<dyn VectorIndex>,
    inference: Arc<InferenceClient>,
}

impl Indexer {
    pub fn new(
        store: Arc<dyn DurableStore>,
        index: Arc<dyn VectorIndex>,
        inference: Arc<InferenceClient>,
    ) -> Self {
        Self {
            store,
            index,
            inference,
        }
    }

    /// Embed `record`, upsert its vector and record the outcome.
    ///
    /// Returns the status now stored for the record. Never rolls back the
    /// durable record; a failure here only sets `failed`.
    pub async fn index_record(&self, record: &MemoryRecord) -> EmbeddingStatus {
        let status = match self.embed_and_upsert(record).await {
            Ok(()) => EmbeddingStatus::Indexed,
            Err(e) => {
                warn!("Indexing {} ({}) failed: {e}", record.id, record.kind);
                EmbeddingStatus::Failed
            }
        };

        match self.store.set_embedding_status(record.id, status).await {
            Ok(true) => status,
            Ok(false) => {
                warn!("Record {} vanished before its status could be set", record.id);
                EmbeddingStatus::Failed
            }
            Err(e) => {
                // Row may lag the index here; the repair sweep reconciles it.
                warn!("Failed to record embedding status for {}: {e}", record.id);
                record.embedding_status
            }
        }
    }

    async fn embed_and_upsert(&self, record: &MemoryRecord) -> Result<()> {
        let vector = self.inference.embed(&record.content).await?;
        self.index
            .upsert(VectorEntry {
                id: record.id,
                conversation_id: record.conversation_id.clone(),
                vector,
            })
            .await?;
        debug!("Indexed {} in conversation {}", record.id, record.conversation_id);
        Ok(())
    }
}

/// Pipeline for ingesting conversation turns.
///
/// 1. Reject empty content
/// 2. Persist the turn as `pending` (retried on transient store errors)
/// 3. Embed and index it through the shared `Indexer`
pub struct IngestionPipeline {
    store: Arc<dyn DurableStore>,
    indexer: Arc<Indexer>,
    store_policy: RetryPolicy,
}

impl IngestionPipeline {
    pub fn new(store: Arc<dyn DurableStore>, indexer: Arc<Indexer>, store_policy: RetryPolicy) -> Self {
        Self {
            store,
            indexer,
            store_policy,
        }
    }

    /// Ingest one conversation turn.
    ///
    /// Returns the record as stored, with its final embedding status. Content
    /// is stored byte-for-byte; only the emptiness check looks at it trimmed.
    ///
    /// # Errors
    /// - `InvalidInput` for an empty conversation id or whitespace-only text
    /// - `Fatal` if the durable store stays unavailable after retries
    pub async fn ingest(
        &self,
        conversation_id: &str,
        speaker: Speaker,
        text: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<MemoryRecord> {
        if conversation_id.trim().is_empty() {
            return Err(EngramError::InvalidInput("conversation_id must not be empty".to_string()));
        }
        if text.trim().is_empty() {
            return Err(EngramError::InvalidInput("turn text must not be empty".to_string()));
        }

        let mut record = MemoryRecord::turn(conversation_id, speaker, text, timestamp);
        self.persist(&record).await?;
        debug!("Persisted turn {} for conversation {}", record.id, conversation_id);

        record.embedding_status = self.indexer.index_record(&record).await;
        Ok(record)
    }

    async fn persist(&self, record: &MemoryRecord) -> Result<()> {
        let outcome = self
            .store_policy
            .run("persist turn", || async move {
                match self.store.insert(record).await {
                    // An earlier attempt may have committed before reporting failure
                    Err(EngramError::ConsistencyConflict(msg)) => match self.store.get(record.id).await? {
                        Some(existing) if existing.content == record.content => Ok(()),
                        _ => Err(EngramError::ConsistencyConflict(msg)),
                    },
                    other => other,
                }
            })
            .await;

        match outcome {
            Err(e) if e.is_transient() => Err(EngramError::Fatal(format!(
                "durable store unavailable, turn not stored: {e}"
            ))),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{InMemoryIndex, InMemoryStore};
    use crate::testing::{EchoSummarizer, FaultyIndex, MockEmbedder, MockFailure};
    use std::time::Duration;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(100), 0, Duration::from_millis(1))
    }

    fn pipeline(
        store: Arc<InMemoryStore>,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<MockEmbedder>,
    ) -> IngestionPipeline {
        let inference = InferenceClient::new(embedder, Arc::new(EchoSummarizer::new()), policy(), policy());
        let indexer = Arc::new(Indexer::new(store.clone(), index, Arc::new(inference)));
        IngestionPipeline::new(store, indexer, policy())
    }

    #[tokio::test]
    async fn test_ingest_indexes_turn() {
        let store = Arc::new(InMemoryStore::new());
        let index = Arc::new(InMemoryIndex::new());
        let pipeline = pipeline(store.clone(), index.clone(), Arc::new(MockEmbedder::new(16)));

        let record = pipeline
            .ingest("c1", Speaker::User, "I like tea", Utc::now())
            .await
            .unwrap();

        assert_eq!(record.embedding_status, EmbeddingStatus::Indexed);
        assert!(index.contains(record.id).await.unwrap());
        let stored = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.embedding_status, EmbeddingStatus::Indexed);
    }

    #[tokio::test]
    async fn test_rejects_empty_text_before_writing() {
        let store = Arc::new(InMemoryStore::new());
        let pipeline = pipeline(store.clone(), Arc::new(InMemoryIndex::new()), Arc::new(MockEmbedder::new(16)));

        let err = pipeline.ingest("c1", Speaker::User, "  \n\t", Utc::now()).await.unwrap_err();
        assert!(matches!(err, EngramError::InvalidInput(_)));
        assert_eq!(store.stats().await.unwrap().total, 0);

        let err = pipeline.ingest(" ", Speaker::User, "hi", Utc::now()).await.unwrap_err();
        assert!(matches!(err, EngramError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_embedding_failure_keeps_record_durable() {
        let store = Arc::new(InMemoryStore::new());
        let embedder = Arc::new(MockEmbedder::new(16));
        embedder.set_failure(Some(MockFailure::Hang));
        let pipeline = pipeline(store.clone(), Arc::new(InMemoryIndex::new()), embedder);

        let record = pipeline
            .ingest("c1", Speaker::User, "I work remotely", Utc::now())
            .await
            .unwrap();

        assert_eq!(record.embedding_status, EmbeddingStatus::Failed);
        let stored = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.content, "I work remotely");
        assert_eq!(stored.embedding_status, EmbeddingStatus::Failed);
    }

    #[tokio::test]
    async fn test_index_failure_marks_failed() {
        let store = Arc::new(InMemoryStore::new());
        let index = Arc::new(FaultyIndex::new());
        index.set_fail_upserts(true);
        let pipeline = pipeline(store.clone(), index.clone(), Arc::new(MockEmbedder::new(16)));

        let record = pipeline.ingest("c1", Speaker::User, "hello", Utc::now()).await.unwrap();

        assert_eq!(record.embedding_status, EmbeddingStatus::Failed);
        assert_eq!(index.count().await.unwrap(), 0);
    }
}
