//! Consumer-facing memory service
//!
//! Wires the ingestion, compaction, repair and retrieval engines over one
//! durable store, one vector index and one inference client. Every component
//! receives its dependencies here; there is no global state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{EngramError, Result};
use crate::inference::{InferenceClient, InferenceHealth, RetryPolicy};
use crate::memory::{
    CompactionEngine, CompactionReport, ConsistencyReport, Indexer, IngestionPipeline, MemoryRecord,
    RepairReport, RepairSweep, RetrievalEngine, RetrievedMemory, Speaker,
};
use crate::storage::{
    DurableStore, LanceIndex, RecordQuery, SortOrder, SqliteStore, StoreStats, VectorIndex,
};

/// Store, index and inference health in one view
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub records: StoreStats,
    pub vectors: usize,
    pub inference: InferenceHealth,
}

pub struct MemoryService {
    store: Arc<dyn DurableStore>,
    index: Arc<dyn VectorIndex>,
    inference: Arc<InferenceClient>,
    ingestion: IngestionPipeline,
    compaction: CompactionEngine,
    repair: RepairSweep,
    retrieval: RetrievalEngine,
    compaction_trigger: Option<mpsc::Sender<String>>,
    config: Config,
}

impl MemoryService {
    pub fn new(
        store: Arc<dyn DurableStore>,
        index: Arc<dyn VectorIndex>,
        inference: Arc<InferenceClient>,
        config: Config,
    ) -> Self {
        let indexer = Arc::new(Indexer::new(store.clone(), index.clone(), inference.clone()));

        let ingestion = IngestionPipeline::new(
            store.clone(),
            indexer.clone(),
            RetryPolicy::embedding(&config.inference),
        );
        let compaction = CompactionEngine::new(
            store.clone(),
            inference.clone(),
            indexer.clone(),
            config.compaction.clone(),
        );
        let repair = RepairSweep::new(store.clone(), index.clone(), indexer, config.ingestion.clone());
        let retrieval = RetrievalEngine::new(
            store.clone(),
            index.clone(),
            inference.clone(),
            config.retrieval.clone(),
        );

        Self {
            store,
            index,
            inference,
            ingestion,
            compaction,
            repair,
            retrieval,
            compaction_trigger: None,
            config,
        }
    }

    /// Open the SQLite store and LanceDB index under `storage.data_dir` and
    /// connect the configured inference backends.
    pub async fn open(config: Config) -> Result<Self> {
        let data_dir = &config.storage.data_dir;
        info!("Initializing storage at: {}", data_dir.display());
        std::fs::create_dir_all(data_dir).map_err(|e| {
            EngramError::Fatal(format!(
                "Failed to create data directory {}: {e}",
                data_dir.display()
            ))
        })?;

        let store = SqliteStore::open(&config.storage.database_path())?;
        let index = LanceIndex::open(
            &config.storage.index_path(),
            &config.storage.vector_table,
            config.inference.embedding_dimension,
        )
        .await?;
        let inference = InferenceClient::from_config(&config.inference)?;

        Ok(Self::new(Arc::new(store), Arc::new(index), Arc::new(inference), config))
    }

    /// Send conversation ids over `sender` whenever they pass the turn threshold
    pub fn with_compaction_trigger(mut self, sender: mpsc::Sender<String>) -> Self {
        self.compaction_trigger = Some(sender);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    pub fn compaction(&self) -> &CompactionEngine {
        &self.compaction
    }

    /// Store a conversation turn. `timestamp` defaults to now.
    pub async fn ingest(
        &self,
        conversation_id: &str,
        speaker: Speaker,
        text: &str,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<MemoryRecord> {
        let record = self
            .ingestion
            .ingest(conversation_id, speaker, text, timestamp.unwrap_or_else(Utc::now))
            .await?;
        self.maybe_trigger_compaction(conversation_id).await;
        Ok(record)
    }

    async fn maybe_trigger_compaction(&self, conversation_id: &str) {
        let Some(ref sender) = self.compaction_trigger else {
            return;
        };
        if !self.config.compaction.enabled {
            return;
        }

        let live = match self.store.count(&RecordQuery::live_turns(conversation_id)).await {
            Ok(n) => n,
            Err(e) => {
                warn!("Could not count turns of {conversation_id}: {e}");
                return;
            }
        };
        if live <= self.config.compaction.turn_threshold {
            return;
        }

        match sender.try_send(conversation_id.to_string()) {
            Ok(()) => debug!("Conversation {conversation_id} has {live} live turns, compaction requested"),
            // A full queue already has work pending; the scheduled cycle catches the rest
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("Compaction queue full, not queueing {conversation_id}")
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Compaction worker has stopped, not queueing {conversation_id}")
            }
        }
    }

    /// Retrieve relevant memories; `None` falls back to the configured defaults
    pub async fn retrieve(
        &self,
        conversation_id: &str,
        query: &str,
        k: Option<usize>,
        token_budget: Option<usize>,
    ) -> Result<Vec<RetrievedMemory>> {
        let k = k.unwrap_or(self.config.retrieval.default_k);
        let budget = token_budget.unwrap_or(self.config.retrieval.default_token_budget);
        self.retrieval.retrieve(conversation_id, query, k, budget).await
    }

    /// Direct lookup by id, evicted records included
    pub async fn get(&self, id: Uuid) -> Result<Option<MemoryRecord>> {
        self.store.get(id).await
    }

    /// The newest `limit` live turns, oldest first
    pub async fn recent_turns(&self, conversation_id: &str, limit: usize) -> Result<Vec<MemoryRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut turns = self
            .store
            .query(
                &RecordQuery::live_turns(conversation_id)
                    .order(SortOrder::NewestFirst)
                    .paginate(limit, 0),
            )
            .await?;
        turns.reverse();
        Ok(turns)
    }

    pub async fn list(&self, query: &RecordQuery) -> Result<Vec<MemoryRecord>> {
        self.store.query(query).await
    }

    pub async fn stats(&self) -> Result<ServiceStats> {
        Ok(ServiceStats {
            records: self.store.stats().await?,
            vectors: self.index.count().await?,
            inference: self.inference.health().await,
        })
    }

    /// Run one compaction cycle over every conversation
    pub async fn compact_all(&self) -> Result<CompactionReport> {
        self.compaction.run_cycle().await
    }

    pub async fn compact_conversation(&self, conversation_id: &str) -> Result<CompactionReport> {
        self.compaction.compact_conversation(conversation_id).await
    }

    pub async fn repair(&self) -> Result<RepairReport> {
        self.repair.run().await
    }

    pub async fn verify_consistency(&self, sample_size: usize) -> Result<ConsistencyReport> {
        self.repair.verify_consistency(sample_size).await
    }

    /// Set or clear a record's review flag; `NotFound` if the id is unknown
    pub async fn set_review_flag(&self, id: Uuid, flagged: bool) -> Result<()> {
        if self.store.set_review_flag(id, flagged).await? {
            Ok(())
        } else {
            Err(EngramError::NotFound(format!("memory {id}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::EmbeddingStatus;
    use crate::testing::TestHarness;

    #[tokio::test]
    async fn test_recent_turns_are_chronological() {
        let h = TestHarness::new(TestHarness::compacting_config(100));
        let base = Utc::now() - chrono::Duration::minutes(10);
        for (i, text) in ["one", "two", "three"].iter().enumerate() {
            h.service
                .ingest("c1", Speaker::User, text, Some(base + chrono::Duration::minutes(i as i64)))
                .await
                .unwrap();
        }

        let recent = h.service.recent_turns("c1", 2).await.unwrap();
        let contents: Vec<&str> = recent.iter().map(|r| r.content.as_str()).collect();
        assert_eq!(contents, vec!["two", "three"]);
        assert!(h.service.recent_turns("c1", 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_threshold_sends_trigger() {
        let (tx, mut rx) = mpsc::channel(4);
        let h = TestHarness::new(TestHarness::compacting_config(2));
        let service = h.service.with_compaction_trigger(tx);

        service.ingest("c1", Speaker::User, "a", None).await.unwrap();
        service.ingest("c1", Speaker::User, "b", None).await.unwrap();
        assert!(rx.try_recv().is_err());

        service.ingest("c1", Speaker::User, "c", None).await.unwrap();
        assert_eq!(rx.try_recv().unwrap(), "c1");
    }

    #[tokio::test]
    async fn test_stats_counts_records_and_vectors() {
        let h = TestHarness::new(TestHarness::compacting_config(100));
        let record = h.service.ingest("c1", Speaker::User, "hello", None).await.unwrap();
        assert_eq!(record.embedding_status, EmbeddingStatus::Indexed);

        let stats = h.service.stats().await.unwrap();
        assert_eq!(stats.records.total, 1);
        assert_eq!(stats.records.indexed, 1);
        assert_eq!(stats.vectors, 1);
        assert_eq!(stats.inference.embedder, "mock");
    }

    #[tokio::test]
    async fn test_review_flag_on_unknown_id() {
        let h = TestHarness::new(TestHarness::compacting_config(100));
        let err = h.service.set_review_flag(Uuid::new_v4(), false).await.unwrap_err();
        assert!(matches!(err, EngramError::NotFound(_)));
    }
}
