//! End-to-end scenarios over the on-disk backends
//!
//! A `MemoryService` over a SQLite file and a LanceDB table in a temporary
//! directory, with deterministic inference. Covers the turn lifecycle from
//! ingestion through compaction, retrieval, inference outages and restarts.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use engram::config::Config;
use engram::inference::{InferenceClient, RetryPolicy};
use engram::memory::{EmbeddingStatus, MemoryKind, Speaker};
use engram::storage::{EvictionState, LanceIndex, RecordQuery, SqliteStore};
use engram::testing::{EchoSummarizer, MockEmbedder, MockFailure, TEST_DIMENSION, TestHarness};
use engram::MemoryService;
use tempfile::tempdir;

const TURNS: [&str; 5] = ["hello", "I like tea", "my name is Ana", "I work remotely", "goodbye"];

struct Fixture {
    service: MemoryService,
    embedder: Arc<MockEmbedder>,
    summarizer: Arc<EchoSummarizer>,
}

/// Test helper: open the service over `dir` with the compacting test config
async fn open_service(dir: &Path, turn_threshold: usize) -> Fixture {
    let mut config: Config = TestHarness::compacting_config(turn_threshold);
    config.storage.data_dir = dir.to_path_buf();

    let store = SqliteStore::open(&config.storage.database_path()).unwrap();
    let index = LanceIndex::open(
        &config.storage.index_path(),
        &config.storage.vector_table,
        TEST_DIMENSION,
    )
    .await
    .unwrap();

    let embedder = Arc::new(MockEmbedder::new(TEST_DIMENSION));
    let summarizer = Arc::new(EchoSummarizer::new());
    let policy = RetryPolicy::new(Duration::from_millis(200), 1, Duration::from_millis(1));
    let inference = InferenceClient::new(embedder.clone(), summarizer.clone(), policy.clone(), policy)
        .with_dimension(TEST_DIMENSION);

    Fixture {
        service: MemoryService::new(Arc::new(store), Arc::new(index), Arc::new(inference), config),
        embedder,
        summarizer,
    }
}

async fn ingest_all(service: &MemoryService, conversation_id: &str, turns: &[&str]) -> Vec<uuid::Uuid> {
    let mut ids = Vec::new();
    for text in turns {
        let record = service
            .ingest(conversation_id, Speaker::User, text, None)
            .await
            .unwrap();
        ids.push(record.id);
    }
    ids
}

mod lifecycle_tests {
    use super::*;

    #[tokio::test]
    async fn test_five_turns_compact_into_one_summary() {
        let dir = tempdir().unwrap();
        let f = open_service(dir.path(), 3).await;
        let ids = ingest_all(&f.service, "C", &TURNS).await;

        let report = f.service.compact_conversation("C").await.unwrap();
        assert_eq!(report.summaries_created, 1);
        assert_eq!(report.turns_evicted, 5);
        assert_eq!(f.summarizer.calls(), 1);

        let summaries = f
            .service
            .list(&RecordQuery::new().in_conversation("C").with_kinds(vec![MemoryKind::Summary]))
            .await
            .unwrap();
        assert_eq!(summaries.len(), 1);
        let summary = &summaries[0];
        assert_eq!(summary.source_ids, ids);
        assert_eq!(summary.embedding_status, EmbeddingStatus::Indexed);

        for id in &ids {
            let turn = f.service.get(*id).await.unwrap().expect("evicted turns stay readable");
            assert_eq!(turn.eviction.map(|m| m.superseded_by), Some(summary.id));
        }

        let results = f
            .service
            .retrieve("C", "what does the user like?", Some(3), Some(200))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].record.id, summary.id);
    }

    #[tokio::test]
    async fn test_every_indexed_record_has_a_vector_after_compaction() {
        let dir = tempdir().unwrap();
        let f = open_service(dir.path(), 3).await;
        ingest_all(&f.service, "C", &TURNS).await;
        f.service.compact_conversation("C").await.unwrap();

        let indexed = f
            .service
            .list(
                &RecordQuery::new()
                    .with_statuses(vec![EmbeddingStatus::Indexed])
                    .with_eviction(EvictionState::Any),
            )
            .await
            .unwrap();
        assert_eq!(indexed.len(), 6);
        assert_eq!(indexed.iter().filter(|r| r.is_evicted()).count(), 5);
        for record in &indexed {
            assert!(
                f.service.index().contains(record.id).await.unwrap(),
                "indexed record {} has no vector",
                record.id
            );
        }

        let check = f.service.verify_consistency(100).await.unwrap();
        assert_eq!(check.checked, 6);
        assert!(check.missing.is_empty());
    }

    #[tokio::test]
    async fn test_embedding_outage_then_repair() {
        let dir = tempdir().unwrap();
        let f = open_service(dir.path(), 100).await;

        f.embedder.set_failure(Some(MockFailure::Hang));
        let record = f
            .service
            .ingest("C", Speaker::User, "my favourite colour is green", None)
            .await
            .unwrap();
        assert_eq!(record.embedding_status, EmbeddingStatus::Failed);

        let stored = f.service.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.content, "my favourite colour is green");
        assert_eq!(stored.embedding_status, EmbeddingStatus::Failed);

        f.embedder.set_failure(None);
        let report = f.service.repair().await.unwrap();
        assert_eq!(report.repaired, 1);
        assert_eq!(report.still_failed, 0);

        let results = f
            .service
            .retrieve("C", "favourite colour", Some(3), Some(200))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].record.id, record.id);
    }

    #[tokio::test]
    async fn test_summarizer_outage_leaves_turns_live() {
        let dir = tempdir().unwrap();
        let f = open_service(dir.path(), 3).await;
        ingest_all(&f.service, "C", &TURNS).await;

        f.summarizer.set_failure(Some(MockFailure::Unavailable));
        let report = f.service.compact_conversation("C").await.unwrap();
        assert_eq!(report.summaries_created, 0);
        assert_eq!(report.batches_failed, 1);

        let live = f.service.list(&RecordQuery::live_turns("C")).await.unwrap();
        assert_eq!(live.len(), 5);

        f.summarizer.set_failure(None);
        let report = f.service.compact_conversation("C").await.unwrap();
        assert_eq!(report.summaries_created, 1);
        assert!(f.service.list(&RecordQuery::live_turns("C")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_content_survives_byte_for_byte() {
        let dir = tempdir().unwrap();
        let f = open_service(dir.path(), 100).await;
        let text = "line one\n  line two\twith tab \u{1F375} and \"quotes\"";

        let record = f.service.ingest("C", Speaker::Assistant, text, None).await.unwrap();
        let stored = f.service.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.content, text);
        assert_eq!(stored.speaker, Speaker::Assistant);
    }
}

mod restart_tests {
    use super::*;

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempdir().unwrap();
        let summary_id = {
            let f = open_service(dir.path(), 3).await;
            ingest_all(&f.service, "C", &TURNS).await;
            f.service.compact_conversation("C").await.unwrap();
            let summaries = f
                .service
                .list(&RecordQuery::new().with_kinds(vec![MemoryKind::Summary]))
                .await
                .unwrap();
            summaries[0].id
        };

        let f = open_service(dir.path(), 3).await;
        let stats = f.service.stats().await.unwrap();
        assert_eq!(stats.records.total, 6);
        assert_eq!(stats.records.evicted, 5);
        assert_eq!(stats.records.indexed, 6);
        assert_eq!(stats.vectors, 6);

        let results = f
            .service
            .retrieve("C", "tea", Some(3), Some(200))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].record.id, summary_id);

        // Already summarized, nothing left to do
        let report = f.service.compact_conversation("C").await.unwrap();
        assert_eq!(report.summaries_created, 0);
    }

    #[tokio::test]
    async fn test_lost_vectors_are_rebuilt() {
        let dir = tempdir().unwrap();
        let f = open_service(dir.path(), 100).await;
        let ids = ingest_all(&f.service, "C", &["alpha", "beta", "gamma"]).await;

        f.service.index().delete(ids[1]).await.unwrap();
        let check = f.service.verify_consistency(10).await.unwrap();
        assert_eq!(check.checked, 3);
        assert_eq!(check.missing, vec![ids[1]]);

        let report = f.service.repair().await.unwrap();
        assert_eq!(report.repaired, 1);
        assert!(f.service.index().contains(ids[1]).await.unwrap());
        assert_eq!(
            f.service.store().get(ids[1]).await.unwrap().unwrap().embedding_status,
            EmbeddingStatus::Indexed
        );
    }
}
