//! Memory compaction
//!
//! Replaces batches of old raw turns with generated summaries. Each batch is a
//! small saga whose steps are individually idempotent:
//!
//! 1. summarize the batch and persist the summary (`pending`)
//! 2. embed and index the summary
//! 3. once the summary is `indexed`, check-and-set the eviction mark on its sources
//!
//! Evicted turns keep their vectors and their `indexed` status; retrieval
//! drops them after the durable re-check.
//!
//! A run interrupted anywhere leaves the raw turns live. The next run for the
//! conversation finds summaries whose sources are still live and finishes
//! them before selecting new work, so no turn is ever summarized twice.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::CompactionConfig;
use crate::error::{EngramError, Result};
use crate::inference::InferenceClient;
use crate::memory::ingestion::Indexer;
use crate::memory::types::{EmbeddingStatus, MemoryKind, MemoryRecord, now_micros};
use crate::storage::{DurableStore, EvictionState, RecordQuery};

/// Totals for one compaction run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompactionReport {
    pub conversations_scanned: usize,
    /// Skipped because another instance holds the lease
    pub conversations_locked: usize,
    pub conversations_failed: usize,
    pub summaries_created: usize,
    /// Interrupted sagas finished this run
    pub summaries_resumed: usize,
    /// Summaries persisted but not yet indexed; their turns stay live
    pub summaries_pending: usize,
    pub turns_evicted: usize,
    /// Sources already evicted by someone else at mark time
    pub eviction_conflicts: usize,
    pub turns_flagged: usize,
    pub batches_failed: usize,
    /// Trailing batches below the minimum size
    pub batches_deferred: usize,
}

impl CompactionReport {
    pub fn merge(&mut self, other: &CompactionReport) {
        self.conversations_scanned += other.conversations_scanned;
        self.conversations_locked += other.conversations_locked;
        self.conversations_failed += other.conversations_failed;
        self.summaries_created += other.summaries_created;
        self.summaries_resumed += other.summaries_resumed;
        self.summaries_pending += other.summaries_pending;
        self.turns_evicted += other.turns_evicted;
        self.eviction_conflicts += other.eviction_conflicts;
        self.turns_flagged += other.turns_flagged;
        self.batches_failed += other.batches_failed;
        self.batches_deferred += other.batches_deferred;
    }
}

/// Result of summarizing one batch
#[derive(Debug, Clone)]
pub enum BatchOutcome {
    /// Summary persisted; `embedding_status` tells whether eviction may proceed
    Summarized(MemoryRecord),
    /// Summarization failed; the listed turns reached the attempt limit
    Failed { flagged: Vec<Uuid> },
}

/// Result of the eviction step
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionOutcome {
    pub evicted: Vec<Uuid>,
    pub conflicts: usize,
}

pub struct CompactionEngine {
    store: Arc<dyn DurableStore>,
    inference: Arc<InferenceClient>,
    indexer: Arc<Indexer>,
    config: CompactionConfig,
    holder: String,
}

impl CompactionEngine {
    pub fn new(
        store: Arc<dyn DurableStore>,
        inference: Arc<InferenceClient>,
        indexer: Arc<Indexer>,
        config: CompactionConfig,
    ) -> Self {
        Self {
            store,
            inference,
            indexer,
            config,
            holder: format!("compactor-{}", Uuid::new_v4()),
        }
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    /// Compact every conversation that has live raw turns.
    ///
    /// A failing conversation is logged and counted; the others still run.
    pub async fn run_cycle(&self) -> Result<CompactionReport> {
        let conversations = self.store.conversation_turn_counts().await?;
        let mut report = CompactionReport::default();

        for (conversation_id, _) in conversations {
            match self.compact_conversation(&conversation_id).await {
                Ok(r) => report.merge(&r),
                Err(e) => {
                    warn!("Compaction of conversation {conversation_id} failed: {e}");
                    report.conversations_scanned += 1;
                    report.conversations_failed += 1;
                }
            }
        }

        info!(
            "Compaction cycle: conversations={} summaries={} resumed={} evicted={} flagged={} failed_batches={}",
            report.conversations_scanned,
            report.summaries_created,
            report.summaries_resumed,
            report.turns_evicted,
            report.turns_flagged,
            report.batches_failed
        );
        Ok(report)
    }

    /// Compact one conversation under its lease
    pub async fn compact_conversation(&self, conversation_id: &str) -> Result<CompactionReport> {
        let key = lease_key(conversation_id);
        let mut report = CompactionReport {
            conversations_scanned: 1,
            ..CompactionReport::default()
        };

        if !self.renew_lease(&key).await? {
            debug!("Conversation {conversation_id} is being compacted elsewhere, skipping");
            report.conversations_locked = 1;
            return Ok(report);
        }

        let result = self.compact_locked(conversation_id, &key, &mut report).await;

        if let Err(e) = self.store.release_lease(&key, &self.holder).await {
            warn!("Failed to release compaction lease {key}: {e}");
        }
        result.map(|()| report)
    }

    async fn compact_locked(
        &self,
        conversation_id: &str,
        key: &str,
        report: &mut CompactionReport,
    ) -> Result<()> {
        self.resume_pending(conversation_id, report).await?;

        let candidates = self.select_candidates(conversation_id).await?;
        if candidates.is_empty() {
            return Ok(());
        }

        let batch_size = self.config.batch_size.max(1);
        for batch in candidates.chunks(batch_size) {
            if batch.len() < self.config.batch_minimum {
                debug!(
                    "Deferring {} turns of {conversation_id}, below batch minimum {}",
                    batch.len(),
                    self.config.batch_minimum
                );
                report.batches_deferred += 1;
                break;
            }

            if !self.renew_lease(key).await? {
                warn!("Lost compaction lease for {conversation_id}, stopping");
                break;
            }

            match self.summarize_and_index(conversation_id, batch).await? {
                BatchOutcome::Summarized(summary) => {
                    report.summaries_created += 1;
                    if summary.embedding_status != EmbeddingStatus::Indexed {
                        report.summaries_pending += 1;
                        continue;
                    }
                    let outcome = self.commit_eviction(&summary).await?;
                    report.turns_evicted += outcome.evicted.len();
                    report.eviction_conflicts += outcome.conflicts;
                }
                BatchOutcome::Failed { flagged } => {
                    report.batches_failed += 1;
                    report.turns_flagged += flagged.len();
                }
            }
        }
        Ok(())
    }

    /// Turns eligible for summarization, oldest first.
    ///
    /// Live, unflagged raw turns that no summary already covers, and that are
    /// either older than the retention window or, when the conversation is
    /// over its turn threshold, outside the newest `keep_recent_turns`.
    pub async fn select_candidates(&self, conversation_id: &str) -> Result<Vec<MemoryRecord>> {
        let live_turns = self
            .store
            .query(&RecordQuery::live_turns(conversation_id))
            .await?;

        let summarized: HashSet<Uuid> = self
            .store
            .query(
                &RecordQuery::new()
                    .in_conversation(conversation_id)
                    .with_kinds(vec![MemoryKind::Summary])
                    .with_eviction(EvictionState::Any),
            )
            .await?
            .into_iter()
            .flat_map(|s| s.source_ids)
            .collect();

        let over_threshold = live_turns.len() > self.config.turn_threshold;
        let unsummarized: Vec<MemoryRecord> = live_turns
            .into_iter()
            .filter(|t| !t.flagged_for_review && !summarized.contains(&t.id))
            .collect();

        let overflow = if over_threshold {
            unsummarized.len().saturating_sub(self.config.keep_recent_turns)
        } else {
            0
        };
        let cutoff = now_micros() - Duration::hours(self.config.retention_window_hours as i64);

        Ok(unsummarized
            .into_iter()
            .enumerate()
            .filter(|(i, turn)| *i < overflow || turn.created_at <= cutoff)
            .map(|(_, turn)| turn)
            .collect())
    }

    /// Summarize `batch`, persist the summary and try to index it.
    ///
    /// Nothing is evicted here. On summarization failure every turn in the
    /// batch has its attempt counter bumped.
    pub async fn summarize_and_index(
        &self,
        conversation_id: &str,
        batch: &[MemoryRecord],
    ) -> Result<BatchOutcome> {
        let lines: Vec<String> = batch.iter().map(MemoryRecord::transcript_line).collect();

        let text = match self
            .inference
            .summarize(&lines, self.config.max_summary_tokens)
            .await
        {
            Ok(text) => text,
            Err(e) => return self.record_failure(conversation_id, batch, e).await,
        };

        let mut summary = MemoryRecord::summary(conversation_id, text, batch);
        self.store.insert(&summary).await?;
        debug!(
            "Persisted summary {} covering {} turns of {conversation_id}",
            summary.id,
            batch.len()
        );

        summary.embedding_status = self.indexer.index_record(&summary).await;
        Ok(BatchOutcome::Summarized(summary))
    }

    async fn record_failure(
        &self,
        conversation_id: &str,
        batch: &[MemoryRecord],
        error: EngramError,
    ) -> Result<BatchOutcome> {
        match error {
            EngramError::ContentRejected(ref reason) => warn!(
                "Summarizer rejected {} turns of {conversation_id}, needs review: {reason}",
                batch.len()
            ),
            ref other => warn!(
                "Summarizing {} turns of {conversation_id} failed: {other}",
                batch.len()
            ),
        }

        let ids: Vec<Uuid> = batch.iter().map(|t| t.id).collect();
        let flagged = self
            .store
            .record_compaction_failure(&ids, self.config.max_attempts)
            .await?;
        for id in &flagged {
            warn!("Turn {id} flagged for manual review after {} failed summaries", self.config.max_attempts);
        }
        Ok(BatchOutcome::Failed { flagged })
    }

    /// Evict the sources of an indexed summary.
    ///
    /// Re-reads the summary so a stale in-memory copy cannot evict turns whose
    /// summary never reached the index.
    pub async fn commit_eviction(&self, summary: &MemoryRecord) -> Result<EvictionOutcome> {
        let current = self
            .store
            .get(summary.id)
            .await?
            .ok_or_else(|| EngramError::NotFound(format!("summary {}", summary.id)))?;

        if current.embedding_status != EmbeddingStatus::Indexed {
            return Err(EngramError::ConsistencyConflict(format!(
                "summary {} is {}, not indexed",
                current.id, current.embedding_status
            )));
        }

        let evicted = self
            .store
            .mark_evicted(&current.source_ids, current.id, now_micros())
            .await?;
        let conflicts = current.source_ids.len() - evicted.len();
        if conflicts > 0 {
            debug!("{conflicts} sources of summary {} were already evicted", current.id);
        }

        info!(
            "Summary {} replaced {} turns in {}",
            current.id,
            evicted.len(),
            current.conversation_id
        );
        Ok(EvictionOutcome { evicted, conflicts })
    }

    /// Finish summaries whose sources are still live
    async fn resume_pending(&self, conversation_id: &str, report: &mut CompactionReport) -> Result<()> {
        let live: HashSet<Uuid> = self
            .store
            .query(&RecordQuery::live_turns(conversation_id))
            .await?
            .into_iter()
            .map(|t| t.id)
            .collect();
        if live.is_empty() {
            return Ok(());
        }

        let summaries = self
            .store
            .query(
                &RecordQuery::new()
                    .in_conversation(conversation_id)
                    .with_kinds(vec![MemoryKind::Summary]),
            )
            .await?;

        for summary in summaries {
            if !summary.source_ids.iter().any(|id| live.contains(id)) {
                continue;
            }

            debug!("Resuming compaction of summary {}", summary.id);
            if summary.embedding_status != EmbeddingStatus::Indexed
                && self.indexer.index_record(&summary).await != EmbeddingStatus::Indexed
            {
                report.summaries_pending += 1;
                continue;
            }

            let outcome = self.commit_eviction(&summary).await?;
            report.summaries_resumed += 1;
            report.turns_evicted += outcome.evicted.len();
            report.eviction_conflicts += outcome.conflicts;
        }
        Ok(())
    }

    async fn renew_lease(&self, key: &str) -> Result<bool> {
        self.store
            .try_acquire_lease(key, &self.holder, StdDuration::from_secs(self.config.lease_ttl_secs))
            .await
    }
}

fn lease_key(conversation_id: &str) -> String {
    format!("compaction:{conversation_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::RetryPolicy;
    use crate::memory::types::Speaker;
    use crate::storage::{InMemoryStore, VectorIndex};
    use crate::testing::{EchoSummarizer, FaultyIndex, MockEmbedder, MockFailure};
    use chrono::Utc;

    struct Fixture {
        store: Arc<InMemoryStore>,
        index: Arc<FaultyIndex>,
        summarizer: Arc<EchoSummarizer>,
        engine: CompactionEngine,
    }

    fn fixture(config: CompactionConfig) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let index = Arc::new(FaultyIndex::new());
        let summarizer = Arc::new(EchoSummarizer::new());
        let policy = RetryPolicy::new(StdDuration::from_millis(100), 0, StdDuration::from_millis(1));
        let inference = Arc::new(InferenceClient::new(
            Arc::new(MockEmbedder::new(16)),
            summarizer.clone(),
            policy.clone(),
            policy,
        ));
        let indexer = Arc::new(Indexer::new(store.clone(), index.clone(), inference.clone()));
        let engine = CompactionEngine::new(store.clone(), inference, indexer, config);
        Fixture {
            store,
            index,
            summarizer,
            engine,
        }
    }

    fn config() -> CompactionConfig {
        CompactionConfig {
            retention_window_hours: 24,
            turn_threshold: 100,
            keep_recent_turns: 0,
            batch_size: 3,
            batch_minimum: 2,
            max_attempts: 2,
            ..CompactionConfig::default()
        }
    }

    async fn seed(store: &InMemoryStore, texts: &[&str], age_hours: i64) -> Vec<MemoryRecord> {
        let base = Utc::now() - Duration::hours(age_hours);
        let mut records = Vec::new();
        for (i, text) in texts.iter().enumerate() {
            let mut record = MemoryRecord::turn("c1", Speaker::User, *text, base + Duration::seconds(i as i64));
            record.embedding_status = EmbeddingStatus::Indexed;
            store.insert(&record).await.unwrap();
            records.push(record);
        }
        records
    }

    #[tokio::test]
    async fn test_selects_only_aged_turns() {
        let f = fixture(config());
        let old = seed(&f.store, &["a", "b"], 48).await;
        seed(&f.store, &["c"], 1).await;

        let candidates = f.engine.select_candidates("c1").await.unwrap();
        let ids: Vec<Uuid> = candidates.iter().map(|t| t.id).collect();
        assert_eq!(ids, old.iter().map(|t| t.id).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_threshold_keeps_recent_turns() {
        let f = fixture(CompactionConfig {
            turn_threshold: 3,
            keep_recent_turns: 2,
            ..config()
        });
        let turns = seed(&f.store, &["a", "b", "c", "d", "e"], 0).await;

        let candidates = f.engine.select_candidates("c1").await.unwrap();
        assert_eq!(candidates.len(), 3);
        assert_eq!(candidates[0].id, turns[0].id);
        assert_eq!(candidates[2].id, turns[2].id);
    }

    #[tokio::test]
    async fn test_batches_and_defers_short_tail() {
        let f = fixture(config());
        let turns = seed(&f.store, &["a", "b", "c", "d"], 48).await;

        let report = f.engine.compact_conversation("c1").await.unwrap();
        assert_eq!(report.summaries_created, 1);
        assert_eq!(report.turns_evicted, 3);
        assert_eq!(report.batches_deferred, 1);

        let tail = f.store.get(turns[3].id).await.unwrap().unwrap();
        assert!(!tail.is_evicted());
    }

    #[tokio::test]
    async fn test_second_run_is_a_no_op() {
        let f = fixture(config());
        seed(&f.store, &["a", "b", "c"], 48).await;

        f.engine.compact_conversation("c1").await.unwrap();
        let report = f.engine.compact_conversation("c1").await.unwrap();

        assert_eq!(report.summaries_created, 0);
        assert_eq!(report.turns_evicted, 0);
        assert_eq!(f.store.stats().await.unwrap().summaries, 1);
        assert_eq!(f.summarizer.calls(), 1);
    }

    #[tokio::test]
    async fn test_unindexed_summary_does_not_evict_and_resumes() {
        let f = fixture(config());
        let turns = seed(&f.store, &["a", "b", "c"], 48).await;

        f.index.set_fail_upserts(true);
        let report = f.engine.compact_conversation("c1").await.unwrap();
        assert_eq!(report.summaries_created, 1);
        assert_eq!(report.summaries_pending, 1);
        assert_eq!(report.turns_evicted, 0);
        for turn in &turns {
            assert!(!f.store.get(turn.id).await.unwrap().unwrap().is_evicted());
        }

        f.index.set_fail_upserts(false);
        let report = f.engine.compact_conversation("c1").await.unwrap();
        assert_eq!(report.summaries_resumed, 1);
        assert_eq!(report.summaries_created, 0);
        assert_eq!(report.turns_evicted, 3);
        assert_eq!(f.summarizer.calls(), 1);
    }

    #[tokio::test]
    async fn test_commit_eviction_refuses_unindexed_summary() {
        let f = fixture(config());
        let turns = seed(&f.store, &["a", "b"], 48).await;
        let summary = MemoryRecord::summary("c1", "summary", &turns);
        f.store.insert(&summary).await.unwrap();

        let err = f.engine.commit_eviction(&summary).await.unwrap_err();
        assert!(matches!(err, EngramError::ConsistencyConflict(_)));
    }

    #[tokio::test]
    async fn test_eviction_skips_already_evicted_sources() {
        let f = fixture(config());
        let turns = seed(&f.store, &["a", "b"], 48).await;
        let mut summary = MemoryRecord::summary("c1", "summary", &turns);
        summary.embedding_status = EmbeddingStatus::Indexed;
        f.store.insert(&summary).await.unwrap();
        f.store
            .mark_evicted(&[turns[0].id], Uuid::new_v4(), Utc::now())
            .await
            .unwrap();

        let outcome = f.engine.commit_eviction(&summary).await.unwrap();
        assert_eq!(outcome.evicted, vec![turns[1].id]);
        assert_eq!(outcome.conflicts, 1);
    }

    #[tokio::test]
    async fn test_repeated_rejection_flags_turns() {
        let f = fixture(config());
        let turns = seed(&f.store, &["a", "b"], 48).await;
        f.summarizer.set_failure(Some(MockFailure::Reject));

        let first = f.engine.compact_conversation("c1").await.unwrap();
        assert_eq!(first.batches_failed, 1);
        assert_eq!(first.turns_flagged, 0);

        let second = f.engine.compact_conversation("c1").await.unwrap();
        assert_eq!(second.turns_flagged, 2);

        let flagged = f.store.get(turns[0].id).await.unwrap().unwrap();
        assert!(flagged.flagged_for_review);
        assert!(!flagged.is_evicted());

        // Flagged turns are no longer selected
        f.summarizer.set_failure(None);
        assert!(f.engine.select_candidates("c1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lease_held_elsewhere_skips_conversation() {
        let f = fixture(config());
        seed(&f.store, &["a", "b", "c"], 48).await;
        f.store
            .try_acquire_lease("compaction:c1", "someone-else", StdDuration::from_secs(60))
            .await
            .unwrap();

        let report = f.engine.compact_conversation("c1").await.unwrap();
        assert_eq!(report.conversations_locked, 1);
        assert_eq!(report.summaries_created, 0);
    }

    #[tokio::test]
    async fn test_indexed_records_keep_vectors_after_eviction() {
        let f = fixture(config());
        let turns = seed(&f.store, &["a", "b", "c"], 48).await;
        for turn in &turns {
            assert_eq!(f.engine.indexer.index_record(turn).await, EmbeddingStatus::Indexed);
        }

        let report = f.engine.run_cycle().await.unwrap();
        assert_eq!(report.turns_evicted, 3);

        let indexed = f
            .store
            .query(
                &RecordQuery::new()
                    .with_statuses(vec![EmbeddingStatus::Indexed])
                    .with_eviction(EvictionState::Any),
            )
            .await
            .unwrap();
        assert_eq!(indexed.len(), 4);
        for record in indexed {
            assert!(f.index.contains(record.id).await.unwrap(), "{} has no vector", record.id);
        }
    }
}
