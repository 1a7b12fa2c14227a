//! Repair sweep and index consistency checks
//!
//! The durable store is authoritative. The sweep pushes records that never
//! made it into the vector index (`failed`, or `pending` past the grace
//! period) back through the indexer; verification catches the opposite drift,
//! an `indexed` row whose vector has gone missing.

use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::IngestionConfig;
use crate::error::Result;
use crate::memory::ingestion::Indexer;
use crate::memory::types::{EmbeddingStatus, now_micros};
use crate::storage::{DurableStore, EvictionState, RecordQuery, SortOrder, VectorIndex};

/// Outcome of one repair sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    pub scanned: usize,
    pub repaired: usize,
    pub still_failed: usize,
}

/// Outcome of one consistency check
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsistencyReport {
    pub checked: usize,
    /// Indexed records without a vector, now reset to `pending`
    pub missing: Vec<Uuid>,
}

pub struct RepairSweep {
    store: Arc<dyn DurableStore>,
    index: Arc<dyn VectorIndex>,
    indexer: Arc<Indexer>,
    config: IngestionConfig,
}

impl RepairSweep {
    pub fn new(
        store: Arc<dyn DurableStore>,
        index: Arc<dyn VectorIndex>,
        indexer: Arc<Indexer>,
        config: IngestionConfig,
    ) -> Self {
        Self {
            store,
            index,
            indexer,
            config,
        }
    }

    /// Re-index every live `failed` record and every live `pending` record
    /// older than the grace period.
    ///
    /// Idempotent; concurrent sweeps at worst upsert the same vector twice.
    pub async fn run(&self) -> Result<RepairReport> {
        let mut report = RepairReport::default();

        let failed = RecordQuery::new()
            .with_statuses(vec![EmbeddingStatus::Failed])
            .with_eviction(EvictionState::Live);
        self.sweep(failed, &mut report).await?;

        let cutoff = now_micros() - Duration::seconds(self.config.repair_grace_secs as i64);
        let stale = RecordQuery::new()
            .with_statuses(vec![EmbeddingStatus::Pending])
            .with_eviction(EvictionState::Live)
            .recorded_before(cutoff);
        self.sweep(stale, &mut report).await?;

        if report.scanned > 0 {
            info!(
                "Repair sweep: scanned={} repaired={} still_failed={}",
                report.scanned, report.repaired, report.still_failed
            );
        }
        Ok(report)
    }

    async fn sweep(&self, query: RecordQuery, report: &mut RepairReport) -> Result<()> {
        let page_size = self.config.repair_batch_size.max(1);
        // Repaired rows leave the result set, so only rows that stayed behind advance the offset
        let mut offset = 0;

        loop {
            let page = self
                .store
                .query(&query.clone().paginate(page_size, offset))
                .await?;
            if page.is_empty() {
                break;
            }

            let fetched = page.len();
            let mut left_behind = 0;
            for record in page {
                report.scanned += 1;
                match self.indexer.index_record(&record).await {
                    EmbeddingStatus::Indexed => report.repaired += 1,
                    _ => {
                        report.still_failed += 1;
                        left_behind += 1;
                    }
                }
            }

            if fetched < page_size {
                break;
            }
            offset += left_behind;
        }
        Ok(())
    }

    /// Check up to `sample_size` indexed records against the vector index.
    ///
    /// The sample starts at a random offset into all indexed records, evicted
    /// ones included. Any record whose vector is missing is reset to `pending`.
    pub async fn verify_consistency(&self, sample_size: usize) -> Result<ConsistencyReport> {
        let mut report = ConsistencyReport::default();
        if sample_size == 0 {
            return Ok(report);
        }

        let indexed = RecordQuery::new()
            .with_statuses(vec![EmbeddingStatus::Indexed])
            .with_eviction(EvictionState::Any);
        let total = self.store.count(&indexed).await?;
        if total == 0 {
            return Ok(report);
        }

        let span = total.saturating_sub(sample_size) + 1;
        let start = (Uuid::new_v4().as_u128() % span as u128) as usize;
        let sample = self
            .store
            .query(&indexed.order(SortOrder::Chronological).paginate(sample_size, start))
            .await?;

        for record in sample {
            report.checked += 1;
            if self.index.contains(record.id).await? {
                continue;
            }
            warn!("Record {} is marked indexed but has no vector", record.id);
            if self
                .store
                .set_embedding_status(record.id, EmbeddingStatus::Pending)
                .await?
            {
                report.missing.push(record.id);
            }
        }

        debug!(
            "Consistency check: checked={} missing={}",
            report.checked,
            report.missing.len()
        );
        Ok(report)
    }
}
