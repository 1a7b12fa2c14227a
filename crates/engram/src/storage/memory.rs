//! In-process store and index for tests and ephemeral deployments

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{EngramError, Result};
use crate::memory::types::{EmbeddingStatus, EvictionMark, MemoryKind, MemoryRecord, now_micros};
use crate::storage::filter::{RecordQuery, VectorFilter};
use crate::storage::{DurableStore, ScoredId, StoreStats, VectorEntry, VectorIndex};

#[derive(Debug)]
struct Lease {
    holder: String,
    expires_at: DateTime<Utc>,
}

/// `DurableStore` over a hash map. Each method holds the write lock for its
/// whole body, which gives the same atomicity as a single transaction.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: RwLock<HashMap<Uuid, MemoryRecord>>,
    leases: RwLock<HashMap<String, Lease>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DurableStore for InMemoryStore {
    async fn insert(&self, record: &MemoryRecord) -> Result<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.id) {
            return Err(EngramError::ConsistencyConflict(format!(
                "record {} already exists",
                record.id
            )));
        }
        records.insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<MemoryRecord>> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn get_many(&self, ids: &[Uuid]) -> Result<Vec<MemoryRecord>> {
        let records = self.records.read().await;
        Ok(ids.iter().filter_map(|id| records.get(id).cloned()).collect())
    }

    async fn query(&self, query: &RecordQuery) -> Result<Vec<MemoryRecord>> {
        let records = self.records.read().await;
        let matching = records
            .values()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        Ok(query.arrange(matching))
    }

    async fn count(&self, query: &RecordQuery) -> Result<usize> {
        let records = self.records.read().await;
        Ok(records.values().filter(|r| query.matches(r)).count())
    }

    async fn set_embedding_status(&self, id: Uuid, status: EmbeddingStatus) -> Result<bool> {
        let mut records = self.records.write().await;
        match records.get_mut(&id) {
            Some(record) => {
                record.embedding_status = status;
                record.status_updated_at = now_micros();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_evicted(
        &self,
        ids: &[Uuid],
        superseded_by: Uuid,
        evicted_at: DateTime<Utc>,
    ) -> Result<Vec<Uuid>> {
        let mut records = self.records.write().await;
        let mut evicted = Vec::new();
        for id in ids {
            if let Some(record) = records.get_mut(id) {
                if record.eviction.is_none() {
                    record.eviction = Some(EvictionMark {
                        evicted_at,
                        superseded_by,
                    });
                    evicted.push(*id);
                }
            }
        }
        Ok(evicted)
    }

    async fn record_compaction_failure(
        &self,
        ids: &[Uuid],
        max_attempts: u32,
    ) -> Result<Vec<Uuid>> {
        let mut records = self.records.write().await;
        let mut flagged = Vec::new();
        for id in ids {
            if let Some(record) = records.get_mut(id) {
                if record.flagged_for_review {
                    continue;
                }
                record.compaction_attempts += 1;
                if record.compaction_attempts >= max_attempts {
                    record.flagged_for_review = true;
                    flagged.push(*id);
                }
            }
        }
        Ok(flagged)
    }

    async fn set_review_flag(&self, id: Uuid, flagged: bool) -> Result<bool> {
        let mut records = self.records.write().await;
        match records.get_mut(&id) {
            Some(record) => {
                record.flagged_for_review = flagged;
                if !flagged {
                    record.compaction_attempts = 0;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn conversation_turn_counts(&self) -> Result<Vec<(String, usize)>> {
        let records = self.records.read().await;
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for record in records.values() {
            if record.kind == MemoryKind::Turn && !record.is_evicted() {
                *counts.entry(record.conversation_id.as_str()).or_default() += 1;
            }
        }
        let mut counts: Vec<(String, usize)> =
            counts.into_iter().map(|(c, n)| (c.to_string(), n)).collect();
        counts.sort();
        Ok(counts)
    }

    async fn try_acquire_lease(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let mut leases = self.leases.write().await;
        let now = Utc::now();
        if let Some(existing) = leases.get(key) {
            if existing.holder != holder && existing.expires_at > now {
                return Ok(false);
            }
        }
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        leases.insert(
            key.to_string(),
            Lease {
                holder: holder.to_string(),
                expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
            },
        );
        Ok(true)
    }

    async fn release_lease(&self, key: &str, holder: &str) -> Result<()> {
        let mut leases = self.leases.write().await;
        if leases.get(key).is_some_and(|l| l.holder == holder) {
            leases.remove(key);
        }
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats> {
        let records = self.records.read().await;
        let mut stats = StoreStats {
            total: records.len(),
            ..StoreStats::default()
        };
        let mut conversations = HashSet::new();
        for record in records.values() {
            conversations.insert(record.conversation_id.as_str());
            match record.kind {
                MemoryKind::Turn => stats.turns += 1,
                MemoryKind::Summary => stats.summaries += 1,
            }
            match record.embedding_status {
                EmbeddingStatus::Pending => stats.pending += 1,
                EmbeddingStatus::Indexed => stats.indexed += 1,
                EmbeddingStatus::Failed => stats.failed += 1,
            }
            if record.is_evicted() {
                stats.evicted += 1;
            }
            if record.flagged_for_review {
                stats.flagged += 1;
            }
        }
        stats.conversations = conversations.len();
        Ok(stats)
    }
}

/// Brute-force cosine index over a concurrent map
#[derive(Debug, Default)]
pub struct InMemoryIndex {
    entries: DashMap<Uuid, VectorEntry>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn upsert(&self, entry: VectorEntry) -> Result<()> {
        self.entries.insert(entry.id, entry);
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: &VectorFilter,
    ) -> Result<Vec<ScoredId>> {
        let mut hits: Vec<ScoredId> = self
            .entries
            .iter()
            .filter(|e| filter.matches(&e.id, &e.conversation_id))
            .map(|e| ScoredId {
                id: e.id,
                similarity: cosine_similarity(vector, &e.vector),
            })
            .collect();
        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self.entries.remove(&id).is_some())
    }

    async fn contains(&self, id: Uuid) -> Result<bool> {
        Ok(self.entries.contains_key(&id))
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.entries.len())
    }
}

/// Cosine similarity between two vectors; 0.0 for mismatched or zero vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}
