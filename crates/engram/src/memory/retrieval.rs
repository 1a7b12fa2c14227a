//! Memory Retrieval
//!
//! Two-stage pipeline:
//! 1. Vector search for candidates (over-fetched by `candidate_multiplier`)
//! 2. Re-check every candidate against the durable store, rank by similarity
//!    and recency, and fill the token budget greedily
//!
//! The index may lag the store, so eviction and embedding status are always
//! taken from the store, never from the index.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::config::{RetrievalConfig, RetrievalScope};
use crate::error::Result;
use crate::inference::InferenceClient;
use crate::memory::context::estimate_tokens;
use crate::memory::types::{MemoryKind, MemoryRecord};
use crate::storage::{DurableStore, ScoredId, VectorFilter, VectorIndex};

/// A retrieved record with scoring information
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedMemory {
    pub record: MemoryRecord,
    /// Cosine similarity from the vector search
    pub similarity: f32,
    /// Exponential decay on age, 1.0 for a record created now
    pub recency: f32,
    /// Final combined score for ranking
    pub score: f32,
    /// Estimated tokens charged against the budget
    pub tokens: usize,
}

/// Recency score: halves every `half_life_hours`.
///
/// Records dated in the future score 1.0; a non-positive half-life disables decay.
pub fn recency_score(created_at: DateTime<Utc>, now: DateTime<Utc>, half_life_hours: f64) -> f32 {
    if half_life_hours <= 0.0 {
        return 1.0;
    }
    let age_hours = (now - created_at).num_milliseconds().max(0) as f64 / 3_600_000.0;
    (-std::f64::consts::LN_2 * age_hours / half_life_hours).exp() as f32
}

/// Candidates that survived the durable-store re-check
struct Resolved {
    candidates: Vec<(MemoryRecord, f32)>,
    dropped_evicted: usize,
}

pub struct RetrievalEngine {
    store: Arc<dyn DurableStore>,
    index: Arc<dyn VectorIndex>,
    inference: Arc<InferenceClient>,
    config: RetrievalConfig,
}

impl RetrievalEngine {
    pub fn new(
        store: Arc<dyn DurableStore>,
        index: Arc<dyn VectorIndex>,
        inference: Arc<InferenceClient>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            store,
            index,
            inference,
            config,
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Up to `k` records relevant to `query`, most relevant first, whose
    /// estimated tokens fit in `token_budget`. An empty result is valid.
    pub async fn retrieve(
        &self,
        conversation_id: &str,
        query: &str,
        k: usize,
        token_budget: usize,
    ) -> Result<Vec<RetrievedMemory>> {
        if k == 0 || token_budget == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let vector = self.inference.embed(query).await?;
        let filter = match self.config.scope {
            RetrievalScope::Conversation => VectorFilter::new().with_conversation_id(conversation_id),
            RetrievalScope::Global => VectorFilter::new(),
        };
        let fetch = k.saturating_mul(self.config.candidate_multiplier.max(1));

        let hits = self.index.query(&vector, fetch, &filter).await?;
        let seen: Vec<Uuid> = hits.iter().map(|h| h.id).collect();
        let mut resolved = self.resolve(conversation_id, hits).await?;

        // Evicted turns keep their vectors and can crowd out live records; look past them once
        if resolved.dropped_evicted > 0 && resolved.candidates.len() < k {
            let refill = self
                .index
                .query(&vector, fetch, &filter.clone().excluding(seen))
                .await?;
            debug!("Re-querying past {} evicted candidates", resolved.dropped_evicted);
            let more = self.resolve(conversation_id, refill).await?;
            resolved.candidates.extend(more.candidates);
        }

        let candidates = drop_superseded(resolved.candidates);
        let ranked = self.rank(candidates, Utc::now());
        let selected = select_within_budget(ranked, k, token_budget);

        debug!(
            "Retrieved {} memories for conversation {conversation_id}",
            selected.len()
        );
        Ok(selected)
    }

    /// Fetch hits from the store, keeping only live, searchable, in-scope records
    async fn resolve(&self, conversation_id: &str, hits: Vec<ScoredId>) -> Result<Resolved> {
        let ids: Vec<Uuid> = hits.iter().map(|h| h.id).collect();
        let mut records: HashMap<Uuid, MemoryRecord> = self
            .store
            .get_many(&ids)
            .await?
            .into_iter()
            .map(|r| (r.id, r))
            .collect();

        let mut resolved = Resolved {
            candidates: Vec::with_capacity(hits.len()),
            dropped_evicted: 0,
        };
        for hit in hits {
            let Some(record) = records.remove(&hit.id) else {
                debug!("Vector {} has no durable record, skipping", hit.id);
                continue;
            };
            if record.is_evicted() {
                resolved.dropped_evicted += 1;
                continue;
            }
            if !record.is_searchable() {
                continue;
            }
            if self.config.scope == RetrievalScope::Conversation && record.conversation_id != conversation_id {
                continue;
            }
            resolved.candidates.push((record, hit.similarity));
        }
        Ok(resolved)
    }

    fn rank(&self, candidates: Vec<(MemoryRecord, f32)>, now: DateTime<Utc>) -> Vec<RetrievedMemory> {
        let mut ranked: Vec<RetrievedMemory> = candidates
            .into_iter()
            .map(|(record, similarity)| {
                let recency = recency_score(record.created_at, now, self.config.recency_half_life_hours);
                let score = self.config.similarity_weight * similarity + self.config.recency_weight * recency;
                let tokens = estimate_tokens(&record.content);
                RetrievedMemory {
                    record,
                    similarity,
                    recency,
                    score,
                    tokens,
                }
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.record.created_at.cmp(&a.record.created_at))
                .then(a.record.id.cmp(&b.record.id))
        });
        ranked
    }
}

/// Drop turns covered by a summary that is also a candidate
fn drop_superseded(candidates: Vec<(MemoryRecord, f32)>) -> Vec<(MemoryRecord, f32)> {
    let superseded: HashSet<Uuid> = candidates
        .iter()
        .filter(|(r, _)| r.kind == MemoryKind::Summary)
        .flat_map(|(r, _)| r.source_ids.iter().copied())
        .collect();

    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|(r, _)| !(r.kind == MemoryKind::Turn && superseded.contains(&r.id)))
        .filter(|(r, _)| seen.insert(r.id))
        .collect()
}

/// Greedy fill: records too large for the remaining budget are skipped, not fatal
fn select_within_budget(ranked: Vec<RetrievedMemory>, k: usize, token_budget: usize) -> Vec<RetrievedMemory> {
    let mut remaining = token_budget;
    let mut selected = Vec::new();
    for memory in ranked {
        if selected.len() == k {
            break;
        }
        if memory.tokens > remaining {
            continue;
        }
        remaining -= memory.tokens;
        selected.push(memory);
    }
    selected
}
