//! Storage adapters
//!
//! The durable store is the source of truth for every `MemoryRecord`. The
//! vector index is derived from it and can be rebuilt; a missing or stale
//! vector is repaired, never treated as data loss.

pub mod filter;
pub mod lance;
pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;
use crate::memory::types::{EmbeddingStatus, MemoryRecord};

pub use filter::{EvictionState, RecordQuery, SortOrder, VectorFilter};
pub use lance::LanceIndex;
pub use memory::{InMemoryIndex, InMemoryStore};
pub use sqlite::SqliteStore;

/// Transactional record store.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Insert a new record atomically. Fails with `ConsistencyConflict` if the id exists.
    async fn insert(&self, record: &MemoryRecord) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<MemoryRecord>>;

    /// Fetch several records; ids that do not exist are omitted
    async fn get_many(&self, ids: &[Uuid]) -> Result<Vec<MemoryRecord>>;

    async fn query(&self, query: &RecordQuery) -> Result<Vec<MemoryRecord>>;

    /// Count matching records, ignoring pagination
    async fn count(&self, query: &RecordQuery) -> Result<usize>;

    /// Returns false if the record does not exist
    async fn set_embedding_status(&self, id: Uuid, status: EmbeddingStatus) -> Result<bool>;

    /// Check-and-set eviction of `ids` in one transaction.
    ///
    /// Only records that are currently live are marked; the ids that were
    /// actually transitioned are returned.
    async fn mark_evicted(
        &self,
        ids: &[Uuid],
        superseded_by: Uuid,
        evicted_at: DateTime<Utc>,
    ) -> Result<Vec<Uuid>>;

    /// Bump `compaction_attempts` on `ids` in one transaction, flagging any
    /// record that reaches `max_attempts`. Returns the newly flagged ids.
    async fn record_compaction_failure(&self, ids: &[Uuid], max_attempts: u32)
    -> Result<Vec<Uuid>>;

    /// Set or clear the review flag; clearing also resets the attempt counter
    async fn set_review_flag(&self, id: Uuid, flagged: bool) -> Result<bool>;

    /// Conversations that have live raw turns, with the live turn count
    async fn conversation_turn_counts(&self) -> Result<Vec<(String, usize)>>;

    /// Take or renew a named lease. Returns false while another holder's lease is unexpired.
    async fn try_acquire_lease(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// Drop a lease if `holder` still owns it
    async fn release_lease(&self, key: &str, holder: &str) -> Result<()>;

    async fn stats(&self) -> Result<StoreStats>;
}

/// A vector keyed by the id of the record it was computed from
#[derive(Debug, Clone, PartialEq)]
pub struct VectorEntry {
    pub id: Uuid,
    pub conversation_id: String,
    pub vector: Vec<f32>,
}

/// Similarity search hit
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredId {
    pub id: Uuid,
    /// Cosine similarity, higher is closer
    pub similarity: f32,
}

/// Rebuildable nearest-neighbour index.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace the vector for `entry.id`
    async fn upsert(&self, entry: VectorEntry) -> Result<()>;

    /// Up to `k` nearest ids, most similar first
    async fn query(&self, vector: &[f32], k: usize, filter: &VectorFilter)
    -> Result<Vec<ScoredId>>;

    /// Returns false if no vector existed
    async fn delete(&self, id: Uuid) -> Result<bool>;

    async fn contains(&self, id: Uuid) -> Result<bool>;

    async fn count(&self) -> Result<usize>;
}

/// Record counts for operators
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub total: usize,
    pub turns: usize,
    pub summaries: usize,
    pub evicted: usize,
    pub pending: usize,
    pub indexed: usize,
    pub failed: usize,
    pub flagged: usize,
    pub conversations: usize,
}
