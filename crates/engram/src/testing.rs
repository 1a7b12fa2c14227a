//! Test utilities for engram - deterministic backends and fault injection
//!
//! Nothing in here needs a model download or a network:
//! - `MockEmbedder` hashes words into buckets so texts sharing words score as similar
//! - `EchoSummarizer` stitches its input into a summary
//! - `FaultyIndex` wraps the in-memory index and fails on demand
//! - `TestHarness` wires them into a `MemoryService`

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{EngramError, Result};
use crate::inference::{Embedder, InferenceClient, RetryPolicy, Summarizer};
use crate::service::MemoryService;
use crate::storage::{InMemoryIndex, InMemoryStore, ScoredId, VectorEntry, VectorFilter, VectorIndex};

/// Dimension used by the harness
pub const TEST_DIMENSION: usize = 64;

/// How a mock backend misbehaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    /// Never answers; the caller's timeout fires
    Hang,
    /// Transient infrastructure error
    Unavailable,
    /// Input refused
    Reject,
}

impl MockFailure {
    fn encode(failure: Option<MockFailure>) -> u8 {
        match failure {
            None => 0,
            Some(MockFailure::Hang) => 1,
            Some(MockFailure::Unavailable) => 2,
            Some(MockFailure::Reject) => 3,
        }
    }

    fn decode(value: u8) -> Option<MockFailure> {
        match value {
            1 => Some(MockFailure::Hang),
            2 => Some(MockFailure::Unavailable),
            3 => Some(MockFailure::Reject),
            _ => None,
        }
    }

    async fn fail<T>(self, backend: &str) -> Result<T> {
        match self {
            MockFailure::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(EngramError::Timeout(format!("{backend} hung")))
            }
            MockFailure::Unavailable => {
                Err(EngramError::TransientInfra(format!("{backend} unavailable")))
            }
            MockFailure::Reject => Err(EngramError::ContentRejected(format!("{backend} refused input"))),
        }
    }
}

#[derive(Debug, Default)]
struct FailureSwitch {
    state: AtomicU8,
}

impl FailureSwitch {
    fn set(&self, failure: Option<MockFailure>) {
        self.state.store(MockFailure::encode(failure), Ordering::SeqCst);
    }

    fn get(&self) -> Option<MockFailure> {
        MockFailure::decode(self.state.load(Ordering::SeqCst))
    }
}

/// Deterministic bag-of-words embedder.
///
/// Each lowercase word is hashed into one bucket; the result is L2-normalised,
/// so cosine similarity tracks word overlap.
#[derive(Debug)]
pub struct MockEmbedder {
    dimension: usize,
    failure: FailureSwitch,
    calls: AtomicUsize,
}

impl MockEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
            failure: FailureSwitch::default(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_failure(&self, failure: Option<MockFailure>) {
        self.failure.set(failure);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The vector `embed` would return, without failure injection
    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        let mut any = false;

        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let mut hasher = DefaultHasher::new();
            word.to_lowercase().hash(&mut hasher);
            let bucket = (hasher.finish() % self.dimension as u64) as usize;
            vector[bucket] += 1.0;
            any = true;
        }

        if !any {
            vector[0] = 1.0;
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        vector.iter_mut().for_each(|x| *x /= norm);
        vector
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(failure) = self.failure.get() {
            return failure.fail("mock embedder").await;
        }
        Ok(self.vector_for(text))
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Summarizer that joins its transcript lines
#[derive(Debug, Default)]
pub struct EchoSummarizer {
    failure: FailureSwitch,
    calls: AtomicUsize,
}

impl EchoSummarizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failure(&self, failure: Option<MockFailure>) {
        self.failure.set(failure);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Summarizer for EchoSummarizer {
    async fn summarize(&self, texts: &[String], _max_tokens: usize) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(failure) = self.failure.get() {
            return failure.fail("echo summarizer").await;
        }
        Ok(format!("Summary of {} turns: {}", texts.len(), texts.join("; ")))
    }

    async fn is_available(&self) -> bool {
        self.failure.get().is_none()
    }

    fn name(&self) -> &'static str {
        "echo"
    }
}

/// In-memory index whose writes and reads can be made to fail
#[derive(Debug, Default)]
pub struct FaultyIndex {
    inner: InMemoryIndex,
    fail_upserts: AtomicBool,
    fail_queries: AtomicBool,
}

impl FaultyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_upserts(&self, fail: bool) {
        self.fail_upserts.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_queries(&self, fail: bool) {
        self.fail_queries.store(fail, Ordering::SeqCst);
    }

    fn check(flag: &AtomicBool, operation: &str) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(EngramError::TransientInfra(format!("index {operation} failed")));
        }
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for FaultyIndex {
    async fn upsert(&self, entry: VectorEntry) -> Result<()> {
        Self::check(&self.fail_upserts, "upsert")?;
        self.inner.upsert(entry).await
    }

    async fn query(&self, vector: &[f32], k: usize, filter: &VectorFilter) -> Result<Vec<ScoredId>> {
        Self::check(&self.fail_queries, "query")?;
        self.inner.query(vector, k, filter).await
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        self.inner.delete(id).await
    }

    async fn contains(&self, id: Uuid) -> Result<bool> {
        self.inner.contains(id).await
    }

    async fn count(&self) -> Result<usize> {
        self.inner.count().await
    }
}

/// A `MemoryService` over in-memory backends, with handles to every mock
pub struct TestHarness {
    pub service: MemoryService,
    pub store: Arc<InMemoryStore>,
    pub index: Arc<FaultyIndex>,
    pub embedder: Arc<MockEmbedder>,
    pub summarizer: Arc<EchoSummarizer>,
}

impl TestHarness {
    pub fn new(config: Config) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let index = Arc::new(FaultyIndex::new());
        let embedder = Arc::new(MockEmbedder::new(TEST_DIMENSION));
        let summarizer = Arc::new(EchoSummarizer::new());

        let policy = RetryPolicy::new(Duration::from_millis(200), 1, Duration::from_millis(1));
        let inference = InferenceClient::new(
            embedder.clone(),
            summarizer.clone(),
            policy.clone(),
            policy,
        )
        .with_dimension(TEST_DIMENSION);

        let service = MemoryService::new(store.clone(), index.clone(), Arc::new(inference), config);

        Self {
            service,
            store,
            index,
            embedder,
            summarizer,
        }
    }

    /// Config that compacts every unsummarized turn once a conversation
    /// passes `turn_threshold`
    pub fn compacting_config(turn_threshold: usize) -> Config {
        let mut config = Config::default();
        config.inference.embedding_dimension = TEST_DIMENSION;
        config.compaction.retention_window_hours = 24;
        config.compaction.turn_threshold = turn_threshold;
        config.compaction.keep_recent_turns = 0;
        config.compaction.batch_minimum = 1;
        config.ingestion.repair_grace_secs = 0;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::cosine_similarity;

    #[test]
    fn mock_embedding_is_deterministic() {
        let embedder = MockEmbedder::new(32);
        assert_eq!(embedder.vector_for("hello world"), embedder.vector_for("hello world"));
    }

    #[test]
    fn mock_embedding_tracks_word_overlap() {
        let embedder = MockEmbedder::new(256);
        let tea = embedder.vector_for("I like tea");
        let query = embedder.vector_for("what does the user like? tea?");
        let other = embedder.vector_for("quarterly revenue forecast");

        assert!(cosine_similarity(&tea, &query) > cosine_similarity(&tea, &other));
    }

    #[test]
    fn mock_embedding_of_punctuation_is_unit_length() {
        let vector = MockEmbedder::new(16).vector_for("?!");
        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn mock_failures_are_switchable() {
        let embedder = MockEmbedder::new(8);
        embedder.set_failure(Some(MockFailure::Reject));
        assert!(matches!(
            embedder.embed("x").await,
            Err(EngramError::ContentRejected(_))
        ));

        embedder.set_failure(None);
        assert!(embedder.embed("x").await.is_ok());
        assert_eq!(embedder.calls(), 2);
    }

    #[tokio::test]
    async fn echo_summarizer_keeps_order() {
        let summary = EchoSummarizer::new()
            .summarize(&["user: hi".to_string(), "user: I like tea".to_string()], 100)
            .await
            .unwrap();
        assert_eq!(summary, "Summary of 2 turns: user: hi; user: I like tea");
    }

    #[tokio::test]
    async fn faulty_index_fails_on_demand() {
        let index = FaultyIndex::new();
        let entry = VectorEntry {
            id: Uuid::new_v4(),
            conversation_id: "c".to_string(),
            vector: vec![1.0, 0.0],
        };

        index.set_fail_upserts(true);
        assert!(index.upsert(entry.clone()).await.is_err());

        index.set_fail_upserts(false);
        index.upsert(entry.clone()).await.unwrap();
        assert!(index.contains(entry.id).await.unwrap());
    }
}
