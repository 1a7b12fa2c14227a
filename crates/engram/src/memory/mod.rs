//! Memory records and the engines that write, compact and read them

pub mod compaction;
pub mod context;
pub mod ingestion;
pub mod repair;
pub mod retrieval;
pub mod types;

pub use compaction::{BatchOutcome, CompactionEngine, CompactionReport, EvictionOutcome};
pub use context::{estimate_tokens, format_context};
pub use ingestion::{Indexer, IngestionPipeline};
pub use repair::{ConsistencyReport, RepairReport, RepairSweep};
pub use retrieval::{RetrievalEngine, RetrievedMemory, recency_score};
pub use types::{EmbeddingStatus, EvictionMark, MemoryKind, MemoryRecord, Speaker};
