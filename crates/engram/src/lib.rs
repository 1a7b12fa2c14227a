//! Engram - durable, self-compacting conversational memory
//!
//! Turns are written to a durable store, embedded into a rebuildable vector
//! index, periodically summarized and evicted, and retrieved by similarity
//! and recency within a token budget.

pub mod api;
pub mod config;
pub mod error;
pub mod inference;
pub mod memory;
pub mod service;
pub mod storage;
pub mod testing;
pub mod worker;

pub use error::EngramError;
pub use service::MemoryService;
