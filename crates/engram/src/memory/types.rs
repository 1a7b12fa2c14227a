//! Memory record types
//!
//! `MemoryRecord` is the unit stored in the durable store. Raw conversation
//! turns and the summaries that replace them share one shape; summaries point
//! back at the turns they were derived from through `source_ids`.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::EngramError;

/// A single unit of stored conversational content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Stable identifier, shared with the vector index entry
    pub id: Uuid,
    /// Thread this record belongs to
    pub conversation_id: String,
    /// Raw turn or derived summary
    pub kind: MemoryKind,
    /// Who produced the content
    pub speaker: Speaker,
    /// Text payload, stored exactly as ingested
    pub content: String,
    /// Time of the original event
    pub created_at: DateTime<Utc>,
    /// Time the record was written
    pub recorded_at: DateTime<Utc>,
    /// Records this one was derived from, in chronological order
    pub source_ids: Vec<Uuid>,
    /// Whether a vector has been written for this record
    pub embedding_status: EmbeddingStatus,
    /// Last time `embedding_status` changed
    pub status_updated_at: DateTime<Utc>,
    /// Set once a summary has replaced this record
    pub eviction: Option<EvictionMark>,
    /// Failed summarization attempts that included this record
    pub compaction_attempts: u32,
    /// Excluded from compaction until someone looks at it
    pub flagged_for_review: bool,
}

impl MemoryRecord {
    /// Create a raw conversation turn awaiting indexing
    pub fn turn(
        conversation_id: impl Into<String>,
        speaker: Speaker,
        content: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let now = now_micros();
        Self {
            id: Uuid::new_v4(),
            conversation_id: conversation_id.into(),
            kind: MemoryKind::Turn,
            speaker,
            content: content.into(),
            created_at: created_at.trunc_subsecs(6),
            recorded_at: now,
            source_ids: Vec::new(),
            embedding_status: EmbeddingStatus::Pending,
            status_updated_at: now,
            eviction: None,
            compaction_attempts: 0,
            flagged_for_review: false,
        }
    }

    /// Create a summary of `sources`, dated at the newest source event
    pub fn summary(
        conversation_id: impl Into<String>,
        content: impl Into<String>,
        sources: &[MemoryRecord],
    ) -> Self {
        let now = now_micros();
        let created_at = sources.iter().map(|s| s.created_at).max().unwrap_or(now);
        Self {
            id: Uuid::new_v4(),
            conversation_id: conversation_id.into(),
            kind: MemoryKind::Summary,
            speaker: Speaker::System,
            content: content.into(),
            created_at,
            recorded_at: now,
            source_ids: sources.iter().map(|s| s.id).collect(),
            embedding_status: EmbeddingStatus::Pending,
            status_updated_at: now,
            eviction: None,
            compaction_attempts: 0,
            flagged_for_review: false,
        }
    }

    pub fn is_evicted(&self) -> bool {
        self.eviction.is_some()
    }

    pub fn is_summary(&self) -> bool {
        self.kind == MemoryKind::Summary
    }

    /// Eligible for similarity search results
    pub fn is_searchable(&self) -> bool {
        !self.is_evicted() && self.embedding_status != EmbeddingStatus::Failed
    }

    /// Rendered as `speaker: text`, the form fed to the summarizer
    pub fn transcript_line(&self) -> String {
        format!("{}: {}", self.speaker, self.content)
    }
}

/// Current time at the microsecond precision the stores persist
pub fn now_micros() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Raw turn or derived summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    Turn,
    Summary,
}

/// Embedding lifecycle of a record.
///
/// `Pending -> Indexed | Failed`; the repair sweep moves `Failed` and stale
/// `Pending` records to `Indexed`, and consistency verification moves an
/// `Indexed` record whose vector has gone missing back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingStatus {
    Pending,
    Indexed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    #[default]
    User,
    Assistant,
    System,
}

/// Soft-delete marker set when a summary supersedes the record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvictionMark {
    pub evicted_at: DateTime<Utc>,
    pub superseded_by: Uuid,
}

macro_rules! string_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = EngramError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.to_ascii_lowercase().as_str() {
                    $($text => Ok(Self::$variant),)+
                    other => Err(EngramError::InvalidInput(format!(
                        concat!("unknown ", stringify!($ty), " '{}'"),
                        other
                    ))),
                }
            }
        }
    };
}

string_enum!(MemoryKind { Turn => "turn", Summary => "summary" });
string_enum!(EmbeddingStatus { Pending => "pending", Indexed => "indexed", Failed => "failed" });
string_enum!(Speaker { User => "user", Assistant => "assistant", System => "system" });
