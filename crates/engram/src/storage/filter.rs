//! Query and filter types for the storage adapters
//!
//! `RecordQuery` scopes durable-store scans; `VectorFilter` scopes similarity
//! searches. Both are backend-agnostic: each adapter either translates them to
//! its own query language or evaluates `matches` in memory.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::memory::types::{EmbeddingStatus, MemoryKind, MemoryRecord};

/// Eviction state a query should match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionState {
    #[default]
    Live,
    Evicted,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// Oldest `created_at` first
    #[default]
    Chronological,
    /// Newest `created_at` first
    NewestFirst,
}

/// Scoped, paginated query over durable records.
///
/// All fields are optional; set fields combine with AND logic.
#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
    pub conversation_id: Option<String>,
    /// OR logic within the list
    pub kinds: Option<Vec<MemoryKind>>,
    /// OR logic within the list
    pub statuses: Option<Vec<EmbeddingStatus>>,
    pub eviction: EvictionState,
    /// Only records whose event time is at or before this instant
    pub created_before: Option<DateTime<Utc>>,
    /// Only records written at or before this instant
    pub recorded_before: Option<DateTime<Utc>>,
    /// `Some(false)` excludes flagged records
    pub flagged: Option<bool>,
    pub order: SortOrder,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl RecordQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_kinds(mut self, kinds: Vec<MemoryKind>) -> Self {
        self.kinds = Some(kinds);
        self
    }

    pub fn with_statuses(mut self, statuses: Vec<EmbeddingStatus>) -> Self {
        self.statuses = Some(statuses);
        self
    }

    pub fn with_eviction(mut self, eviction: EvictionState) -> Self {
        self.eviction = eviction;
        self
    }

    pub fn created_before(mut self, at: DateTime<Utc>) -> Self {
        self.created_before = Some(at);
        self
    }

    pub fn recorded_before(mut self, at: DateTime<Utc>) -> Self {
        self.recorded_before = Some(at);
        self
    }

    pub fn flagged(mut self, flagged: bool) -> Self {
        self.flagged = Some(flagged);
        self
    }

    pub fn order(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }

    pub fn paginate(mut self, limit: usize, offset: usize) -> Self {
        self.limit = Some(limit);
        self.offset = offset;
        self
    }

    /// Live raw turns of one conversation
    pub fn live_turns(conversation_id: impl Into<String>) -> Self {
        Self::new()
            .in_conversation(conversation_id)
            .with_kinds(vec![MemoryKind::Turn])
            .with_eviction(EvictionState::Live)
    }

    /// Evaluate the predicate part of the query (ignores ordering and paging)
    pub fn matches(&self, record: &MemoryRecord) -> bool {
        if let Some(ref conversation_id) = self.conversation_id {
            if &record.conversation_id != conversation_id {
                return false;
            }
        }
        if let Some(ref kinds) = self.kinds {
            if !kinds.contains(&record.kind) {
                return false;
            }
        }
        if let Some(ref statuses) = self.statuses {
            if !statuses.contains(&record.embedding_status) {
                return false;
            }
        }
        match self.eviction {
            EvictionState::Live if record.is_evicted() => return false,
            EvictionState::Evicted if !record.is_evicted() => return false,
            _ => {}
        }
        if let Some(at) = self.created_before {
            if record.created_at > at {
                return false;
            }
        }
        if let Some(at) = self.recorded_before {
            if record.recorded_at > at {
                return false;
            }
        }
        if let Some(flagged) = self.flagged {
            if record.flagged_for_review != flagged {
                return false;
            }
        }
        true
    }

    /// Apply ordering and pagination to records that already satisfy `matches`
    pub fn arrange(&self, mut records: Vec<MemoryRecord>) -> Vec<MemoryRecord> {
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        if self.order == SortOrder::NewestFirst {
            records.reverse();
        }
        let iter = records.into_iter().skip(self.offset);
        match self.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        }
    }
}

/// Scope for a similarity search.
#[derive(Debug, Clone, Default)]
pub struct VectorFilter {
    /// `None` searches every conversation
    pub conversation_id: Option<String>,
    pub exclude_ids: Vec<Uuid>,
}

impl VectorFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_conversation_id(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn excluding(mut self, ids: impl IntoIterator<Item = Uuid>) -> Self {
        self.exclude_ids.extend(ids);
        self
    }

    pub fn matches(&self, id: &Uuid, conversation_id: &str) -> bool {
        if let Some(ref scoped) = self.conversation_id {
            if scoped != conversation_id {
                return false;
            }
        }
        !self.exclude_ids.contains(id)
    }

    /// Build a SQL WHERE clause for LanceDB. Returns `None` if no filters are set.
    pub fn to_sql_clause(&self) -> Option<String> {
        let mut conditions = Vec::new();

        if let Some(ref conversation_id) = self.conversation_id {
            conditions.push(format!(
                "conversation_id = '{}'",
                escape_literal(conversation_id)
            ));
        }

        if !self.exclude_ids.is_empty() {
            let ids = self
                .exclude_ids
                .iter()
                .map(|id| format!("'{id}'"))
                .collect::<Vec<_>>()
                .join(", ");
            conditions.push(format!("id NOT IN ({ids})"));
        }

        if conditions.is_empty() {
            None
        } else {
            Some(conditions.join(" AND "))
        }
    }
}

/// Escape a string literal for embedding in a single-quoted SQL literal
pub fn escape_literal(value: &str) -> String {
    value.replace('\'', "''")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::Speaker;
    use chrono::Duration;

    #[test]
    fn test_empty_vector_filter() {
        assert!(VectorFilter::new().to_sql_clause().is_none());
    }

    #[test]
    fn test_conversation_scope_clause() {
        let sql = VectorFilter::new()
            .with_conversation_id("conv-123")
            .to_sql_clause()
            .unwrap();
        assert_eq!(sql, "conversation_id = 'conv-123'");
    }

    #[test]
    fn test_conversation_scope_is_escaped() {
        let sql = VectorFilter::new()
            .with_conversation_id("o'brien")
            .to_sql_clause()
            .unwrap();
        assert_eq!(sql, "conversation_id = 'o''brien'");
    }

    #[test]
    fn test_exclusion_clause() {
        let a = Uuid::nil();
        let sql = VectorFilter::new()
            .with_conversation_id("c")
            .excluding([a])
            .to_sql_clause()
            .unwrap();
        assert_eq!(
            sql,
            "conversation_id = 'c' AND id NOT IN ('00000000-0000-0000-0000-000000000000')"
        );
    }

    #[test]
    fn test_vector_filter_matches() {
        let id = Uuid::new_v4();
        let filter = VectorFilter::new().with_conversation_id("c1");
        assert!(filter.matches(&id, "c1"));
        assert!(!filter.matches(&id, "c2"));
        assert!(!filter.clone().excluding([id]).matches(&id, "c1"));
    }

    #[test]
    fn test_record_query_defaults_to_live() {
        let mut record = MemoryRecord::turn("c1", Speaker::User, "x", Utc::now());
        let query = RecordQuery::new();
        assert!(query.matches(&record));

        record.eviction = Some(crate::memory::types::EvictionMark {
            evicted_at: Utc::now(),
            superseded_by: Uuid::new_v4(),
        });
        assert!(!query.matches(&record));
        assert!(query.clone().with_eviction(EvictionState::Evicted).matches(&record));
        assert!(query.with_eviction(EvictionState::Any).matches(&record));
    }

    #[test]
    fn test_record_query_scoping() {
        let old = MemoryRecord::turn("c1", Speaker::User, "x", Utc::now() - Duration::days(2));
        let cutoff = Utc::now() - Duration::days(1);

        assert!(RecordQuery::live_turns("c1").created_before(cutoff).matches(&old));
        assert!(!RecordQuery::live_turns("c2").matches(&old));
        assert!(!RecordQuery::new().with_kinds(vec![MemoryKind::Summary]).matches(&old));
        assert!(
            !RecordQuery::new()
                .with_statuses(vec![EmbeddingStatus::Failed])
                .matches(&old)
        );
        assert!(!RecordQuery::new().flagged(true).matches(&old));
    }

    #[test]
    fn test_arrange_orders_and_paginates() {
        let base = Utc::now() - Duration::hours(5);
        let records: Vec<_> = (0..5)
            .map(|i| {
                MemoryRecord::turn("c1", Speaker::User, format!("t{i}"), base + Duration::hours(i))
            })
            .collect();

        let page = RecordQuery::new().paginate(2, 1).arrange(records.clone());
        assert_eq!(page.iter().map(|r| r.content.as_str()).collect::<Vec<_>>(), ["t1", "t2"]);

        let newest = RecordQuery::new()
            .order(SortOrder::NewestFirst)
            .paginate(1, 0)
            .arrange(records);
        assert_eq!(newest[0].content, "t4");
    }
}
