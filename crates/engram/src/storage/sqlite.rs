//! SQLite-backed durable store.
//!
//! One connection guarded by a mutex, driven from the blocking thread pool so
//! async callers never stall the runtime. Timestamps are stored as
//! microseconds since the epoch; `source_ids` as a JSON array.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use uuid::Uuid;

use crate::error::{EngramError, Result};
use crate::memory::types::{EmbeddingStatus, EvictionMark, MemoryRecord, now_micros};
use crate::storage::filter::{EvictionState, RecordQuery, SortOrder};
use crate::storage::{DurableStore, StoreStats};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    speaker TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    recorded_at INTEGER NOT NULL,
    source_ids TEXT NOT NULL DEFAULT '[]',
    embedding_status TEXT NOT NULL,
    status_updated_at INTEGER NOT NULL,
    evicted_at INTEGER,
    superseded_by TEXT,
    compaction_attempts INTEGER NOT NULL DEFAULT 0,
    flagged_for_review INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_memories_scope
    ON memories (conversation_id, kind, evicted_at, created_at);
CREATE INDEX IF NOT EXISTS idx_memories_status
    ON memories (embedding_status, recorded_at);
CREATE TABLE IF NOT EXISTS leases (
    key TEXT PRIMARY KEY,
    holder TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);
"#;

const COLUMNS: &str = "id, conversation_id, kind, speaker, content, created_at, recorded_at, \
     source_ids, embedding_status, status_updated_at, evicted_at, superseded_by, \
     compaction_attempts, flagged_for_review";

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open (or create) the database file, creating parent directories as needed.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                EngramError::Fatal(format!(
                    "Failed to create database directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
        let conn = Connection::open(path).map_err(|e| {
            EngramError::Fatal(format!("Failed to open database {}: {e}", path.display()))
        })?;
        Self::init(conn)
    }

    /// Private in-memory database, mostly for tests
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| EngramError::Fatal("SQLite connection mutex poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| EngramError::Fatal(format!("SQLite task failed: {e}")))?
    }
}

fn micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: i64 = row.get(idx)?;
    DateTime::<Utc>::from_timestamp_micros(raw).ok_or_else(|| {
        conversion_error(
            idx,
            EngramError::Storage(format!("timestamp {raw} out of range")),
        )
    })
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<MemoryRecord> {
    let source_ids: String = row.get(7)?;
    let source_ids: Vec<Uuid> =
        serde_json::from_str(&source_ids).map_err(|e| conversion_error(7, e))?;

    let evicted_at: Option<i64> = row.get(10)?;
    let eviction = match evicted_at {
        Some(_) => {
            let superseded_by: Option<String> = row.get(11)?;
            let superseded_by = superseded_by
                .map(|s| s.parse::<Uuid>())
                .transpose()
                .map_err(|e| conversion_error(11, e))?
                .unwrap_or_else(Uuid::nil);
            Some(EvictionMark {
                evicted_at: timestamp_column(row, 10)?,
                superseded_by,
            })
        }
        None => None,
    };

    Ok(MemoryRecord {
        id: parse_column(row, 0)?,
        conversation_id: row.get(1)?,
        kind: parse_column(row, 2)?,
        speaker: parse_column(row, 3)?,
        content: row.get(4)?,
        created_at: timestamp_column(row, 5)?,
        recorded_at: timestamp_column(row, 6)?,
        source_ids,
        embedding_status: parse_column(row, 8)?,
        status_updated_at: timestamp_column(row, 9)?,
        eviction,
        compaction_attempts: row.get(12)?,
        flagged_for_review: row.get(13)?,
    })
}

/// Translate the predicate part of a query into a WHERE clause with positional params.
fn where_clause(query: &RecordQuery) -> (String, Vec<Value>) {
    let mut conditions: Vec<String> = Vec::new();
    let mut values: Vec<Value> = Vec::new();

    if let Some(ref conversation_id) = query.conversation_id {
        conditions.push("conversation_id = ?".to_string());
        values.push(Value::Text(conversation_id.clone()));
    }

    if let Some(ref kinds) = query.kinds {
        if kinds.is_empty() {
            conditions.push("0".to_string());
        } else {
            let marks = vec!["?"; kinds.len()].join(", ");
            conditions.push(format!("kind IN ({marks})"));
            values.extend(kinds.iter().map(|k| Value::Text(k.as_str().to_string())));
        }
    }

    if let Some(ref statuses) = query.statuses {
        if statuses.is_empty() {
            conditions.push("0".to_string());
        } else {
            let marks = vec!["?"; statuses.len()].join(", ");
            conditions.push(format!("embedding_status IN ({marks})"));
            values.extend(statuses.iter().map(|s| Value::Text(s.as_str().to_string())));
        }
    }

    match query.eviction {
        EvictionState::Live => conditions.push("evicted_at IS NULL".to_string()),
        EvictionState::Evicted => conditions.push("evicted_at IS NOT NULL".to_string()),
        EvictionState::Any => {}
    }

    if let Some(at) = query.created_before {
        conditions.push("created_at <= ?".to_string());
        values.push(Value::Integer(micros(at)));
    }

    if let Some(at) = query.recorded_before {
        conditions.push("recorded_at <= ?".to_string());
        values.push(Value::Integer(micros(at)));
    }

    if let Some(flagged) = query.flagged {
        conditions.push("flagged_for_review = ?".to_string());
        values.push(Value::Integer(i64::from(flagged)));
    }

    if conditions.is_empty() {
        (String::new(), values)
    } else {
        (format!(" WHERE {}", conditions.join(" AND ")), values)
    }
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn insert(&self, record: &MemoryRecord) -> Result<()> {
        let record = record.clone();
        self.with_conn(move |conn| {
            let source_ids = serde_json::to_string(&record.source_ids)?;
            let tx = conn.transaction()?;
            let inserted = tx.execute(
                &format!(
                    "INSERT OR IGNORE INTO memories ({COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
                ),
                params![
                    record.id.to_string(),
                    record.conversation_id,
                    record.kind.as_str(),
                    record.speaker.as_str(),
                    record.content,
                    micros(record.created_at),
                    micros(record.recorded_at),
                    source_ids,
                    record.embedding_status.as_str(),
                    micros(record.status_updated_at),
                    record.eviction.map(|e| micros(e.evicted_at)),
                    record.eviction.map(|e| e.superseded_by.to_string()),
                    record.compaction_attempts,
                    record.flagged_for_review,
                ],
            )?;
            if inserted == 0 {
                return Err(EngramError::ConsistencyConflict(format!(
                    "record {} already exists",
                    record.id
                )));
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get(&self, id: Uuid) -> Result<Option<MemoryRecord>> {
        self.with_conn(move |conn| {
            let record = conn
                .query_row(
                    &format!("SELECT {COLUMNS} FROM memories WHERE id = ?1"),
                    params![id.to_string()],
                    row_to_record,
                )
                .optional()?;
            Ok(record)
        })
        .await
    }

    async fn get_many(&self, ids: &[Uuid]) -> Result<Vec<MemoryRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids = ids.to_vec();
        self.with_conn(move |conn| {
            let marks = vec!["?"; ids.len()].join(", ");
            let mut stmt =
                conn.prepare(&format!("SELECT {COLUMNS} FROM memories WHERE id IN ({marks})"))?;
            let rows = stmt.query_map(
                params_from_iter(ids.iter().map(|id| id.to_string())),
                row_to_record,
            )?;

            let mut by_id = HashMap::new();
            for row in rows {
                let record = row?;
                by_id.insert(record.id, record);
            }
            Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
        })
        .await
    }

    async fn query(&self, query: &RecordQuery) -> Result<Vec<MemoryRecord>> {
        let query = query.clone();
        self.with_conn(move |conn| {
            let (clause, mut values) = where_clause(&query);
            let direction = match query.order {
                SortOrder::Chronological => "ASC",
                SortOrder::NewestFirst => "DESC",
            };
            let mut sql = format!(
                "SELECT {COLUMNS} FROM memories{clause} \
                 ORDER BY created_at {direction}, id {direction}"
            );
            if query.limit.is_some() || query.offset > 0 {
                sql.push_str(" LIMIT ? OFFSET ?");
                let limit = query.limit.map(|l| l as i64).unwrap_or(-1);
                values.push(Value::Integer(limit));
                values.push(Value::Integer(query.offset as i64));
            }

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(values), row_to_record)?;
            let mut records = Vec::new();
            for row in rows {
                records.push(row?);
            }
            Ok(records)
        })
        .await
    }

    async fn count(&self, query: &RecordQuery) -> Result<usize> {
        let query = query.clone();
        self.with_conn(move |conn| {
            let (clause, values) = where_clause(&query);
            let count: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM memories{clause}"),
                params_from_iter(values),
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
        .await
    }

    async fn set_embedding_status(&self, id: Uuid, status: EmbeddingStatus) -> Result<bool> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE memories SET embedding_status = ?1, status_updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), micros(now_micros()), id.to_string()],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn mark_evicted(
        &self,
        ids: &[Uuid],
        superseded_by: Uuid,
        evicted_at: DateTime<Utc>,
    ) -> Result<Vec<Uuid>> {
        let ids = ids.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut evicted = Vec::new();
            {
                let mut stmt = tx.prepare(
                    "UPDATE memories SET evicted_at = ?1, superseded_by = ?2 \
                     WHERE id = ?3 AND evicted_at IS NULL",
                )?;
                for id in &ids {
                    let changed = stmt.execute(params![
                        micros(evicted_at),
                        superseded_by.to_string(),
                        id.to_string()
                    ])?;
                    if changed > 0 {
                        evicted.push(*id);
                    }
                }
            }
            tx.commit()?;
            Ok(evicted)
        })
        .await
    }

    async fn record_compaction_failure(
        &self,
        ids: &[Uuid],
        max_attempts: u32,
    ) -> Result<Vec<Uuid>> {
        let ids = ids.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut flagged = Vec::new();
            {
                let mut bump = tx.prepare(
                    "UPDATE memories SET compaction_attempts = compaction_attempts + 1 \
                     WHERE id = ?1 AND flagged_for_review = 0 \
                     RETURNING compaction_attempts",
                )?;
                let mut flag =
                    tx.prepare("UPDATE memories SET flagged_for_review = 1 WHERE id = ?1")?;
                for id in &ids {
                    let attempts: Option<u32> = bump
                        .query_row(params![id.to_string()], |row| row.get(0))
                        .optional()?;
                    if matches!(attempts, Some(n) if n >= max_attempts) {
                        flag.execute(params![id.to_string()])?;
                        flagged.push(*id);
                    }
                }
            }
            tx.commit()?;
            Ok(flagged)
        })
        .await
    }

    async fn set_review_flag(&self, id: Uuid, flagged: bool) -> Result<bool> {
        self.with_conn(move |conn| {
            let changed = if flagged {
                conn.execute(
                    "UPDATE memories SET flagged_for_review = 1 WHERE id = ?1",
                    params![id.to_string()],
                )?
            } else {
                conn.execute(
                    "UPDATE memories SET flagged_for_review = 0, compaction_attempts = 0 \
                     WHERE id = ?1",
                    params![id.to_string()],
                )?
            };
            Ok(changed > 0)
        })
        .await
    }

    async fn conversation_turn_counts(&self) -> Result<Vec<(String, usize)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT conversation_id, COUNT(*) FROM memories \
                 WHERE kind = 'turn' AND evicted_at IS NULL \
                 GROUP BY conversation_id ORDER BY conversation_id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
            })?;
            let mut counts = Vec::new();
            for row in rows {
                counts.push(row?);
            }
            Ok(counts)
        })
        .await
    }

    async fn try_acquire_lease(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let key = key.to_string();
        let holder = holder.to_string();
        self.with_conn(move |conn| {
            let now = micros(Utc::now());
            let expires_at = now.saturating_add(ttl.as_micros() as i64);
            let changed = conn.execute(
                "INSERT INTO leases (key, holder, expires_at) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(key) DO UPDATE SET holder = excluded.holder, \
                 expires_at = excluded.expires_at \
                 WHERE leases.holder = excluded.holder OR leases.expires_at <= ?4",
                params![key, holder, expires_at, now],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn release_lease(&self, key: &str, holder: &str) -> Result<()> {
        let key = key.to_string();
        let holder = holder.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM leases WHERE key = ?1 AND holder = ?2",
                params![key, holder],
            )?;
            Ok(())
        })
        .await
    }

    async fn stats(&self) -> Result<StoreStats> {
        self.with_conn(|conn| {
            let stats = conn.query_row(
                "SELECT COUNT(*), \
                 COALESCE(SUM(kind = 'turn'), 0), \
                 COALESCE(SUM(kind = 'summary'), 0), \
                 COALESCE(SUM(evicted_at IS NOT NULL), 0), \
                 COALESCE(SUM(embedding_status = 'pending'), 0), \
                 COALESCE(SUM(embedding_status = 'indexed'), 0), \
                 COALESCE(SUM(embedding_status = 'failed'), 0), \
                 COALESCE(SUM(flagged_for_review), 0), \
                 COUNT(DISTINCT conversation_id) \
                 FROM memories",
                [],
                |row| {
                    let n = |i: usize| row.get::<_, i64>(i).map(|v| v as usize);
                    Ok(StoreStats {
                        total: n(0)?,
                        turns: n(1)?,
                        summaries: n(2)?,
                        evicted: n(3)?,
                        pending: n(4)?,
                        indexed: n(5)?,
                        failed: n(6)?,
                        flagged: n(7)?,
                        conversations: n(8)?,
                    })
                },
            )?;
            Ok(stats)
        })
        .await
    }
}
