use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use recall_core::{
    CoveredRange, DurableStats, Message, MemoryError, Result, Role, ScoredMessage, Summary,
};

use crate::search;
use crate::traits::DurableStore;

const MESSAGE_COLUMNS: &str =
    "message_id, session_id, user_id, role, content, token_count, embedding, metadata, timestamp";

/// SQLite-backed durable tier.
///
/// Messages are keyed by a unique `message_id`; re-writing an id updates it
/// in place but keeps its original timestamp and insertion sequence.
/// Summaries are append-only and the newest row per session wins.
/// Statements run on the blocking pool against one shared connection.
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        info!(?path, "opening durable store");

        let conn = Connection::open(path).map_err(|e| MemoryError::Connection {
            backend: "sqlite".into(),
            reason: e.to_string(),
        })?;

        // WAL for concurrent readers
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(storage_err)?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id TEXT NOT NULL UNIQUE,
                session_id TEXT NOT NULL,
                user_id TEXT,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                token_count INTEGER NOT NULL,
                embedding BLOB,
                metadata TEXT NOT NULL DEFAULT '{}',
                timestamp TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS summaries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                content TEXT NOT NULL,
                token_count INTEGER NOT NULL,
                message_count INTEGER NOT NULL,
                source_tokens INTEGER NOT NULL,
                range_start TEXT NOT NULL,
                range_end TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, timestamp, seq);
            CREATE INDEX IF NOT EXISTS idx_summaries_session ON summaries(session_id, id);
            ",
        )
        .map_err(storage_err)?;

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for tests).
    pub fn open_in_memory() -> Result<Self> {
        Self::open(Path::new(":memory:"))
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let conn = db.lock();
            f(&conn)
        })
        .await
        .map_err(|e| MemoryError::Storage(format!("blocking task failed: {e}")))?
    }
}

fn storage_err(e: rusqlite::Error) -> MemoryError {
    MemoryError::Storage(e.to_string())
}

// Fixed-width UTC timestamps so text order is chronological order.
fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn conversion_err(idx: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

fn parse_ts(raw: &str, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn decode_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    let role: String = row.get(3)?;
    let role = role.parse::<Role>().map_err(|e| conversion_err(3, e))?;
    let token_count: i64 = row.get(5)?;
    let embedding: Option<Vec<u8>> = row.get(6)?;
    let metadata: String = row.get(7)?;
    let timestamp: String = row.get(8)?;

    Ok(Message {
        id: row.get(0)?,
        session_id: row.get(1)?,
        user_id: row.get(2)?,
        role,
        content: row.get(4)?,
        token_count: Some(token_count.max(0) as usize),
        embedding: embedding.as_deref().map(decode_embedding),
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
        timestamp: parse_ts(&timestamp, 8)?,
    })
}

fn row_to_summary(row: &Row<'_>) -> rusqlite::Result<Summary> {
    let start: String = row.get(5)?;
    let end: String = row.get(6)?;
    let created: String = row.get(7)?;
    Ok(Summary {
        session_id: row.get(0)?,
        content: row.get(1)?,
        token_count: row.get::<_, i64>(2)?.max(0) as usize,
        message_count: row.get::<_, i64>(3)?.max(0) as usize,
        source_tokens: row.get::<_, i64>(4)?.max(0) as usize,
        covered_range: CoveredRange {
            start: parse_ts(&start, 5)?,
            end: parse_ts(&end, 6)?,
        },
        created_at: parse_ts(&created, 7)?,
    })
}

fn collect_messages(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Message>> {
    let mut stmt = conn.prepare(sql).map_err(storage_err)?;
    let rows = stmt
        .query_map(params, row_to_message)
        .map_err(storage_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(storage_err)?;
    Ok(rows)
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn upsert(&self, message: &Message) -> Result<()> {
        let message = message.clone();
        self.with_conn(move |conn| {
            let embedding = message.embedding.as_deref().map(encode_embedding);
            let metadata = serde_json::to_string(&message.metadata)?;
            conn.execute(
                "INSERT INTO messages (message_id, session_id, user_id, role, content, token_count, embedding, metadata, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(message_id) DO UPDATE SET
                    role = excluded.role,
                    content = excluded.content,
                    user_id = excluded.user_id,
                    token_count = excluded.token_count,
                    embedding = excluded.embedding,
                    metadata = excluded.metadata",
                params![
                    message.id,
                    message.session_id,
                    message.user_id,
                    message.role.as_str(),
                    message.content,
                    message.estimate_tokens() as i64,
                    embedding,
                    metadata,
                    format_ts(&message.timestamp),
                ],
            )
            .map_err(storage_err)?;
            debug!(id = %message.id, session = %message.session_id, "message upserted");
            Ok(())
        })
        .await
    }

    async fn query_recent(&self, session_id: &str, limit: usize) -> Result<Vec<Message>> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE session_id = ?1
                 ORDER BY timestamp DESC, seq DESC LIMIT ?2"
            );
            let mut rows = collect_messages(conn, &sql, params![session_id, limit as i64])?;
            rows.reverse();
            Ok(rows)
        })
        .await
    }

    async fn query_prefix(&self, session_id: &str, limit: usize) -> Result<Vec<Message>> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE session_id = ?1
                 ORDER BY timestamp ASC, seq ASC LIMIT ?2"
            );
            collect_messages(conn, &sql, params![session_id, limit as i64])
        })
        .await
    }

    async fn delete_session(&self, session_id: &str) -> Result<()> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let removed = conn
                .execute("DELETE FROM messages WHERE session_id = ?1", params![session_id])
                .map_err(storage_err)?;
            conn.execute("DELETE FROM summaries WHERE session_id = ?1", params![session_id])
                .map_err(storage_err)?;
            info!(session = %session_id, removed, "durable session cleared");
            Ok(())
        })
        .await
    }

    async fn vector_search(
        &self,
        vector: &[f32],
        limit: usize,
        threshold: f32,
    ) -> Result<Vec<ScoredMessage>> {
        let query = vector.to_vec();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE embedding IS NOT NULL"
            );
            let candidates = collect_messages(conn, &sql, [])?;
            Ok(search::rank(&query, candidates, limit, threshold))
        })
        .await
    }

    async fn put_summary(&self, summary: &Summary) -> Result<()> {
        let summary = summary.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO summaries (session_id, content, token_count, message_count, source_tokens, range_start, range_end, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    summary.session_id,
                    summary.content,
                    summary.token_count as i64,
                    summary.message_count as i64,
                    summary.source_tokens as i64,
                    format_ts(&summary.covered_range.start),
                    format_ts(&summary.covered_range.end),
                    format_ts(&summary.created_at),
                ],
            )
            .map_err(storage_err)?;
            Ok(())
        })
        .await
    }

    async fn get_summary(&self, session_id: &str) -> Result<Option<Summary>> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT session_id, content, token_count, message_count, source_tokens, range_start, range_end, created_at
                 FROM summaries WHERE session_id = ?1 ORDER BY id DESC LIMIT 1",
                params![session_id],
                row_to_summary,
            )
            .optional()
            .map_err(storage_err)
        })
        .await
    }

    async fn aggregate_stats(&self, session_id: &str) -> Result<DurableStats> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let (count, tokens, users, size, oldest, latest) = conn
                .query_row(
                    "SELECT COUNT(*),
                            COALESCE(SUM(token_count), 0),
                            COUNT(DISTINCT user_id),
                            COALESCE(SUM(LENGTH(CAST(content AS BLOB)) + COALESCE(LENGTH(embedding), 0)), 0),
                            MIN(timestamp),
                            MAX(timestamp)
                     FROM messages WHERE (?1 = '' OR session_id = ?1)",
                    params![session_id],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, i64>(3)?,
                            row.get::<_, Option<String>>(4)?,
                            row.get::<_, Option<String>>(5)?,
                        ))
                    },
                )
                .map_err(storage_err)?;

            let oldest = oldest.map(|s| parse_ts(&s, 4)).transpose().map_err(storage_err)?;
            let latest = latest.map(|s| parse_ts(&s, 5)).transpose().map_err(storage_err)?;

            Ok(DurableStats {
                message_count: count.max(0) as usize,
                total_tokens: tokens.max(0) as usize,
                unique_users: users.max(0) as usize,
                storage_size: size.max(0) as u64,
                oldest_message: oldest,
                latest_message: latest,
            })
        })
        .await
    }

    async fn ping(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map_err(|e| MemoryError::Connection {
                    backend: "sqlite".into(),
                    reason: e.to_string(),
                })?;
            Ok(())
        })
        .await
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}
