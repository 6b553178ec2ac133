//! Narrow interfaces the coordinator consumes. Any backend that implements
//! them can stand in for the bundled [`SessionCache`](crate::SessionCache)
//! and [`SqliteStore`](crate::SqliteStore).

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use recall_core::{DurableStats, Message, Result, ScoredMessage, Summary};

/// Live usage of a cache backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub sessions: usize,
    pub messages: usize,
}

/// Volatile, bounded, per-session recency buffer.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Append `message` to the session, evicting the oldest entries beyond
    /// `max_len` and resetting the session's TTL. Returns the session length
    /// after the push.
    async fn push_recent(
        &self,
        session_id: &str,
        message: Message,
        max_len: usize,
        ttl: Duration,
    ) -> Result<usize>;

    /// The newest `limit` messages, oldest first. Missing or expired
    /// sessions read as empty.
    async fn read_recent(&self, session_id: &str, limit: usize) -> Result<Vec<Message>>;

    async fn delete_session(&self, session_id: &str) -> Result<()>;

    async fn session_len(&self, session_id: &str) -> Result<usize>;

    /// Fill an empty (or expired) session with `messages`, oldest first.
    /// A session that already holds live messages is left alone, so a late
    /// repopulation never clobbers newer writes. Returns whether it filled.
    async fn populate(
        &self,
        session_id: &str,
        messages: Vec<Message>,
        max_len: usize,
        ttl: Duration,
    ) -> Result<bool> {
        if self.session_len(session_id).await? > 0 {
            return Ok(false);
        }
        for message in messages {
            self.push_recent(session_id, message, max_len, ttl).await?;
        }
        Ok(true)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn stats(&self) -> Result<CacheStats>;

    fn name(&self) -> &str;
}

/// Authoritative store of every message and summary.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Insert, or update in place when `message.id` already exists.
    async fn upsert(&self, message: &Message) -> Result<()>;

    /// The newest `limit` messages of the session, oldest first.
    async fn query_recent(&self, session_id: &str, limit: usize) -> Result<Vec<Message>>;

    /// The oldest `limit` messages of the session, oldest first.
    async fn query_prefix(&self, session_id: &str, limit: usize) -> Result<Vec<Message>>;

    /// Remove all messages and summaries of the session.
    async fn delete_session(&self, session_id: &str) -> Result<()>;

    /// Messages whose embedding scores at least `threshold` against
    /// `vector`, best first, at most `limit`.
    async fn vector_search(
        &self,
        vector: &[f32],
        limit: usize,
        threshold: f32,
    ) -> Result<Vec<ScoredMessage>>;

    /// Append a summary. The newest one per session is authoritative.
    async fn put_summary(&self, summary: &Summary) -> Result<()>;

    async fn get_summary(&self, session_id: &str) -> Result<Option<Summary>>;

    /// Aggregates for the session; an empty `session_id` aggregates the
    /// whole store.
    async fn aggregate_stats(&self, session_id: &str) -> Result<DurableStats>;

    async fn ping(&self) -> Result<()>;

    fn name(&self) -> &str;
}
