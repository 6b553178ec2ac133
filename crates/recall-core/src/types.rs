use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::Message;

/// One of the storage layers (plus the external call boundaries the
/// coordinator can degrade around).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Cache,
    Durable,
    Embedding,
    Summarizer,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Tier::Cache => "cache",
            Tier::Durable => "durable",
            Tier::Embedding => "embedding",
            Tier::Summarizer => "summarizer",
        };
        f.write_str(name)
    }
}

/// Start and end timestamps of the messages a summary covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoveredRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// A compacted view of a contiguous prefix of a session's history.
///
/// Summaries are never mutated; a later summary for the same session
/// supersedes earlier ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub session_id: String,
    pub content: String,
    /// Estimated tokens of `content`.
    pub token_count: usize,
    /// Number of messages covered, counted from the start of the session.
    pub message_count: usize,
    /// Estimated tokens of the raw messages covered.
    pub source_tokens: usize,
    pub covered_range: CoveredRange,
    pub created_at: DateTime<Utc>,
}

/// A durable record ranked against a query vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredMessage {
    pub message: Message,
    /// Cosine similarity in [-1, 1].
    pub score: f32,
    /// `1 - score`, kept for callers that think in distances.
    pub distance: f32,
}

impl ScoredMessage {
    pub fn new(message: Message, score: f32) -> Self {
        Self {
            message,
            score,
            distance: 1.0 - score,
        }
    }
}

/// Aggregates the durable tier reports for a session (or for all sessions
/// when the session id is empty).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DurableStats {
    pub message_count: usize,
    pub total_tokens: usize,
    pub unique_users: usize,
    pub storage_size: u64,
    pub oldest_message: Option<DateTime<Utc>>,
    pub latest_message: Option<DateTime<Utc>>,
}

/// Derived, read-only usage view over both tiers. Not persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub session_id: String,
    /// Messages held by the durable tier (0 when there is none).
    pub total_messages: usize,
    /// Messages currently held by the cache tier.
    pub cached_messages: usize,
    /// Resolved message count: durable wins whenever it answered.
    pub session_messages: usize,
    pub total_tokens: usize,
    /// Tokens of the bounded context: summary tokens plus uncovered raw tokens.
    pub active_tokens: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oldest_message: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_message: Option<DateTime<Utc>>,
    pub unique_users: usize,
    pub storage_size: u64,
    pub has_summary: bool,
}
