use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use recall_core::{Message, Result};

use crate::traits::{CacheStats, CacheStore};

// Upper bound for deadlines when `now + ttl` would overflow.
const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

struct SessionBuffer {
    messages: VecDeque<Message>,
    expires_at: Instant,
}

impl SessionBuffer {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

fn deadline(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl)
        .or_else(|| now.checked_add(MAX_TTL))
        .unwrap_or(now)
}

/// In-process cache tier: one bounded FIFO buffer per session.
///
/// Sessions live in a sharded [`DashMap`], so writers to different sessions
/// rarely contend and writers to the same session are serialized by the
/// shard lock. Within a session, order is insertion order, not timestamp
/// order. Expired sessions read as absent and are dropped lazily.
#[derive(Clone, Default)]
pub struct SessionCache {
    sessions: Arc<DashMap<String, SessionBuffer>>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific shard count (rounded up to a power of two). `0` keeps
    /// the dashmap default.
    pub fn with_shards(shards: usize) -> Self {
        if shards == 0 {
            return Self::new();
        }
        Self {
            sessions: Arc::new(DashMap::with_shard_amount(shards.next_power_of_two().max(2))),
        }
    }

    /// Append a message, or replace the buffered message with the same id
    /// in its slot. Resets the session TTL. Returns the new length.
    pub fn push(&self, session_id: &str, message: Message, max_len: usize, ttl: Duration) -> usize {
        let now = Instant::now();
        let mut buffer = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionBuffer {
                messages: VecDeque::with_capacity(max_len.min(64)),
                expires_at: deadline(now, ttl),
            });

        if buffer.is_expired(now) {
            buffer.messages.clear();
        }

        if let Some(slot) = buffer.messages.iter_mut().find(|m| m.id == message.id) {
            *slot = message;
        } else {
            buffer.messages.push_back(message);
            while buffer.messages.len() > max_len {
                buffer.messages.pop_front();
            }
        }
        buffer.expires_at = deadline(now, ttl);
        buffer.messages.len()
    }

    /// The newest `limit` live messages, oldest first.
    pub fn read(&self, session_id: &str, limit: usize) -> Vec<Message> {
        let now = Instant::now();
        let expired = match self.sessions.get(session_id) {
            None => return vec![],
            Some(buffer) if !buffer.is_expired(now) => {
                let skip = buffer.messages.len().saturating_sub(limit);
                return buffer.messages.iter().skip(skip).cloned().collect();
            }
            Some(_) => true,
        };
        if expired {
            self.sessions.remove_if(session_id, |_, b| b.is_expired(now));
        }
        vec![]
    }

    pub fn len(&self, session_id: &str) -> usize {
        let now = Instant::now();
        self.sessions
            .get(session_id)
            .filter(|b| !b.is_expired(now))
            .map(|b| b.messages.len())
            .unwrap_or(0)
    }

    pub fn remove(&self, session_id: &str) -> bool {
        self.sessions.remove(session_id).is_some()
    }

    /// Install `messages` as the session buffer unless a live, non-empty
    /// buffer already exists. Returns whether it was installed.
    pub fn populate(
        &self,
        session_id: &str,
        messages: Vec<Message>,
        max_len: usize,
        ttl: Duration,
    ) -> bool {
        let now = Instant::now();
        let mut buffer = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionBuffer {
                messages: VecDeque::new(),
                expires_at: now,
            });
        if !buffer.is_expired(now) && !buffer.messages.is_empty() {
            return false;
        }
        let skip = messages.len().saturating_sub(max_len);
        buffer.messages = messages.into_iter().skip(skip).collect();
        buffer.expires_at = deadline(now, ttl);
        true
    }

    /// Drop every expired session. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.sessions.len();
        self.sessions.retain(|_, b| !b.is_expired(now));
        let removed = before.saturating_sub(self.sessions.len());
        if removed > 0 {
            debug!(removed, "purged expired cache sessions");
        }
        removed
    }

    pub fn snapshot_stats(&self) -> CacheStats {
        let now = Instant::now();
        self.sessions
            .iter()
            .filter(|entry| !entry.is_expired(now))
            .fold(CacheStats::default(), |mut acc, entry| {
                acc.sessions += 1;
                acc.messages += entry.messages.len();
                acc
            })
    }
}

#[async_trait]
impl CacheStore for SessionCache {
    async fn push_recent(
        &self,
        session_id: &str,
        message: Message,
        max_len: usize,
        ttl: Duration,
    ) -> Result<usize> {
        Ok(self.push(session_id, message, max_len, ttl))
    }

    async fn read_recent(&self, session_id: &str, limit: usize) -> Result<Vec<Message>> {
        Ok(self.read(session_id, limit))
    }

    async fn delete_session(&self, session_id: &str) -> Result<()> {
        self.remove(session_id);
        Ok(())
    }

    async fn session_len(&self, session_id: &str) -> Result<usize> {
        Ok(self.len(session_id))
    }

    async fn populate(
        &self,
        session_id: &str,
        messages: Vec<Message>,
        max_len: usize,
        ttl: Duration,
    ) -> Result<bool> {
        Ok(SessionCache::populate(self, session_id, messages, max_len, ttl))
    }

    async fn stats(&self) -> Result<CacheStats> {
        Ok(self.snapshot_stats())
    }

    fn name(&self) -> &str {
        "session-cache"
    }
}
