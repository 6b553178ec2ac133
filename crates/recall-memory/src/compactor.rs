use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use recall_config::{CompactionConfig, CompactionTrigger};
use recall_core::{
    CoveredRange, DurableStats, MemoryError, Result, Summary, estimate_text_tokens,
};
use recall_llm::Summarizer;

use crate::deadline::bounded;
use crate::traits::DurableStore;

/// What a compaction attempt did.
#[derive(Debug, Clone, PartialEq)]
pub enum CompactionOutcome {
    Compacted(Summary),
    /// Another compaction for the session holds the lock.
    InFlight,
    /// The session had no messages.
    Empty,
    /// The session was cleared while the compaction ran; nothing was written.
    Cancelled,
}

#[derive(Default)]
struct Slots {
    sessions: DashMap<String, CancellationToken>,
    released: Notify,
}

/// Exclusive claim on a session's compaction slot. Released on drop.
///
/// While a slot is held no other compaction can start for the session.
pub struct CompactionSlot {
    slots: Arc<Slots>,
    session_id: String,
    cancel: CancellationToken,
}

impl CompactionSlot {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl Drop for CompactionSlot {
    fn drop(&mut self) {
        self.slots.sessions.remove(&self.session_id);
        self.slots.released.notify_waiters();
    }
}

/// Summarizes the oldest stretch of a session into the durable tier.
///
/// At most one compaction per session runs at a time: every run holds the
/// session's [`CompactionSlot`]. Failures leave the stored messages
/// untouched; the session simply has no new summary, and the next
/// qualifying write tries again.
#[derive(Clone)]
pub struct Compactor {
    durable: Arc<dyn DurableStore>,
    summarizer: Arc<dyn Summarizer>,
    config: CompactionConfig,
    op_timeout: Duration,
    slots: Arc<Slots>,
}

impl Compactor {
    pub fn new(
        durable: Arc<dyn DurableStore>,
        summarizer: Arc<dyn Summarizer>,
        config: CompactionConfig,
        op_timeout: Duration,
    ) -> Self {
        Self {
            durable,
            summarizer,
            config,
            op_timeout,
            slots: Arc::new(Slots::default()),
        }
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    pub fn is_in_flight(&self, session_id: &str) -> bool {
        self.slots.sessions.contains_key(session_id)
    }

    /// Whether the part of the session the current summary does not cover
    /// has reached the threshold.
    pub fn needs_compaction(&self, stats: &DurableStats, summary: Option<&Summary>) -> bool {
        if !self.config.enabled || self.config.summarize_threshold == 0 {
            return false;
        }
        let uncovered = match self.config.trigger {
            CompactionTrigger::Messages => {
                let covered = summary.map(|s| s.message_count).unwrap_or(0);
                stats.message_count.saturating_sub(covered)
            }
            CompactionTrigger::Tokens => {
                let covered = summary.map(|s| s.source_tokens).unwrap_or(0);
                stats.total_tokens.saturating_sub(covered)
            }
        };
        uncovered >= self.config.summarize_threshold
    }

    /// Claim the session's slot if no compaction holds it.
    pub fn try_claim(&self, session_id: &str) -> Option<CompactionSlot> {
        match self.slots.sessions.entry(session_id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let cancel = CancellationToken::new();
                slot.insert(cancel.clone());
                Some(CompactionSlot {
                    slots: Arc::clone(&self.slots),
                    session_id: session_id.to_string(),
                    cancel,
                })
            }
        }
    }

    /// Claim the session's slot, cancelling a compaction that holds it and
    /// waiting for it to let go. A cancelled compaction writes nothing.
    pub async fn claim_exclusive(&self, session_id: &str) -> CompactionSlot {
        loop {
            let released = self.slots.released.notified();
            if let Some(slot) = self.try_claim(session_id) {
                return slot;
            }
            let holder = self.slots.sessions.get(session_id).map(|t| t.clone());
            if let Some(token) = holder {
                debug!(session = %session_id, "cancelling in-flight compaction");
                token.cancel();
            }
            released.await;
        }
    }

    /// Summarize the first `covered` messages of the session with the
    /// configured token budget.
    pub async fn compact(&self, session_id: &str, covered: usize) -> Result<CompactionOutcome> {
        self.compact_with_budget(session_id, covered, self.config.summary_token_budget)
            .await
    }

    pub async fn compact_with_budget(
        &self,
        session_id: &str,
        covered: usize,
        token_budget: usize,
    ) -> Result<CompactionOutcome> {
        let Some(slot) = self.try_claim(session_id) else {
            debug!(session = %session_id, "compaction already in flight");
            return Ok(CompactionOutcome::InFlight);
        };
        self.compact_claimed(slot, covered, token_budget).await
    }

    /// Run a compaction under a slot the caller already holds. The slot is
    /// released when this returns.
    pub async fn compact_claimed(
        &self,
        slot: CompactionSlot,
        covered: usize,
        token_budget: usize,
    ) -> Result<CompactionOutcome> {
        let session_id = slot.session_id.as_str();

        let messages = tokio::select! {
            _ = slot.cancel.cancelled() => return Ok(CompactionOutcome::Cancelled),
            read = bounded(
                "durable query_prefix",
                self.op_timeout,
                self.durable.query_prefix(session_id, covered),
            ) => read?,
        };
        let (Some(first), Some(last)) = (messages.first(), messages.last()) else {
            return Ok(CompactionOutcome::Empty);
        };
        let covered_range = CoveredRange {
            start: first.timestamp,
            end: last.timestamp,
        };

        let content = tokio::select! {
            _ = slot.cancel.cancelled() => {
                debug!(session = %session_id, "compaction cancelled during summarization");
                return Ok(CompactionOutcome::Cancelled);
            }
            summarized = self.summarizer.summarize(&messages, token_budget) => {
                summarized.map_err(|e| match e {
                    MemoryError::Summarizer(_) => e,
                    other => MemoryError::Summarizer(other.to_string()),
                })?
            }
        };

        let summary = Summary {
            session_id: session_id.to_string(),
            token_count: estimate_text_tokens(&content),
            content,
            message_count: messages.len(),
            source_tokens: messages.iter().map(|m| m.estimate_tokens()).sum(),
            covered_range,
            created_at: Utc::now(),
        };

        // Past this point a clear waits for the slot, so the write lands
        // before its delete or not at all.
        if slot.cancel.is_cancelled() {
            return Ok(CompactionOutcome::Cancelled);
        }
        bounded(
            "durable put_summary",
            self.op_timeout,
            self.durable.put_summary(&summary),
        )
        .await?;

        info!(
            session = %session_id,
            messages = summary.message_count,
            summarizer = self.summarizer.name(),
            "session compacted"
        );
        Ok(CompactionOutcome::Compacted(summary))
    }
}
