use serde::Serialize;

use recall_core::{Message, Role, Summary};

/// Bounded prompt context for a session: the current summary (if any)
/// followed by the newest messages it does not cover.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContextWindow {
    pub session_id: String,
    pub summary: Option<Summary>,
    /// Uncovered messages that fit the budget, oldest first.
    pub messages: Vec<Message>,
    /// Estimated tokens of summary plus messages.
    pub token_count: usize,
    pub token_budget: usize,
    /// Uncovered messages left out for lack of budget.
    pub omitted: usize,
}

impl ContextWindow {
    /// Keep the newest contiguous run of `uncovered` (oldest first) that fits
    /// in `token_budget` after the summary's own tokens.
    pub fn assemble(
        session_id: &str,
        summary: Option<Summary>,
        uncovered: Vec<Message>,
        token_budget: usize,
    ) -> Self {
        let summary_tokens = summary.as_ref().map(|s| s.token_count).unwrap_or(0);
        let available = token_budget.saturating_sub(summary_tokens);

        let mut used = 0usize;
        let mut keep_from = uncovered.len();
        for (idx, msg) in uncovered.iter().enumerate().rev() {
            let tokens = msg.estimate_tokens();
            if used + tokens > available {
                break;
            }
            used += tokens;
            keep_from = idx;
        }

        let omitted = keep_from;
        let messages: Vec<Message> = uncovered.into_iter().skip(keep_from).collect();

        Self {
            session_id: session_id.to_string(),
            summary,
            messages,
            token_count: summary_tokens + used,
            token_budget,
            omitted,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.summary.is_none() && self.messages.is_empty()
    }

    /// Flatten into a message list, the summary rendered as a leading
    /// system message.
    pub fn to_messages(&self) -> Vec<Message> {
        let mut out = Vec::with_capacity(self.messages.len() + 1);
        if let Some(summary) = &self.summary {
            let text = format!(
                "[Conversation summary: {} earlier messages]\n{}",
                summary.message_count, summary.content
            );
            out.push(
                Message::new(&self.session_id, Role::System, text)
                    .with_id(format!("summary:{}:{}", self.session_id, summary.message_count))
                    .with_timestamp(summary.covered_range.end)
                    .with_token_count(summary.token_count),
            );
        }
        out.extend(self.messages.iter().cloned());
        out
    }
}
