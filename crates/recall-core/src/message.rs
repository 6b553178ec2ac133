use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::MemoryError;

/// A single conversation turn.
///
/// `id` is unique within the durable store: writing a message whose `id`
/// already exists updates it in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Caller-supplied token count. Falls back to an estimate when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Free-form extras (model, temperature, channel, ...).
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(MemoryError::InvalidMessage(format!("unknown role '{other}'"))),
        }
    }
}

impl Message {
    /// Create a message with a fresh id, stamped now.
    pub fn new(session_id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            session_id: session_id.into(),
            user_id: None,
            timestamp: Utc::now(),
            token_count: None,
            embedding: None,
            metadata: Default::default(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_token_count(mut self, tokens: usize) -> Self {
        self.token_count = Some(tokens);
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Check the fields the tiers key on.
    pub fn validate(&self) -> Result<(), MemoryError> {
        if self.session_id.trim().is_empty() {
            return Err(MemoryError::InvalidMessage("session id is required".into()));
        }
        if self.id.trim().is_empty() {
            return Err(MemoryError::InvalidMessage("message id is required".into()));
        }
        Ok(())
    }

    /// Token count for budgeting: the caller's value if present, otherwise
    /// ~4 chars per token plus a small role overhead, minimum 1.
    pub fn estimate_tokens(&self) -> usize {
        self.token_count
            .unwrap_or_else(|| estimate_text_tokens(&self.content))
    }

    /// Whether this message can take part in similarity search.
    pub fn is_searchable(&self) -> bool {
        self.embedding.as_ref().is_some_and(|e| !e.is_empty())
    }
}

/// Heuristic token estimate for raw text.
pub fn estimate_text_tokens(text: &str) -> usize {
    // Role overhead (~4 tokens for role markers)
    ((text.len() + 16) / 4).max(1)
}
