use std::time::Duration;

use thiserror::Error;

use crate::types::Tier;

/// Unified error type for the Recall memory subsystem.
#[derive(Error, Debug)]
pub enum MemoryError {
    // ── Construction errors ────────────────────────────────────
    #[error("config error: {0}")]
    Config(String),

    #[error("config validation failed: {field}: {reason}")]
    ConfigValidation { field: String, reason: String },

    #[error("{backend} backend unreachable: {reason}")]
    Connection { backend: String, reason: String },

    // ── Live-call errors ───────────────────────────────────────
    /// A non-authoritative tier failed; the call continued on the authoritative tier.
    /// Only ever logged, never returned from the coordinator.
    #[error("degraded operation: {tier} tier failed: {reason}")]
    Degraded { tier: Tier, reason: String },

    /// The durable tier could not confirm a write. Always surfaced.
    #[error("durable write failed: {0}")]
    AuthoritativeWrite(String),

    #[error("{operation} is not supported in {mode} mode")]
    Unsupported { operation: String, mode: String },

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("compaction already in progress for session {session_id}")]
    CompactionInProgress { session_id: String },

    #[error("memory is shutting down")]
    ShuttingDown,

    // ── Backend errors (classified by the coordinator) ─────────
    #[error("storage error: {0}")]
    Storage(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("summarizer error: {0}")]
    Summarizer(String),

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl MemoryError {
    /// Shorthand for a degraded-tier record.
    pub fn degraded(tier: Tier, reason: impl std::fmt::Display) -> Self {
        MemoryError::Degraded {
            tier,
            reason: reason.to_string(),
        }
    }

    pub fn unsupported(operation: impl Into<String>, mode: impl std::fmt::Display) -> Self {
        MemoryError::Unsupported {
            operation: operation.into(),
            mode: mode.to_string(),
        }
    }

    /// True for errors that mean "the system was built wrong" rather than
    /// "a backend misbehaved at runtime".
    pub fn is_fatal_at_construction(&self) -> bool {
        matches!(
            self,
            MemoryError::Config(_)
                | MemoryError::ConfigValidation { .. }
                | MemoryError::Connection { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, MemoryError>;
