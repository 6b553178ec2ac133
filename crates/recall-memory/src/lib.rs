//! # recall-memory
//!
//! Tiered conversation memory for AI agents:
//!
//! - **Cache tier**: bounded per-session recency buffers with a sliding TTL (in-memory, volatile).
//! - **Durable tier**: every message, optionally with an embedding, plus compaction summaries (SQLite).
//! - **Coordinator**: routes reads and writes across the tiers and degrades when one fails.
//!
//! The durable tier is authoritative. The cache only ever speeds up reads of
//! the most recent turns, and anything it loses is rebuilt from durable on
//! the next miss.

pub mod background;
pub mod bootstrap;
pub mod cache;
pub mod compactor;
pub mod context;
pub mod coordinator;
pub mod durable;
pub mod search;
pub mod traits;

mod deadline;

pub use background::BackgroundTasks;
pub use bootstrap::from_config;
pub use cache::SessionCache;
pub use compactor::{CompactionOutcome, CompactionSlot, Compactor};
pub use context::ContextWindow;
pub use coordinator::{MemoryCoordinator, MemoryCoordinatorBuilder, Tiers};
pub use durable::SqliteStore;
pub use search::{cosine_similarity, rank};
pub use traits::{CacheStats, CacheStore, DurableStore};
