//! # recall-config
//!
//! Configuration for the Recall memory subsystem. Reads from `recall.toml`,
//! then environment variables, in that precedence order, and validates the
//! result before anything is constructed from it.

pub mod loader;
pub mod logging;
pub mod schema;

pub use loader::ConfigLoader;
pub use logging::init_tracing;
pub use schema::{
    BackgroundConfig, CacheConfig, CompactionConfig, CompactionTrigger, ConfigWarning,
    DurableConfig, EmbeddingConfig, EmbeddingProviderKind, LoggingConfig, MemoryConfig,
    MemoryMode, RecallConfig, SearchConfig, SummarizerConfig, SummarizerKind, WarningSeverity,
};
