//! # recall-llm
//!
//! Call boundaries to the models Recall depends on: an embedding gateway
//! for similarity search and a summarizer for history compaction.

pub mod embedding;
pub mod mock;
pub mod summarizer;

pub use embedding::{EmbeddingGateway, OllamaEmbedding, OpenAiEmbedding};
pub use mock::{MockEmbedding, MockSummarizer};
pub use summarizer::{ExtractiveSummarizer, OpenAiSummarizer, Summarizer};
