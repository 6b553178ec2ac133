//! # recall-core
//!
//! Core types and the error taxonomy shared by every Recall crate: messages,
//! summaries, statistics, and the `MemoryError` classification that decides
//! which failures surface to callers and which are recovered locally.

pub mod error;
pub mod message;
pub mod types;

pub use error::{MemoryError, Result};
pub use message::{estimate_text_tokens, Message, Role};
pub use types::*;
