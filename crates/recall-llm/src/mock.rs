//! Deterministic gateways for testing.
//!
//! Neither mock makes HTTP calls; both can be switched into a failing state
//! to exercise degraded paths.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use recall_core::{Message, MemoryError, Result};

use crate::embedding::EmbeddingGateway;
use crate::summarizer::Summarizer;

/// Hashed bag-of-words embeddings: texts sharing words get similar vectors,
/// identical texts get identical ones.
///
/// # Example
/// ```
/// use recall_llm::mock::MockEmbedding;
/// let gateway = MockEmbedding::new(32);
/// gateway.set_failing(true);
/// ```
#[derive(Clone)]
pub struct MockEmbedding {
    dims: usize,
    failing: Arc<AtomicBool>,
    calls: Arc<AtomicUsize>,
}

impl MockEmbedding {
    pub fn new(dims: usize) -> Self {
        Self {
            dims: dims.max(1),
            failing: Arc::new(AtomicBool::new(false)),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Make every subsequent call fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of `embed` calls received.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The vector this gateway produces for `text`.
    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let idx = (fnv1a(&word.to_lowercase()) % self.dims as u64) as usize;
            v[idx] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

fn fnv1a(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in s.bytes() {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

#[async_trait]
impl EmbeddingGateway for MockEmbedding {
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(MemoryError::Embedding("mock: embedding unavailable".into()));
        }
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Summarizer returning queued responses, then a fixed fallback text.
#[derive(Clone)]
pub struct MockSummarizer {
    responses: Arc<Mutex<VecDeque<String>>>,
    /// Message counts of every request received (for assertions in tests).
    pub requests: Arc<Mutex<Vec<usize>>>,
    failing: Arc<AtomicBool>,
    delay: Option<Duration>,
}

impl MockSummarizer {
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::new())),
            requests: Arc::new(Mutex::new(vec![])),
            failing: Arc::new(AtomicBool::new(false)),
            delay: None,
        }
    }

    /// Queue a summary text.
    pub fn with_response(self, text: &str) -> Self {
        self.responses.lock().push_back(text.to_string());
        self
    }

    /// Sleep before answering, to hold a compaction in flight.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of summarize calls received.
    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }
}

impl Default for MockSummarizer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Summarizer for MockSummarizer {
    async fn summarize(&self, messages: &[Message], _token_budget: usize) -> Result<String> {
        self.requests.lock().push(messages.len());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(MemoryError::Summarizer("mock: summarizer unavailable".into()));
        }
        let queued = self.responses.lock().pop_front();
        Ok(queued.unwrap_or_else(|| format!("(mock summary of {} messages)", messages.len())))
    }

    fn name(&self) -> &str {
        "mock"
    }
}
