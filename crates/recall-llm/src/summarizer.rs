use async_trait::async_trait;
use recall_core::{Message, MemoryError, Result, Role};
use tracing::debug;

const SUMMARY_PROMPT: &str =
    "Summarize the following conversation concisely, preserving key information and context:";

/// Produces a compacted text for a run of messages.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Summarize `messages` (oldest first) in roughly `token_budget` tokens.
    async fn summarize(&self, messages: &[Message], token_budget: usize) -> Result<String>;

    fn name(&self) -> &str;
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::User => "User",
        Role::Assistant => "Assistant",
        Role::System => "System",
    }
}

/// Render messages as a `[Role]: text` transcript, capping each message.
pub fn transcript(messages: &[Message], per_message_chars: usize) -> String {
    let mut out = String::new();
    for msg in messages {
        let truncated: String = msg.content.chars().take(per_message_chars).collect();
        if truncated.is_empty() {
            continue;
        }
        out.push_str(&format!("[{}]: {}\n", role_label(msg.role), truncated));
    }
    out
}

/// Chat-completions summarizer for any OpenAI-compatible endpoint.
pub struct OpenAiSummarizer {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: f32,
}

impl OpenAiSummarizer {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: "https://api.openai.com/v1".into(),
            model: "gpt-4o-mini".into(),
            temperature: 0.3,
        }
    }

    pub fn with_model(mut self, model: String) -> Self {
        self.model = model;
        self
    }

    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

#[async_trait]
impl Summarizer for OpenAiSummarizer {
    async fn summarize(&self, messages: &[Message], token_budget: usize) -> Result<String> {
        if messages.is_empty() {
            return Ok(String::new());
        }

        debug!(model = %self.model, count = messages.len(), token_budget, "requesting summary");

        let body = serde_json::json!({
            "model": &self.model,
            "messages": [
                { "role": "system", "content": SUMMARY_PROMPT },
                { "role": "user", "content": transcript(messages, 1000) },
            ],
            "max_tokens": token_budget,
            "temperature": self.temperature,
        });

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| MemoryError::Summarizer(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(MemoryError::Summarizer(format!("HTTP {status}: {text}")));
        }

        let data: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| MemoryError::Summarizer(e.to_string()))?;

        let content = data["choices"][0]["message"]["content"]
            .as_str()
            .map(str::trim)
            .unwrap_or("");

        if content.is_empty() {
            return Err(MemoryError::Summarizer(
                "completion contained no summary text".into(),
            ));
        }
        Ok(content.to_string())
    }

    fn name(&self) -> &str {
        "openai"
    }
}

/// Summarizer that needs no model: keeps the head of each message and
/// truncates the whole transcript to the token budget.
#[derive(Debug, Default, Clone)]
pub struct ExtractiveSummarizer;

impl ExtractiveSummarizer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Summarizer for ExtractiveSummarizer {
    async fn summarize(&self, messages: &[Message], token_budget: usize) -> Result<String> {
        if messages.is_empty() {
            return Ok(String::new());
        }
        // ~4 chars per token, same heuristic as token estimation.
        let max_chars = token_budget.saturating_mul(4).max(64);
        let header = format!("[Compacted {} earlier messages]\n", messages.len());
        let body: String = transcript(messages, 500)
            .chars()
            .take(max_chars.saturating_sub(header.len()))
            .collect();
        Ok(format!("{}{}", header, body.trim_end()))
    }

    fn name(&self) -> &str {
        "extractive"
    }
}
