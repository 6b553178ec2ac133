use std::sync::Arc;
use tracing::info;

use recall_config::{EmbeddingProviderKind, RecallConfig, SummarizerKind};
use recall_core::{MemoryError, Result};
use recall_llm::{
    EmbeddingGateway, ExtractiveSummarizer, OllamaEmbedding, OpenAiEmbedding, OpenAiSummarizer,
    Summarizer,
};

use crate::cache::SessionCache;
use crate::coordinator::MemoryCoordinator;
use crate::durable::SqliteStore;

/// Build a coordinator with the bundled backends selected by `config`:
/// [`SessionCache`] for the cache tier, [`SqliteStore`] at
/// `durable.db_path` for the durable tier, and the configured embedding
/// gateway and summarizer.
pub async fn from_config(config: &RecallConfig) -> Result<MemoryCoordinator> {
    let mode = config.resolved_mode();
    info!(mode = %mode, "bootstrapping memory");

    let mut builder = MemoryCoordinator::builder(config.clone());

    if mode.uses_cache() {
        builder = builder.with_cache(Arc::new(SessionCache::with_shards(config.cache.shards)));
    }
    if mode.uses_durable() {
        builder = builder.with_durable(Arc::new(SqliteStore::open(&config.durable.db_path)?));
    }
    if let Some(gateway) = embedding_gateway(config)? {
        builder = builder.with_embedding(gateway);
    }
    builder = builder.with_summarizer(summarizer(config)?);

    builder.build().await
}

fn require_key(key: &Option<String>, field: &str) -> Result<String> {
    key.clone().ok_or_else(|| MemoryError::ConfigValidation {
        field: field.to_string(),
        reason: "an API key is required for the openai provider".into(),
    })
}

fn embedding_gateway(config: &RecallConfig) -> Result<Option<Arc<dyn EmbeddingGateway>>> {
    let cfg = &config.embedding;
    let gateway: Arc<dyn EmbeddingGateway> = match cfg.provider {
        EmbeddingProviderKind::None => return Ok(None),
        EmbeddingProviderKind::OpenAi => {
            let mut gateway = OpenAiEmbedding::new(require_key(&cfg.api_key, "embedding.api_key")?)
                .with_model(cfg.model.clone(), cfg.dimensions);
            if let Some(url) = &cfg.base_url {
                gateway = gateway.with_base_url(url.clone());
            }
            Arc::new(gateway)
        }
        EmbeddingProviderKind::Ollama => {
            let mut gateway = OllamaEmbedding::new(&cfg.model, cfg.dimensions);
            if let Some(url) = &cfg.base_url {
                gateway = gateway.with_base_url(url.clone());
            }
            Arc::new(gateway)
        }
    };
    Ok(Some(gateway))
}

fn summarizer(config: &RecallConfig) -> Result<Arc<dyn Summarizer>> {
    let cfg = &config.summarizer;
    Ok(match cfg.provider {
        SummarizerKind::Extractive => Arc::new(ExtractiveSummarizer::new()),
        SummarizerKind::OpenAi => {
            let mut summarizer = OpenAiSummarizer::new(require_key(&cfg.api_key, "summarizer.api_key")?)
                .with_model(cfg.model.clone())
                .with_temperature(cfg.temperature);
            if let Some(url) = &cfg.base_url {
                summarizer = summarizer.with_base_url(url.clone());
            }
            Arc::new(summarizer)
        }
    })
}
