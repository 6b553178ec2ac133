use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use recall_config::{MemoryMode, RecallConfig, SearchConfig};
use recall_core::{
    DurableStats, MemoryError, Message, Result, ScoredMessage, Stats, Summary, Tier,
};
use recall_llm::{EmbeddingGateway, ExtractiveSummarizer, Summarizer};

use crate::background::BackgroundTasks;
use crate::compactor::{CompactionOutcome, Compactor};
use crate::context::ContextWindow;
use crate::deadline::bounded;
use crate::traits::{CacheStats, CacheStore, DurableStore};

/// The storage layout, fixed at construction.
#[derive(Clone)]
pub enum Tiers {
    CacheOnly {
        cache: Arc<dyn CacheStore>,
    },
    DurableOnly {
        durable: Arc<dyn DurableStore>,
    },
    Tiered {
        cache: Arc<dyn CacheStore>,
        durable: Arc<dyn DurableStore>,
    },
}

impl Tiers {
    pub fn mode(&self) -> MemoryMode {
        match self {
            Tiers::CacheOnly { .. } => MemoryMode::CacheOnly,
            Tiers::DurableOnly { .. } => MemoryMode::DurableOnly,
            Tiers::Tiered { .. } => MemoryMode::Tiered,
        }
    }

    pub fn cache(&self) -> Option<&Arc<dyn CacheStore>> {
        match self {
            Tiers::CacheOnly { cache } | Tiers::Tiered { cache, .. } => Some(cache),
            Tiers::DurableOnly { .. } => None,
        }
    }

    pub fn durable(&self) -> Option<&Arc<dyn DurableStore>> {
        match self {
            Tiers::DurableOnly { durable } | Tiers::Tiered { durable, .. } => Some(durable),
            Tiers::CacheOnly { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
struct Settings {
    max_session_messages: usize,
    session_ttl: Duration,
    op_timeout: Duration,
    search: SearchConfig,
    context_token_budget: usize,
    shutdown_grace: Duration,
}

/// Assembles a [`MemoryCoordinator`] from a config and the backends to use.
pub struct MemoryCoordinatorBuilder {
    config: RecallConfig,
    cache: Option<Arc<dyn CacheStore>>,
    durable: Option<Arc<dyn DurableStore>>,
    embedding: Option<Arc<dyn EmbeddingGateway>>,
    summarizer: Option<Arc<dyn Summarizer>>,
}

impl MemoryCoordinatorBuilder {
    pub fn new(config: RecallConfig) -> Self {
        Self {
            config,
            cache: None,
            durable: None,
            embedding: None,
            summarizer: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_durable(mut self, durable: Arc<dyn DurableStore>) -> Self {
        self.durable = Some(durable);
        self
    }

    pub fn with_embedding(mut self, embedding: Arc<dyn EmbeddingGateway>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// Validate the config, pick the mode, and ping every backend.
    ///
    /// An explicit `memory.mode` wins; otherwise the mode follows from the
    /// backends supplied. Missing backends are a [`MemoryError::Config`],
    /// unreachable ones a [`MemoryError::Connection`].
    pub async fn build(self) -> Result<MemoryCoordinator> {
        let Self {
            config,
            cache,
            durable,
            embedding,
            summarizer,
        } = self;

        for warning in config.validate().map_err(MemoryError::Config)? {
            warn!("{}", warning);
        }

        let mode = match config.memory.mode {
            Some(mode) => mode,
            None => match (cache.is_some(), durable.is_some()) {
                (true, true) => MemoryMode::Tiered,
                (false, true) => MemoryMode::DurableOnly,
                (true, false) => MemoryMode::CacheOnly,
                (false, false) => {
                    return Err(MemoryError::Config(
                        "no cache or durable backend configured".into(),
                    ));
                }
            },
        };

        let missing = |backend: &str| {
            MemoryError::Config(format!("{mode} mode requires a {backend} backend"))
        };
        let tiers = match mode {
            MemoryMode::CacheOnly => Tiers::CacheOnly {
                cache: cache.ok_or_else(|| missing("cache"))?,
            },
            MemoryMode::DurableOnly => Tiers::DurableOnly {
                durable: durable.ok_or_else(|| missing("durable"))?,
            },
            MemoryMode::Tiered => Tiers::Tiered {
                cache: cache.ok_or_else(|| missing("cache"))?,
                durable: durable.ok_or_else(|| missing("durable"))?,
            },
        };

        let op_timeout = config.memory.operation_timeout();
        if let Some(cache) = tiers.cache() {
            bounded("cache ping", op_timeout, cache.ping())
                .await
                .map_err(|e| connection_error(cache.name(), e))?;
        }
        if let Some(durable) = tiers.durable() {
            bounded("durable ping", op_timeout, durable.ping())
                .await
                .map_err(|e| connection_error(durable.name(), e))?;
        }

        let compactor = tiers.durable().map(|durable| {
            let summarizer: Arc<dyn Summarizer> = match summarizer {
                Some(summarizer) => summarizer,
                None => Arc::new(ExtractiveSummarizer::new()),
            };
            Compactor::new(
                Arc::clone(durable),
                summarizer,
                config.compaction.clone(),
                op_timeout,
            )
        });

        info!(
            mode = %mode,
            embedding = embedding.as_ref().map(|e| e.name()).unwrap_or("none"),
            "memory coordinator ready"
        );

        Ok(MemoryCoordinator {
            tiers,
            embedding,
            compactor,
            background: BackgroundTasks::new(config.background.max_concurrent_tasks),
            settings: Settings {
                max_session_messages: config.memory.max_session_messages,
                session_ttl: config.memory.session_ttl(),
                op_timeout,
                search: config.search.clone(),
                context_token_budget: config.compaction.context_token_budget,
                shutdown_grace: Duration::from_millis(config.background.shutdown_grace_ms),
            },
        })
    }
}

fn connection_error(backend: &str, e: MemoryError) -> MemoryError {
    match e {
        MemoryError::Connection { .. } => e,
        other => MemoryError::Connection {
            backend: backend.to_string(),
            reason: other.to_string(),
        },
    }
}

fn authoritative(e: MemoryError) -> MemoryError {
    match e {
        MemoryError::AuthoritativeWrite(_) => e,
        other => MemoryError::AuthoritativeWrite(other.to_string()),
    }
}

/// Routes conversation memory across the cache and durable tiers.
///
/// Writes go to the durable tier first and fail if it fails; the cache is
/// written best-effort afterwards. Reads try the cache and fall back to
/// durable, refilling the cache in the background. Compaction is checked
/// after every durable write and runs in the background.
pub struct MemoryCoordinator {
    tiers: Tiers,
    embedding: Option<Arc<dyn EmbeddingGateway>>,
    compactor: Option<Compactor>,
    background: BackgroundTasks,
    settings: Settings,
}

impl MemoryCoordinator {
    pub fn builder(config: RecallConfig) -> MemoryCoordinatorBuilder {
        MemoryCoordinatorBuilder::new(config)
    }

    pub fn mode(&self) -> MemoryMode {
        self.tiers.mode()
    }

    pub fn tiers(&self) -> &Tiers {
        &self.tiers
    }

    pub fn background(&self) -> &BackgroundTasks {
        &self.background
    }

    pub fn compactor(&self) -> Option<&Compactor> {
        self.compactor.as_ref()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.background.is_shut_down() {
            return Err(MemoryError::ShuttingDown);
        }
        Ok(())
    }

    fn ensure_session(session_id: &str) -> Result<()> {
        if session_id.trim().is_empty() {
            return Err(MemoryError::InvalidMessage("session id is empty".into()));
        }
        Ok(())
    }

    // ── Writes ─────────────────────────────────────────────────

    /// Record a conversation turn.
    pub async fn add_message(&self, message: Message) -> Result<()> {
        self.ensure_open()?;
        message.validate()?;

        match &self.tiers {
            Tiers::CacheOnly { cache } => {
                let session_id = message.session_id.clone();
                bounded(
                    "cache push_recent",
                    self.settings.op_timeout,
                    cache.push_recent(
                        &session_id,
                        message,
                        self.settings.max_session_messages,
                        self.settings.session_ttl,
                    ),
                )
                .await?;
                Ok(())
            }
            Tiers::DurableOnly { durable } => {
                let message = self.prepare_embedding(message).await;
                self.write_durable(durable, &message).await?;
                if let Some(stats) = self.durable_stats(durable, &message.session_id).await {
                    self.maybe_compact(durable, &message.session_id, &stats).await;
                }
                Ok(())
            }
            Tiers::Tiered { cache, durable } => {
                let message = self.prepare_embedding(message).await;
                self.write_durable(durable, &message).await?;
                let session_id = message.session_id.clone();
                let stats = self.durable_stats(durable, &session_id).await;
                self.push_cache(cache, message, stats.as_ref()).await;
                if let Some(stats) = stats {
                    self.maybe_compact(durable, &session_id, &stats).await;
                }
                Ok(())
            }
        }
    }

    /// Long-term write: durable tier only (with embedding), skipping the
    /// cache. In cache-only mode this is [`add_message`](Self::add_message).
    pub async fn store(&self, message: Message) -> Result<()> {
        let Some(durable) = self.tiers.durable() else {
            return self.add_message(message).await;
        };
        self.ensure_open()?;
        message.validate()?;

        let message = self.prepare_embedding(message).await;
        self.write_durable(durable, &message).await?;
        if let Some(stats) = self.durable_stats(durable, &message.session_id).await {
            self.maybe_compact(durable, &message.session_id, &stats).await;
        }
        Ok(())
    }

    async fn write_durable(&self, durable: &Arc<dyn DurableStore>, message: &Message) -> Result<()> {
        bounded(
            "durable upsert",
            self.settings.op_timeout,
            durable.upsert(message),
        )
        .await
        .map_err(authoritative)?;
        debug!(id = %message.id, session = %message.session_id, "durable write confirmed");
        Ok(())
    }

    /// Attach an embedding when a gateway is configured. Gateway failures
    /// and wrong-sized vectors leave the message unembedded.
    async fn prepare_embedding(&self, mut message: Message) -> Message {
        let Some(gateway) = &self.embedding else {
            return message;
        };
        let expected = gateway.dimensions();

        if let Some(actual) = message.embedding.as_ref().map(Vec::len) {
            if actual != expected {
                let e = MemoryError::DimensionMismatch { expected, actual };
                warn!(id = %message.id, error = %MemoryError::degraded(Tier::Embedding, &e), "dropping supplied embedding");
                message.embedding = None;
            }
            return message;
        }
        if message.content.trim().is_empty() {
            return message;
        }

        match bounded(
            "embedding",
            self.settings.op_timeout,
            gateway.embed_one(&message.content),
        )
        .await
        {
            Ok(vector) if vector.len() == expected => message.embedding = Some(vector),
            Ok(vector) => {
                let e = MemoryError::DimensionMismatch {
                    expected,
                    actual: vector.len(),
                };
                warn!(id = %message.id, error = %MemoryError::degraded(Tier::Embedding, &e), "storing message without embedding");
            }
            Err(e) => {
                warn!(id = %message.id, error = %MemoryError::degraded(Tier::Embedding, &e), "storing message without embedding");
            }
        }
        message
    }

    async fn durable_stats(
        &self,
        durable: &Arc<dyn DurableStore>,
        session_id: &str,
    ) -> Option<DurableStats> {
        match bounded(
            "durable aggregate_stats",
            self.settings.op_timeout,
            durable.aggregate_stats(session_id),
        )
        .await
        {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!(session = %session_id, error = %MemoryError::degraded(Tier::Durable, &e), "could not read session counts after write");
                None
            }
        }
    }

    /// Best-effort cache write. If the cache ends up out of step with the
    /// durable count (expired, evicted, or partially filled), the session
    /// is dropped from the cache so the next read rebuilds it from durable.
    async fn push_cache(
        &self,
        cache: &Arc<dyn CacheStore>,
        message: Message,
        stats: Option<&DurableStats>,
    ) {
        let session_id = message.session_id.clone();
        let cap = self.settings.max_session_messages;
        let pushed = bounded(
            "cache push_recent",
            self.settings.op_timeout,
            cache.push_recent(&session_id, message, cap, self.settings.session_ttl),
        )
        .await;

        let stale = match (pushed, stats) {
            (Ok(len), Some(stats)) if len != stats.message_count.min(cap) => {
                debug!(session = %session_id, cached = len, durable = stats.message_count, "cache out of step with durable");
                true
            }
            (Ok(_), _) => false,
            (Err(e), _) => {
                warn!(session = %session_id, error = %MemoryError::degraded(Tier::Cache, &e), "cache write failed, continuing on durable tier");
                true
            }
        };

        if stale {
            if let Err(e) = bounded(
                "cache delete_session",
                self.settings.op_timeout,
                cache.delete_session(&session_id),
            )
            .await
            {
                warn!(session = %session_id, error = %MemoryError::degraded(Tier::Cache, &e), "could not invalidate cached session");
            }
        }
    }

    /// Schedule a compaction if the uncovered part of the session crossed
    /// the threshold. The session's slot is claimed before anything else,
    /// so while one compaction is pending or running every later check is
    /// deferred.
    async fn maybe_compact(
        &self,
        durable: &Arc<dyn DurableStore>,
        session_id: &str,
        stats: &DurableStats,
    ) {
        let Some(compactor) = &self.compactor else {
            return;
        };
        if !compactor.config().enabled {
            return;
        }
        let Some(slot) = compactor.try_claim(session_id) else {
            debug!(session = %session_id, "compaction in flight, check deferred");
            return;
        };

        let summary = match bounded(
            "durable get_summary",
            self.settings.op_timeout,
            durable.get_summary(session_id),
        )
        .await
        {
            Ok(summary) => summary,
            Err(e) => {
                warn!(session = %session_id, error = %MemoryError::degraded(Tier::Durable, &e), "skipping compaction check");
                return;
            }
        };
        if !compactor.needs_compaction(stats, summary.as_ref()) {
            return;
        }

        let compactor = compactor.clone();
        let session = session_id.to_string();
        let covered = stats.message_count;
        let budget = compactor.config().summary_token_budget;
        // A rejected spawn drops the future, and the slot with it.
        let spawned = self.background.spawn("compaction", async move {
            match compactor.compact_claimed(slot, covered, budget).await {
                Ok(CompactionOutcome::Compacted(_)) | Ok(CompactionOutcome::Empty) => {}
                Ok(CompactionOutcome::InFlight) => {}
                Ok(CompactionOutcome::Cancelled) => {
                    debug!(session = %session, "compaction cancelled by a clear");
                }
                Err(e) => {
                    warn!(session = %session, error = %MemoryError::degraded(Tier::Summarizer, &e), "compaction failed, will retry on a later write");
                }
            }
        });
        if spawned {
            debug!(session = %session_id, covered, "compaction scheduled");
        }
    }

    // ── Reads ──────────────────────────────────────────────────

    /// The newest `limit` messages of the session, oldest first.
    pub async fn get_recent(&self, session_id: &str, limit: usize) -> Result<Vec<Message>> {
        self.ensure_open()?;
        Self::ensure_session(session_id)?;
        if limit == 0 {
            return Ok(vec![]);
        }
        let timeout = self.settings.op_timeout;
        let cap = self.settings.max_session_messages;

        match &self.tiers {
            Tiers::CacheOnly { cache } => {
                bounded("cache read_recent", timeout, cache.read_recent(session_id, limit)).await
            }
            Tiers::DurableOnly { durable } => {
                bounded("durable query_recent", timeout, durable.query_recent(session_id, limit))
                    .await
            }
            Tiers::Tiered { cache, durable } => {
                let mut refill = true;
                match bounded("cache read_recent", timeout, cache.read_recent(session_id, limit))
                    .await
                {
                    // A full buffer shorter than `limit` means older turns
                    // live only in durable.
                    Ok(messages) if !messages.is_empty() => {
                        if messages.len() >= limit || messages.len() < cap {
                            debug!(session = %session_id, count = messages.len(), "cache hit");
                            return Ok(messages);
                        }
                        refill = false;
                    }
                    Ok(_) => debug!(session = %session_id, "cache miss"),
                    Err(e) => {
                        warn!(session = %session_id, error = %MemoryError::degraded(Tier::Cache, &e), "cache read failed, reading durable tier");
                    }
                }

                let mut messages = bounded(
                    "durable query_recent",
                    timeout,
                    durable.query_recent(session_id, limit.max(cap)),
                )
                .await?;

                if refill && !messages.is_empty() {
                    let tail = messages[messages.len().saturating_sub(cap)..].to_vec();
                    self.schedule_refill(cache, session_id, tail);
                }

                let skip = messages.len().saturating_sub(limit);
                Ok(messages.split_off(skip))
            }
        }
    }

    fn schedule_refill(&self, cache: &Arc<dyn CacheStore>, session_id: &str, messages: Vec<Message>) {
        let cache = Arc::clone(cache);
        let session = session_id.to_string();
        let cap = self.settings.max_session_messages;
        let ttl = self.settings.session_ttl;
        let timeout = self.settings.op_timeout;
        self.background.spawn("cache_refill", async move {
            let count = messages.len();
            match bounded("cache populate", timeout, cache.populate(&session, messages, cap, ttl)).await {
                Ok(true) => debug!(session = %session, count, "cache repopulated"),
                Ok(false) => debug!(session = %session, "cache already refilled, skipping"),
                Err(e) => {
                    warn!(session = %session, error = %MemoryError::degraded(Tier::Cache, &e), "cache repopulation failed");
                }
            }
        });
    }

    /// Embed `query` and rank stored messages against it.
    pub async fn search(
        &self,
        query: &str,
        limit: Option<usize>,
        threshold: Option<f32>,
    ) -> Result<Vec<ScoredMessage>> {
        self.ensure_open()?;
        let mode = self.mode();
        if self.tiers.durable().is_none() {
            return Err(MemoryError::unsupported("semantic search", mode));
        }
        let Some(gateway) = &self.embedding else {
            return Err(MemoryError::unsupported(
                "semantic search",
                format!("{mode} (no embedding gateway)"),
            ));
        };

        let vector = bounded(
            "embedding",
            self.settings.op_timeout,
            gateway.embed_one(query),
        )
        .await?;
        self.search_with_embedding(&vector, limit, threshold).await
    }

    /// Rank stored messages against a caller-supplied vector. `None`
    /// falls back to the configured limit and threshold.
    pub async fn search_with_embedding(
        &self,
        vector: &[f32],
        limit: Option<usize>,
        threshold: Option<f32>,
    ) -> Result<Vec<ScoredMessage>> {
        self.ensure_open()?;
        let Some(durable) = self.tiers.durable() else {
            return Err(MemoryError::unsupported("semantic search", self.mode()));
        };
        if vector.is_empty() {
            return Err(MemoryError::InvalidMessage("query vector is empty".into()));
        }
        if let Some(gateway) = &self.embedding {
            if vector.len() != gateway.dimensions() {
                return Err(MemoryError::DimensionMismatch {
                    expected: gateway.dimensions(),
                    actual: vector.len(),
                });
            }
        }

        let limit = limit.unwrap_or(self.settings.search.default_limit);
        let threshold = threshold.unwrap_or(self.settings.search.default_threshold);
        if limit == 0 {
            return Ok(vec![]);
        }

        let results = bounded(
            "durable vector_search",
            self.settings.op_timeout,
            durable.vector_search(vector, limit, threshold),
        )
        .await?;
        debug!(results = results.len(), limit, threshold, "similarity search");
        Ok(results)
    }

    // ── Compaction ─────────────────────────────────────────────

    /// Compact the whole session now and return the summary text. Empty
    /// sessions return an empty string.
    pub async fn summarize(&self, session_id: &str, max_tokens: Option<usize>) -> Result<String> {
        self.ensure_open()?;
        Self::ensure_session(session_id)?;
        let (Some(durable), Some(compactor)) = (self.tiers.durable(), &self.compactor) else {
            return Err(MemoryError::unsupported("summarize", self.mode()));
        };

        let stats = bounded(
            "durable aggregate_stats",
            self.settings.op_timeout,
            durable.aggregate_stats(session_id),
        )
        .await?;
        if stats.message_count == 0 {
            return Ok(String::new());
        }

        let budget = max_tokens.unwrap_or(compactor.config().summary_token_budget);
        match compactor
            .compact_with_budget(session_id, stats.message_count, budget)
            .await?
        {
            CompactionOutcome::Compacted(summary) => Ok(summary.content),
            CompactionOutcome::Empty | CompactionOutcome::Cancelled => Ok(String::new()),
            CompactionOutcome::InFlight => Err(MemoryError::CompactionInProgress {
                session_id: session_id.to_string(),
            }),
        }
    }

    /// The current summary of the session, if one exists.
    pub async fn get_summary(&self, session_id: &str) -> Result<Option<Summary>> {
        self.ensure_open()?;
        Self::ensure_session(session_id)?;
        match self.tiers.durable() {
            Some(durable) => {
                bounded(
                    "durable get_summary",
                    self.settings.op_timeout,
                    durable.get_summary(session_id),
                )
                .await
            }
            None => Ok(None),
        }
    }

    /// Summary plus the newest uncovered messages, within the configured
    /// context token budget.
    pub async fn build_context(&self, session_id: &str) -> Result<ContextWindow> {
        self.ensure_open()?;
        Self::ensure_session(session_id)?;
        let budget = self.settings.context_token_budget;
        let timeout = self.settings.op_timeout;

        let Some(durable) = self.tiers.durable() else {
            let recent = self
                .get_recent(session_id, self.settings.max_session_messages)
                .await?;
            return Ok(ContextWindow::assemble(session_id, None, recent, budget));
        };

        let summary = bounded("durable get_summary", timeout, durable.get_summary(session_id)).await?;
        let stats = bounded(
            "durable aggregate_stats",
            timeout,
            durable.aggregate_stats(session_id),
        )
        .await?;
        let covered = summary.as_ref().map(|s| s.message_count).unwrap_or(0);
        let uncovered = stats.message_count.saturating_sub(covered);

        // Every message costs at least one token, so the budget bounds the fetch.
        let fetch = uncovered.min(budget.max(1));
        let recent = if fetch == 0 {
            vec![]
        } else {
            bounded("durable query_recent", timeout, durable.query_recent(session_id, fetch))
                .await?
        };

        let mut window = ContextWindow::assemble(session_id, summary, recent, budget);
        window.omitted += uncovered - fetch;
        Ok(window)
    }

    // ── Maintenance ────────────────────────────────────────────

    /// Remove the session from every tier. The cache goes first; a durable
    /// failure fails the call, which may then be partially applied.
    ///
    /// A compaction running for the session is cancelled and the clear
    /// holds its slot until the delete is done, so no summary from before
    /// the clear can land after it.
    pub async fn clear_session(&self, session_id: &str) -> Result<()> {
        self.ensure_open()?;
        Self::ensure_session(session_id)?;
        let timeout = self.settings.op_timeout;

        let _slot = match &self.compactor {
            Some(compactor) => Some(
                bounded("compaction cancel", timeout, async {
                    Ok(compactor.claim_exclusive(session_id).await)
                })
                .await?,
            ),
            None => None,
        };

        match &self.tiers {
            Tiers::CacheOnly { cache } => {
                bounded("cache delete_session", timeout, cache.delete_session(session_id)).await?;
            }
            Tiers::DurableOnly { durable } => {
                bounded("durable delete_session", timeout, durable.delete_session(session_id))
                    .await
                    .map_err(authoritative)?;
            }
            Tiers::Tiered { cache, durable } => {
                if let Err(e) =
                    bounded("cache delete_session", timeout, cache.delete_session(session_id)).await
                {
                    warn!(session = %session_id, error = %MemoryError::degraded(Tier::Cache, &e), "cache clear failed");
                }
                bounded("durable delete_session", timeout, durable.delete_session(session_id))
                    .await
                    .map_err(authoritative)?;
            }
        }
        info!(session = %session_id, "session cleared");
        Ok(())
    }

    /// Drop only the cached copy of the session. No-op without a cache.
    pub async fn clear_cache(&self, session_id: &str) -> Result<()> {
        self.ensure_open()?;
        Self::ensure_session(session_id)?;
        if let Some(cache) = self.tiers.cache() {
            bounded(
                "cache delete_session",
                self.settings.op_timeout,
                cache.delete_session(session_id),
            )
            .await?;
        }
        Ok(())
    }

    /// Live cached sessions and messages. Zero without a cache.
    pub async fn cache_stats(&self) -> Result<CacheStats> {
        self.ensure_open()?;
        match self.tiers.cache() {
            Some(cache) => bounded("cache stats", self.settings.op_timeout, cache.stats()).await,
            None => Ok(CacheStats::default()),
        }
    }

    /// Usage view of the session across both tiers. The durable count is
    /// authoritative whenever the durable tier answers.
    pub async fn get_stats(&self, session_id: &str) -> Result<Stats> {
        self.ensure_open()?;
        Self::ensure_session(session_id)?;
        let timeout = self.settings.op_timeout;
        let mut stats = Stats {
            session_id: session_id.to_string(),
            ..Default::default()
        };

        if let Some(cache) = self.tiers.cache() {
            match bounded("cache session_len", timeout, cache.session_len(session_id)).await {
                Ok(len) => stats.cached_messages = len,
                Err(e) if self.tiers.durable().is_none() => return Err(e),
                Err(e) => {
                    warn!(session = %session_id, error = %MemoryError::degraded(Tier::Cache, &e), "cache count unavailable");
                }
            }
        }

        match self.tiers.durable() {
            Some(durable) => {
                let agg = bounded(
                    "durable aggregate_stats",
                    timeout,
                    durable.aggregate_stats(session_id),
                )
                .await?;
                let summary =
                    bounded("durable get_summary", timeout, durable.get_summary(session_id)).await?;

                stats.total_messages = agg.message_count;
                stats.session_messages = agg.message_count;
                stats.total_tokens = agg.total_tokens;
                stats.unique_users = agg.unique_users;
                stats.storage_size = agg.storage_size;
                stats.oldest_message = agg.oldest_message;
                stats.latest_message = agg.latest_message;
                stats.has_summary = summary.is_some();
                stats.active_tokens = match &summary {
                    Some(s) => s.token_count + agg.total_tokens.saturating_sub(s.source_tokens),
                    None => agg.total_tokens,
                };
            }
            None => {
                let cached = self
                    .get_recent(session_id, self.settings.max_session_messages)
                    .await?;
                stats.session_messages = stats.cached_messages;
                stats.total_tokens = cached.iter().map(|m| m.estimate_tokens()).sum();
                stats.active_tokens = stats.total_tokens;
                stats.oldest_message = cached.first().map(|m| m.timestamp);
                stats.latest_message = cached.last().map(|m| m.timestamp);
                let mut users: Vec<&str> =
                    cached.iter().filter_map(|m| m.user_id.as_deref()).collect();
                users.sort_unstable();
                users.dedup();
                stats.unique_users = users.len();
            }
        }
        Ok(stats)
    }

    /// Stop accepting work and drain background tasks within the configured
    /// grace period. Returns `true` if nothing had to be cancelled.
    pub async fn shutdown(&self) -> bool {
        info!("memory coordinator shutting down");
        self.background.shutdown(self.settings.shutdown_grace).await
    }
}
