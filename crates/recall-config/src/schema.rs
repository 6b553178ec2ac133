use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration, maps to `recall.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecallConfig {
    pub memory: MemoryConfig,
    pub durable: DurableConfig,
    pub cache: CacheConfig,
    pub compaction: CompactionConfig,
    pub search: SearchConfig,
    pub embedding: EmbeddingConfig,
    pub summarizer: SummarizerConfig,
    pub background: BackgroundConfig,
    pub logging: LoggingConfig,
}

// ── Mode ───────────────────────────────────────────────────────

/// Which tiers the coordinator routes across. Chosen once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryMode {
    /// Volatile recency buffer only, no persistence.
    CacheOnly,
    /// Durable store only.
    DurableOnly,
    /// Cache for the fast path, durable store as source of truth.
    Tiered,
}

impl MemoryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryMode::CacheOnly => "cache_only",
            MemoryMode::DurableOnly => "durable_only",
            MemoryMode::Tiered => "tiered",
        }
    }

    pub fn uses_cache(&self) -> bool {
        matches!(self, MemoryMode::CacheOnly | MemoryMode::Tiered)
    }

    pub fn uses_durable(&self) -> bool {
        matches!(self, MemoryMode::DurableOnly | MemoryMode::Tiered)
    }
}

impl std::fmt::Display for MemoryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MemoryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cache_only" | "session_only" => Ok(MemoryMode::CacheOnly),
            "durable_only" | "persistent" => Ok(MemoryMode::DurableOnly),
            "tiered" | "hybrid" => Ok(MemoryMode::Tiered),
            other => Err(format!("unknown memory mode '{other}'")),
        }
    }
}

// ── Memory ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Explicit tier mode. When unset, derived from which backends are enabled.
    pub mode: Option<MemoryMode>,
    /// Per-session cache capacity; oldest entries are evicted beyond this.
    pub max_session_messages: usize,
    /// Sliding TTL for a cached session, reset on every write.
    pub session_ttl_secs: u64,
    /// Upper bound on any single tier call.
    pub operation_timeout_ms: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            mode: None,
            max_session_messages: 50,
            session_ttl_secs: 24 * 60 * 60,
            operation_timeout_ms: 5_000,
        }
    }
}

impl MemoryConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

// ── Tiers ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DurableConfig {
    pub enabled: bool,
    /// Path to the SQLite database (":memory:" for an ephemeral store).
    pub db_path: PathBuf,
}

impl Default for DurableConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            db_path: PathBuf::from("recall.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Shard count for the session map. 0 lets the map pick.
    pub shards: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            shards: 0,
        }
    }
}

// ── Compaction ─────────────────────────────────────────────────

/// What the summarize threshold counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionTrigger {
    Messages,
    Tokens,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    pub enabled: bool,
    pub trigger: CompactionTrigger,
    /// Uncovered messages (or tokens) that trigger a new summary.
    pub summarize_threshold: usize,
    /// Target length of a generated summary.
    pub summary_token_budget: usize,
    /// Upper bound for `summary + recent window` context assembly.
    pub context_token_budget: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            trigger: CompactionTrigger::Messages,
            summarize_threshold: 30,
            summary_token_budget: 500,
            context_token_budget: 4_000,
        }
    }
}

// ── Search ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub default_limit: usize,
    /// Minimum cosine similarity for a result to be returned.
    pub default_threshold: f32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: 5,
            default_threshold: 0.7,
        }
    }
}

// ── Providers ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    OpenAi,
    Ollama,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProviderKind,
    pub model: String,
    /// Vector dimension every stored embedding must match.
    pub dimensions: usize,
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderKind::None,
            model: "text-embedding-3-small".into(),
            dimensions: 1536,
            base_url: None,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummarizerKind {
    OpenAi,
    Extractive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SummarizerConfig {
    pub provider: SummarizerKind,
    pub model: String,
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub temperature: f32,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            provider: SummarizerKind::Extractive,
            model: "gpt-4o-mini".into(),
            base_url: None,
            api_key: None,
            temperature: 0.3,
        }
    }
}

// ── Background work ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundConfig {
    /// Cap on concurrent repopulation/compaction tasks.
    pub max_concurrent_tasks: usize,
    /// How long shutdown waits for in-flight tasks before cancelling them.
    pub shutdown_grace_ms: u64,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 16,
            shutdown_grace_ms: 5_000,
        }
    }
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Output format: "pretty", "json", "compact".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

// ── Validation ─────────────────────────────────────────────────

/// A single config validation issue.
#[derive(Debug)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
    pub severity: WarningSeverity,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self.severity {
            WarningSeverity::Error => "error",
            WarningSeverity::Warning => "warning",
            WarningSeverity::Info => "info",
        };
        write!(f, "[{}] {}: {}", label, self.field, self.message)?;
        if let Some(ref h) = self.hint {
            write!(f, " ({})", h)?;
        }
        Ok(())
    }
}

impl RecallConfig {
    /// The mode the coordinator should run in: the explicit one, otherwise
    /// whichever backends are enabled (both → tiered, durable → durable-only,
    /// anything else → cache-only).
    pub fn resolved_mode(&self) -> MemoryMode {
        if let Some(mode) = self.memory.mode {
            return mode;
        }
        match (self.cache.enabled, self.durable.enabled) {
            (true, true) => MemoryMode::Tiered,
            (false, true) => MemoryMode::DurableOnly,
            _ => MemoryMode::CacheOnly,
        }
    }

    /// Validate the config and return a list of warnings/errors.
    /// Returns `Err` with all messages joined if any severity is Error.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, String> {
        let mut warnings = Vec::new();

        // ── Mode vs backends ───
        if let Some(mode) = self.memory.mode {
            if mode.uses_cache() && !self.cache.enabled {
                warnings.push(ConfigWarning {
                    field: "cache.enabled".into(),
                    message: format!("{} mode requires a cache backend", mode),
                    severity: WarningSeverity::Error,
                    hint: Some("Enable [cache] or pick mode = \"durable_only\"".into()),
                });
            }
            if mode.uses_durable() && !self.durable.enabled {
                warnings.push(ConfigWarning {
                    field: "durable.enabled".into(),
                    message: format!("{} mode requires a durable backend", mode),
                    severity: WarningSeverity::Error,
                    hint: Some("Enable [durable] or pick mode = \"cache_only\"".into()),
                });
            }
        }

        // ── Cache capacity ───
        if self.memory.max_session_messages == 0 {
            warnings.push(ConfigWarning {
                field: "memory.max_session_messages".into(),
                message: "cache capacity is 0, nothing would ever be cached".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 50".into()),
            });
        }

        if self.memory.session_ttl_secs == 0 {
            warnings.push(ConfigWarning {
                field: "memory.session_ttl_secs".into(),
                message: "TTL of 0 expires every cached session immediately".into(),
                severity: WarningSeverity::Warning,
                hint: None,
            });
        }

        if self.memory.operation_timeout_ms == 0 {
            warnings.push(ConfigWarning {
                field: "memory.operation_timeout_ms".into(),
                message: "timeout of 0 fails every tier call".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 5000".into()),
            });
        }

        // ── Compaction ───
        if self.compaction.enabled && self.compaction.summarize_threshold == 0 {
            warnings.push(ConfigWarning {
                field: "compaction.summarize_threshold".into(),
                message: "threshold of 0 would compact on every write".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 30, or disable compaction".into()),
            });
        }
        if self.compaction.context_token_budget < self.compaction.summary_token_budget {
            warnings.push(ConfigWarning {
                field: "compaction.context_token_budget".into(),
                message: "context budget is smaller than the summary budget".into(),
                severity: WarningSeverity::Warning,
                hint: Some("Recent messages may be crowded out of the context".into()),
            });
        }

        // ── Search ───
        let threshold = self.search.default_threshold;
        if !(-1.0..=1.0).contains(&threshold) {
            warnings.push(ConfigWarning {
                field: "search.default_threshold".into(),
                message: format!("threshold {} is outside cosine range", threshold),
                severity: WarningSeverity::Error,
                hint: Some("Use a value between -1.0 and 1.0".into()),
            });
        }
        if self.search.default_limit == 0 {
            warnings.push(ConfigWarning {
                field: "search.default_limit".into(),
                message: "default limit of 0 returns no results".into(),
                severity: WarningSeverity::Warning,
                hint: None,
            });
        }

        // ── Embedding ───
        if self.embedding.provider != EmbeddingProviderKind::None {
            if self.embedding.dimensions == 0 {
                warnings.push(ConfigWarning {
                    field: "embedding.dimensions".into(),
                    message: "dimension is 0".into(),
                    severity: WarningSeverity::Error,
                    hint: Some("1536 for text-embedding-3-small, 768 for nomic-embed-text".into()),
                });
            }
            if self.embedding.provider == EmbeddingProviderKind::OpenAi
                && self.embedding.api_key.is_none()
            {
                warnings.push(ConfigWarning {
                    field: "embedding.api_key".into(),
                    message: "openai embeddings need an API key".into(),
                    severity: WarningSeverity::Error,
                    hint: Some("Set embedding.api_key or OPENAI_API_KEY".into()),
                });
            }
            if !self.resolved_mode().uses_durable() {
                warnings.push(ConfigWarning {
                    field: "embedding.provider".into(),
                    message: "embeddings are only stored by the durable tier".into(),
                    severity: WarningSeverity::Info,
                    hint: None,
                });
            }
        }

        // ── Summarizer ───
        if self.summarizer.provider == SummarizerKind::OpenAi && self.summarizer.api_key.is_none() {
            warnings.push(ConfigWarning {
                field: "summarizer.api_key".into(),
                message: "openai summarizer needs an API key".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set summarizer.api_key, OPENAI_API_KEY, or provider = \"extractive\"".into()),
            });
        }

        // ── Background ───
        if self.background.max_concurrent_tasks == 0 {
            warnings.push(ConfigWarning {
                field: "background.max_concurrent_tasks".into(),
                message: "no background slots, cache repopulation and compaction never run".into(),
                severity: WarningSeverity::Warning,
                hint: Some("Set to e.g. 16".into()),
            });
        }

        // ── Logging format ───
        let valid_formats = ["pretty", "json", "compact"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.format".into(),
                message: format!("unknown log format '{}'", self.logging.format),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_formats.join(", "))),
            });
        }

        // ── Logging level ───
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.level".into(),
                message: format!("unknown log level '{}'", self.logging.level),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_levels.join(", "))),
            });
        }

        // Check for hard errors
        let errors: Vec<String> = warnings
            .iter()
            .filter(|w| w.severity == WarningSeverity::Error)
            .map(|w| format!("{}: {}", w.field, w.message))
            .collect();

        if !errors.is_empty() {
            return Err(format!("Configuration errors:\n  • {}", errors.join("\n  • ")));
        }

        Ok(warnings)
    }
}
