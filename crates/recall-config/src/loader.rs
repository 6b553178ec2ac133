use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use recall_core::MemoryError;

use crate::schema::RecallConfig;

/// Loads the Recall configuration and keeps a reloadable snapshot of it.
pub struct ConfigLoader {
    config: Arc<RwLock<RecallConfig>>,
    config_path: PathBuf,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > RECALL_CONFIG env > ~/.recall/recall.toml
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("RECALL_CONFIG") {
            return PathBuf::from(p);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".recall")
            .join("recall.toml")
    }

    /// Load the config from disk, falling back to defaults.
    pub fn load(path: Option<&Path>) -> recall_core::Result<Self> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            Self::parse_file(&config_path)?
        } else {
            warn!(?config_path, "config file not found, using defaults");
            RecallConfig::default()
        };

        let config = Self::apply_env_overrides(config);
        Self::check(&config)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
        })
    }

    /// Parse a config from a TOML string, apply env overrides, and validate.
    pub fn from_toml_str(raw: &str) -> recall_core::Result<RecallConfig> {
        let config = toml::from_str::<RecallConfig>(raw)
            .map_err(|e| MemoryError::Config(format!("failed to parse config: {}", e)))?;
        let config = Self::apply_env_overrides(config);
        Self::check(&config)?;
        Ok(config)
    }

    /// Get a read snapshot of the current config.
    pub fn get(&self) -> RecallConfig {
        self.config.read().clone()
    }

    /// Get a shared reference for subscription.
    pub fn shared(&self) -> Arc<RwLock<RecallConfig>> {
        Arc::clone(&self.config)
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Reload the config from disk. The previous snapshot stays in place if
    /// the new file does not parse or validate.
    pub fn reload(&self) -> recall_core::Result<()> {
        if !self.config_path.exists() {
            return Err(MemoryError::Config(format!(
                "config file not found: {}",
                self.config_path.display()
            )));
        }
        let new_config = Self::apply_env_overrides(Self::parse_file(&self.config_path)?);
        Self::check(&new_config)?;
        *self.config.write() = new_config;
        info!("configuration reloaded");
        Ok(())
    }

    fn parse_file(path: &Path) -> recall_core::Result<RecallConfig> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str::<RecallConfig>(&raw).map_err(|e| {
            MemoryError::Config(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    /// Log warnings, fail on errors.
    fn check(config: &RecallConfig) -> recall_core::Result<()> {
        match config.validate() {
            Ok(warnings) => {
                for w in &warnings {
                    warn!("{}", w);
                }
                Ok(())
            }
            Err(e) => Err(MemoryError::Config(e)),
        }
    }

    /// Apply env var overrides (RECALL_MODE, RECALL_DB_PATH, etc.)
    fn apply_env_overrides(mut config: RecallConfig) -> RecallConfig {
        if let Ok(v) = std::env::var("RECALL_MODE") {
            match v.parse() {
                Ok(mode) => config.memory.mode = Some(mode),
                Err(e) => warn!(error = %e, "ignoring RECALL_MODE"),
            }
        }
        if let Ok(v) = std::env::var("RECALL_DB_PATH") {
            config.durable.db_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("RECALL_MAX_SESSION_MESSAGES") {
            if let Ok(n) = v.parse::<usize>() {
                config.memory.max_session_messages = n;
            }
        }
        if let Ok(v) = std::env::var("RECALL_SESSION_TTL_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                config.memory.session_ttl_secs = n;
            }
        }
        if let Ok(v) = std::env::var("RECALL_SUMMARIZE_THRESHOLD") {
            if let Ok(n) = v.parse::<usize>() {
                config.compaction.summarize_threshold = n;
            }
        }
        if let Ok(v) = std::env::var("RECALL_LOG_LEVEL") {
            config.logging.level = v;
        }
        // API keys: env var fills in when config file doesn't have the key set.
        if let Ok(v) = std::env::var("OPENAI_API_KEY") {
            if config.embedding.api_key.is_none() {
                config.embedding.api_key = Some(v.clone());
            }
            if config.summarizer.api_key.is_none() {
                config.summarizer.api_key = Some(v);
            }
        }
        config
    }
}
