//! TOML configuration.
//!
//! Every section has defaults, so an empty file is a valid configuration.
//! Throttle and retrieval values are re-read on every request through
//! [`crate::settings`], which swaps in a freshly validated [`Config`] when
//! the file changes.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::throttle::ThrottleScope;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub db: DbConfig,
    pub server: ServerConfig,
    pub embedding: EmbeddingConfig,
    pub retrieval: RetrievalConfig,
    pub providers: ProvidersConfig,
    pub keys: KeysConfig,
    pub ask: AskConfig,
    pub throttle: ThrottleConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DbConfig {
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/pagewise.sqlite"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// How often the config file is checked for changes.
    pub reload_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7341".to_string(),
            reload_interval_secs: 5,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// `local` (feature hashing), `openai`, or `fastembed`.
    pub provider: String,
    pub model: Option<String>,
    pub dims: usize,
    pub batch_size: usize,
    pub max_retries: u32,
    pub timeout_secs: u64,
    /// Capacity of the page-change event queue feeding the embed worker.
    pub queue_capacity: usize,
    /// How often the server backfills missing or stale embeddings.
    pub sweep_interval_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "local".to_string(),
            model: None,
            dims: 1536,
            batch_size: 32,
            max_retries: 5,
            timeout_secs: 30,
            queue_capacity: 1024,
            sweep_interval_secs: 300,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Pages kept from semantic ranking.
    pub top_k: usize,
    /// Hard cap on pages passed to the prompt, in either mode.
    pub max_pages: usize,
    /// Cosine similarity floor for semantic matches.
    pub min_similarity: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            max_pages: 8,
            min_similarity: 0.25,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProvidersConfig {
    /// Upper bound on a single provider call.
    pub timeout_secs: u64,
    pub max_output_tokens: u32,
    pub openai_base_url: String,
    pub openai_model: String,
    pub openai_embedding_model: String,
    pub anthropic_base_url: String,
    pub anthropic_model: String,
    pub google_base_url: String,
    pub google_model: String,
    pub google_embedding_model: String,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            max_output_tokens: 1024,
            openai_base_url: "https://api.openai.com".to_string(),
            openai_model: "gpt-4o-mini".to_string(),
            openai_embedding_model: "text-embedding-3-small".to_string(),
            anthropic_base_url: "https://api.anthropic.com".to_string(),
            anthropic_model: "claude-3-5-haiku-latest".to_string(),
            google_base_url: "https://generativelanguage.googleapis.com".to_string(),
            google_model: "gemini-1.5-flash".to_string(),
            google_embedding_model: "text-embedding-004".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct KeysConfig {
    /// A credential that validated successfully is trusted this long before
    /// it is exercised against the vendor again.
    pub revalidate_after_secs: u64,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            revalidate_after_secs: 86_400,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AskConfig {
    /// Requests still pending after this long are failed by the sweep.
    pub pending_timeout_secs: u64,
    pub reconcile_interval_secs: u64,
    /// Page of history returned by `GET /v1/ask`.
    pub history_limit: usize,
}

impl Default for AskConfig {
    fn default() -> Self {
        Self {
            pending_timeout_secs: 300,
            reconcile_interval_secs: 60,
            history_limit: 50,
        }
    }
}

/// Requests allowed per window for one throttle scope.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub rate: u32,
    pub window_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ThrottleConfig {
    pub ask: RateLimit,
    pub import: RateLimit,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            ask: RateLimit {
                rate: 30,
                window_secs: 60,
            },
            import: RateLimit {
                rate: 10,
                window_secs: 3600,
            },
        }
    }
}

impl ThrottleConfig {
    pub fn for_scope(&self, scope: ThrottleScope) -> RateLimit {
        match scope {
            ThrottleScope::Ask => self.ask,
            ThrottleScope::Import => self.import,
        }
    }
}

impl EmbeddingConfig {
    /// Model name recorded on stored vectors.
    pub fn model_name(&self, providers: &ProvidersConfig) -> String {
        match (self.provider.as_str(), &self.model) {
            (_, Some(model)) => model.clone(),
            ("openai", None) => providers.openai_embedding_model.clone(),
            ("fastembed", None) => "all-minilm-l6-v2".to_string(),
            _ => pagewise_core::embedding::HASH_EMBED_MODEL.to_string(),
        }
    }
}

/// Parse and validate a config from TOML text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

fn validate(config: &Config) -> Result<()> {
    if config.retrieval.top_k == 0 {
        bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.max_pages == 0 {
        bail!("retrieval.max_pages must be >= 1");
    }
    if !(-1.0..=1.0).contains(&config.retrieval.min_similarity) {
        bail!("retrieval.min_similarity must be in [-1.0, 1.0]");
    }

    for (name, limit) in [("ask", config.throttle.ask), ("import", config.throttle.import)] {
        if limit.window_secs == 0 {
            bail!("throttle.{}.window_secs must be > 0", name);
        }
    }

    if config.providers.timeout_secs == 0 {
        bail!("providers.timeout_secs must be > 0");
    }
    if config.ask.pending_timeout_secs <= config.providers.timeout_secs {
        bail!("ask.pending_timeout_secs must exceed providers.timeout_secs");
    }

    match config.embedding.provider.as_str() {
        "local" | "openai" | "fastembed" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be local, openai, or fastembed.",
            other
        ),
    }
    if config.embedding.dims == 0 {
        bail!("embedding.dims must be > 0");
    }
    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }

    Ok(())
}
