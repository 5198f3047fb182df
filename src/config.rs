//! TOML configuration with defaults, environment overrides, and validation.
//!
//! Every section is optional. A missing config file yields the defaults.
//! After parsing, `CRM_RAG_DB`, `CRM_RAG_LOG_LEVEL` and
//! `CRM_RAG_EMBEDDING_PROVIDER` override their file values, then
//! [`validate`] rejects out-of-range settings.
//!
//! API keys never live in the file: they are read from `OPENAI_API_KEY` and
//! `ERP_API_KEY` when a provider that needs them is constructed.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crm_rag_core::chunk::ChunkConfig;
use crm_rag_core::context::ContextOverrides;
use crm_rag_core::RagError;

pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";
pub const ERP_API_KEY_ENV: &str = "ERP_API_KEY";

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub db: DbConfig,
    pub chunking: ChunkConfig,
    pub retrieval: RetrievalConfig,
    pub embedding: EmbeddingConfig,
    pub llm: LlmConfig,
    pub erp: ErpConfig,
    pub sync: SyncConfig,
    pub context: ContextSettings,
    pub catalog: CatalogConfig,
    pub log: LogConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DbConfig {
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/crm-rag.sqlite"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    pub limit: usize,
    pub similarity_threshold: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            limit: 10,
            similarity_threshold: 0.65,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// `disabled`, `openai`, or `hashing`.
    pub provider: String,
    pub model: Option<String>,
    pub dims: Option<usize>,
    pub url: Option<String>,
    pub batch_size: usize,
    pub max_retries: u32,
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "hashing".to_string(),
            model: None,
            dims: None,
            url: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LlmConfig {
    /// `disabled` or `openai`.
    pub provider: String,
    pub model: String,
    pub url: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: "gpt-4o-mini".to_string(),
            url: None,
            temperature: 0.2,
            max_tokens: 800,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ErpConfig {
    /// Unset disables the ERP integration.
    pub base_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ErpConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SyncConfig {
    /// Pause between records in a batch.
    pub record_delay_ms: u64,
    pub stale_after_days: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            record_delay_ms: 100,
            stale_after_days: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ContextSettings {
    pub cache_ttl_secs: u64,
    /// Plan assumed for organizations with no subscription row.
    pub default_plan: Option<String>,
    /// Context settings per subscription plan.
    pub tiers: HashMap<String, ContextOverrides>,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 300,
            default_plan: None,
            tiers: HashMap::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CatalogConfig {
    pub default_language: String,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            default_language: "en".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive, e.g. `info` or `crm_rag=debug,sqlx=warn`.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("CRM_RAG_DB") {
            self.db.path = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("CRM_RAG_LOG_LEVEL") {
            self.log.level = val;
        }
        if let Ok(val) = std::env::var("CRM_RAG_EMBEDDING_PROVIDER") {
            self.embedding.provider = val;
        }
    }
}

/// Read a required credential from the environment.
pub fn credential(var: &'static str) -> Result<String, RagError> {
    match std::env::var(var) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(RagError::MissingCredential(var)),
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let mut config: Config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content).with_context(|| "Failed to parse config file")?
    } else {
        tracing::info!("no config file at {}, using defaults", path.display());
        Config::default()
    };

    config.apply_env_overrides();
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    config.chunking.validate()?;

    if config.retrieval.limit < 1 {
        bail!("retrieval.limit must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.retrieval.similarity_threshold) {
        bail!("retrieval.similarity_threshold must be in [0.0, 1.0]");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "hashing" => {}
        "openai" => {
            if config.embedding.model.is_none() {
                bail!("embedding.model must be specified when provider is 'openai'");
            }
            if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
                bail!("embedding.dims must be > 0 when provider is 'openai'");
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or hashing.",
            other
        ),
    }
    if config.embedding.dims == Some(0) {
        bail!("embedding.dims must be > 0");
    }

    match config.llm.provider.as_str() {
        "disabled" | "openai" => {}
        other => bail!("Unknown llm provider: '{}'. Must be disabled or openai.", other),
    }

    for (plan, tier) in &config.context.tiers {
        if let Some(t) = tier.relevance_threshold {
            if !(0.0..=1.0).contains(&t) {
                bail!("context.tiers.{plan}.relevance_threshold must be in [0.0, 1.0]");
            }
        }
        if tier.max_context_size == Some(0) {
            bail!("context.tiers.{plan}.max_context_size must be > 0");
        }
    }

    if crm_rag_core::language::store_config(&config.catalog.default_language).is_none() {
        bail!(
            "catalog.default_language '{}' has no store configuration",
            config.catalog.default_language
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_text: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_text)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config.chunking.chunk_size, 1000);
        assert_eq!(config.chunking.chunk_overlap, 200);
        assert_eq!(config.retrieval.limit, 10);
        assert_eq!(config.sync.record_delay_ms, 100);
        assert_eq!(config.embedding.provider, "hashing");
        assert_eq!(config.llm.provider, "disabled");
    }

    #[test]
    fn tiers_parse() {
        let config = parse(
            r#"
            [context]
            default_plan = "basic"

            [context.tiers.pro]
            max_context_size = 8000
            enable_memory_compression = true

            [context.tiers.basic]
            max_context_size = 2000
            enable_long_term_memory = false
            "#,
        )
        .unwrap();
        assert_eq!(config.context.tiers["pro"].max_context_size, Some(8000));
        assert_eq!(config.context.tiers["basic"].enable_long_term_memory, Some(false));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(parse("[chunking]\nchunk_size = 0").is_err());
        assert!(parse("[chunking]\nchunk_size = 100\nchunk_overlap = 100").is_err());
        assert!(parse("[chunking]\nmin_chunk_size = 2000").is_err());
        assert!(parse("[chunking]\nchunk_size = 2000").is_err());
        assert!(parse("[retrieval]\nsimilarity_threshold = 1.5").is_err());
        assert!(parse("[retrieval]\nlimit = 0").is_err());
        assert!(parse("[embedding]\nprovider = \"magic\"").is_err());
        assert!(parse("[embedding]\nprovider = \"openai\"").is_err());
        assert!(parse("[context.tiers.pro]\nrelevance_threshold = 2.0").is_err());
        assert!(parse("[catalog]\ndefault_language = \"xx\"").is_err());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.retrieval.limit, 10);
    }
}
