use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::generate::RetryPolicy;
use crate::schema::{BackrefPolicy, SchemaParser, DEFAULT_FUZZY_THRESHOLD};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub cascade: CascadeConfig,
    #[serde(default)]
    pub fuzzy: FuzzyConfig,
    #[serde(default)]
    pub loader: LoaderConfig,
    #[serde(default)]
    pub embeddings: EmbeddingsConfig,
}

/// General settings
#[derive(Debug, Clone, Deserialize)]
pub struct GraphConfig {
    /// Optional schema file (YAML or JSON) used by the CLI.
    #[serde(default)]
    pub schema_path: Option<PathBuf>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Stamp `createdAt`/`updatedAt` on every write unless a type disables them.
    #[serde(default = "default_true")]
    pub auto_timestamps: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            schema_path: None,
            log_level: default_log_level(),
            auto_timestamps: true,
        }
    }
}

/// Cascade generation settings
#[derive(Debug, Clone, Deserialize)]
pub struct CascadeConfig {
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    /// Number of children requested for array relationship fields.
    #[serde(default = "default_array_fanout")]
    pub array_fanout: usize,
    /// Retries per generator call before the branch is abandoned.
    #[serde(default = "default_generation_retries")]
    pub generation_retries: usize,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// 0 = no deadline
    #[serde(default)]
    pub timeout_ms: u64,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            array_fanout: default_array_fanout(),
            generation_retries: default_generation_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            timeout_ms: 0,
        }
    }
}

impl CascadeConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.generation_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
        }
    }
}

/// Fuzzy matching settings
#[derive(Debug, Clone, Deserialize)]
pub struct FuzzyConfig {
    /// Threshold used when a fuzzy declaration carries none.
    #[serde(default = "default_threshold")]
    pub default_threshold: f32,
    #[serde(default = "default_search_limit")]
    pub search_limit: usize,
    #[serde(default)]
    pub backref_policy: BackrefPolicy,
}

impl Default for FuzzyConfig {
    fn default() -> Self {
        Self {
            default_threshold: default_threshold(),
            search_limit: default_search_limit(),
            backref_policy: BackrefPolicy::default(),
        }
    }
}

/// Request batcher settings
#[derive(Debug, Clone, Deserialize)]
pub struct LoaderConfig {
    #[serde(default = "default_true")]
    pub cache: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self { cache: true }
    }
}

/// Embeddings configuration (mock embedder + query cache)
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingsConfig {
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            dimensions: default_dimensions(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_depth() -> usize {
    3
}

fn default_array_fanout() -> usize {
    2
}

fn default_generation_retries() -> usize {
    2
}

fn default_retry_base_delay_ms() -> u64 {
    200
}

fn default_threshold() -> f32 {
    DEFAULT_FUZZY_THRESHOLD
}

fn default_search_limit() -> usize {
    10
}

fn default_dimensions() -> usize {
    256
}

fn default_cache_capacity() -> usize {
    1000
}

impl Config {
    /// Load configuration from file
    ///
    /// Loads environment variables from .env file (if present) before loading config.
    /// Looks for config file in this order:
    /// 1. Path specified in ENTIGRAPH_CONFIG environment variable
    /// 2. ./entigraph.toml in current directory
    ///
    /// A missing default file yields `Config::default()`; a missing file named
    /// by ENTIGRAPH_CONFIG is an error.
    pub fn load() -> Result<Self> {
        let _ = dotenv::dotenv();

        match std::env::var("ENTIGRAPH_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path)),
            Err(_) => {
                let path = PathBuf::from("entigraph.toml");
                if path.exists() {
                    Self::from_file(&path)
                } else {
                    let config = Config::default();
                    config.validate()?;
                    Ok(config)
                }
            }
        }
    }

    /// Load and validate a specific config file
    pub fn from_file(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: Config = toml::from_str(&config_str)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.fuzzy.default_threshold) {
            anyhow::bail!("fuzzy.default_threshold must be between 0.0 and 1.0");
        }

        if self.fuzzy.search_limit == 0 {
            anyhow::bail!("fuzzy.search_limit must be greater than 0");
        }

        if self.cascade.array_fanout == 0 {
            anyhow::bail!("cascade.array_fanout must be greater than 0");
        }

        if self.embeddings.dimensions == 0 {
            anyhow::bail!("embeddings.dimensions must be greater than 0");
        }

        if let Some(path) = &self.graph.schema_path {
            if !path.exists() {
                anyhow::bail!("graph.schema_path does not exist: {}", path.display());
            }
        }

        Ok(())
    }

    /// Schema file configured for the CLI, if any
    pub fn schema_path(&self) -> Option<&Path> {
        self.graph.schema_path.as_deref()
    }

    /// Schema parser honouring the `[fuzzy]` settings
    pub fn schema_parser(&self) -> SchemaParser {
        SchemaParser::new()
            .with_default_threshold(self.fuzzy.default_threshold)
            .with_backref_policy(self.fuzzy.backref_policy)
    }
}
