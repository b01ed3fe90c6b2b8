use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub fragmenting: FragmentingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

impl Config {
    /// A configuration with every section at its default, pointing at `db_path`.
    pub fn with_db_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            logging: LoggingConfig::default(),
            fragmenting: FragmentingConfig::default(),
            embedding: EmbeddingConfig::default(),
            generation: GenerationConfig::default(),
            discovery: DiscoveryConfig::default(),
            ingest: IngestConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct FragmentingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap")]
    pub overlap_tokens: usize,
}

impl Default for FragmentingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: default_overlap(),
        }
    }
}

fn default_max_tokens() -> usize {
    1200
}
fn default_overlap() -> usize {
    150
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_embedding_model(),
            dims: default_dims(),
            batch_size: default_batch_size(),
            max_input_chars: default_max_input_chars(),
            timeout_secs: default_timeout_secs(),
            url: None,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_embedding_model() -> Option<String> {
    Some("text-embedding-3-small".to_string())
}
fn default_dims() -> usize {
    1536
}
fn default_batch_size() -> usize {
    100
}
fn default_max_input_chars() -> usize {
    8000
}
fn default_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_generation_model")]
    pub model: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_generation_model(),
            temperature: default_temperature(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl GenerationConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_generation_model() -> Option<String> {
    Some("gpt-4o-mini".to_string())
}
fn default_temperature() -> f32 {
    0.2
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiscoveryConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_n_init")]
    pub n_init: usize,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_representatives")]
    pub representatives: usize,
    #[serde(default = "default_primary_threshold")]
    pub primary_threshold: f32,
    #[serde(default = "default_secondary_threshold")]
    pub secondary_threshold: f32,
    #[serde(default = "default_relationship_threshold")]
    pub relationship_threshold: f32,
    /// A RUNNING job with no progress for this long is failed so the
    /// collection can be discovered again.
    #[serde(default = "default_job_lease_secs")]
    pub job_lease_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            n_init: default_n_init(),
            max_iterations: default_max_iterations(),
            representatives: default_representatives(),
            primary_threshold: default_primary_threshold(),
            secondary_threshold: default_secondary_threshold(),
            relationship_threshold: default_relationship_threshold(),
            job_lease_secs: default_job_lease_secs(),
        }
    }
}

fn default_seed() -> u64 {
    42
}
fn default_n_init() -> usize {
    10
}
fn default_max_iterations() -> usize {
    300
}
fn default_representatives() -> usize {
    5
}
fn default_primary_threshold() -> f32 {
    0.70
}
fn default_secondary_threshold() -> f32 {
    0.60
}
fn default_relationship_threshold() -> f32 {
    0.25
}
fn default_job_lease_secs() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string(), "**/*.txt".to_string()]
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Validate fragmenting
    if config.fragmenting.max_tokens == 0 {
        anyhow::bail!("fragmenting.max_tokens must be > 0");
    }
    if config.fragmenting.overlap_tokens >= config.fragmenting.max_tokens {
        anyhow::bail!("fragmenting.overlap_tokens must be smaller than fragmenting.max_tokens");
    }

    // Validate embedding
    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be >= 1");
    }
    if config.embedding.max_input_chars == 0 {
        anyhow::bail!("embedding.max_input_chars must be > 0");
    }
    if config.embedding.is_enabled() && config.embedding.model.is_none() {
        anyhow::bail!(
            "embedding.model must be specified when provider is '{}'",
            config.embedding.provider
        );
    }
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    // Validate generation
    if config.generation.is_enabled() && config.generation.model.is_none() {
        anyhow::bail!(
            "generation.model must be specified when provider is '{}'",
            config.generation.provider
        );
    }
    if !(0.0..=2.0).contains(&config.generation.temperature) {
        anyhow::bail!("generation.temperature must be in [0.0, 2.0]");
    }
    match config.generation.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown generation provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    // Validate discovery
    let d = &config.discovery;
    if d.n_init == 0 {
        anyhow::bail!("discovery.n_init must be >= 1");
    }
    if d.max_iterations == 0 {
        anyhow::bail!("discovery.max_iterations must be >= 1");
    }
    if d.representatives == 0 {
        anyhow::bail!("discovery.representatives must be >= 1");
    }
    if !(0.0..=1.0).contains(&d.secondary_threshold)
        || !(0.0..=1.0).contains(&d.primary_threshold)
        || d.secondary_threshold > d.primary_threshold
    {
        anyhow::bail!(
            "discovery thresholds must satisfy 0 <= secondary_threshold <= primary_threshold <= 1"
        );
    }
    if !(-1.0..=1.0).contains(&d.relationship_threshold) {
        anyhow::bail!("discovery.relationship_threshold must be in [-1.0, 1.0]");
    }
    if d.job_lease_secs == 0 {
        anyhow::bail!("discovery.job_lease_secs must be >= 1");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_str)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse("[db]\npath = \"./data/topics.sqlite\"\n").unwrap();
        assert_eq!(config.fragmenting.max_tokens, 1200);
        assert_eq!(config.fragmenting.overlap_tokens, 150);
        assert_eq!(config.embedding.dims, 1536);
        assert_eq!(config.embedding.batch_size, 100);
        assert_eq!(config.embedding.max_input_chars, 8000);
        assert_eq!(config.discovery.seed, 42);
        assert_eq!(config.discovery.representatives, 5);
        assert_eq!(config.discovery.job_lease_secs, 3600);
        assert!((config.generation.temperature - 0.2).abs() < 1e-6);
        assert!(!config.embedding.is_enabled());
        assert!(!config.generation.is_enabled());
    }

    #[test]
    fn test_overlap_must_be_smaller_than_window() {
        let err = parse(
            "[db]\npath = \"x\"\n[fragmenting]\nmax_tokens = 100\noverlap_tokens = 100\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("overlap_tokens"));
    }

    #[test]
    fn test_unknown_embedding_provider_rejected() {
        let err = parse("[db]\npath = \"x\"\n[embedding]\nprovider = \"bogus\"\n").unwrap_err();
        assert!(err.to_string().contains("Unknown embedding provider"));
    }

    #[test]
    fn test_thresholds_must_be_ordered() {
        let err = parse(
            "[db]\npath = \"x\"\n[discovery]\nprimary_threshold = 0.5\nsecondary_threshold = 0.6\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("secondary_threshold"));
    }

    #[test]
    fn test_zero_job_lease_rejected() {
        let err = parse("[db]\npath = \"x\"\n[discovery]\njob_lease_secs = 0\n").unwrap_err();
        assert!(err.to_string().contains("job_lease_secs"));
    }

    #[test]
    fn test_with_db_path_is_valid() {
        let config = Config::with_db_path("/tmp/t.sqlite");
        assert!(validate(&config).is_ok());
    }
}
