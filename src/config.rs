use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::models::Strategy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub connectors: ConnectorsConfig,
}

impl Config {
    /// A configuration with every section at its default, backed by `db_path`.
    pub fn minimal(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            index: IndexConfig::default(),
            pipeline: PipelineConfig::default(),
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            embedding: EmbeddingConfig::default(),
            llm: LlmConfig::default(),
            storage: StorageConfig::default(),
            connectors: ConnectorsConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// Base of every ledger namespace: `{namespace}:{kind}:{scope}`.
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
        }
    }
}

fn default_namespace() -> String {
    "content".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default = "default_batch_count")]
    pub batch_count: usize,
    #[serde(default = "default_max_batch_retries")]
    pub max_batch_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,
    #[serde(default = "default_write_concurrency")]
    pub write_concurrency: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::Incremental,
            batch_count: default_batch_count(),
            max_batch_retries: default_max_batch_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            fetch_concurrency: default_fetch_concurrency(),
            write_concurrency: default_write_concurrency(),
        }
    }
}

fn default_batch_count() -> usize {
    10
}
fn default_max_batch_retries() -> u32 {
    2
}
fn default_retry_backoff_ms() -> u64 {
    500
}
fn default_fetch_concurrency() -> usize {
    4
}
fn default_write_concurrency() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Upper bound on the characters of one Notion chunk.
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
        }
    }
}

fn default_max_chars() -> usize {
    2000
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_final_limit")]
    pub final_limit: usize,
    #[serde(default = "default_hybrid_alpha")]
    pub hybrid_alpha: f64,
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            final_limit: default_final_limit(),
            hybrid_alpha: default_hybrid_alpha(),
            candidate_k: default_candidate_k(),
        }
    }
}

fn default_mode() -> String {
    "keyword".to_string()
}
fn default_final_limit() -> usize {
    4
}
fn default_hybrid_alpha() -> f64 {
    0.6
}
fn default_candidate_k() -> usize {
    80
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL of an OpenAI-compatible API.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Overrides the built-in QA template; must contain `{question}` and
    /// `{context}`.
    #[serde(default)]
    pub prompt_template: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: None,
            temperature: default_temperature(),
            prompt_template: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl LlmConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_temperature() -> f32 {
    0.9
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Uploaded files land in `<upload_dir>/<internal_id>/<file_name>`.
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_dir: default_upload_dir(),
        }
    }
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("./data/uploads")
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ConnectorsConfig {
    #[serde(default)]
    pub files: FilesConnectorConfig,
    #[serde(default)]
    pub azure: AzureConnectorConfig,
    #[serde(default)]
    pub s3: S3ConnectorConfig,
    #[serde(default)]
    pub notion: NotionConnectorConfig,
    #[serde(default)]
    pub nosql: NoSqlConnectorConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilesConnectorConfig {
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Default for FilesConnectorConfig {
    fn default() -> Self {
        Self {
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec![
        "**/*.pdf".to_string(),
        "**/*.csv".to_string(),
        "**/*.json".to_string(),
    ]
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AzureConnectorConfig {
    /// Used when a request names no container.
    #[serde(default)]
    pub container: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct S3ConnectorConfig {
    /// Used when a request names no bucket.
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint for S3-compatible services (MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

impl Default for S3ConnectorConfig {
    fn default() -> Self {
        Self {
            bucket: None,
            region: default_region(),
            endpoint_url: None,
        }
    }
}

fn default_region() -> String {
    "us-east-1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct NotionConnectorConfig {
    /// Used when a request names no page ids.
    #[serde(default)]
    pub page_ids: Vec<String>,
    #[serde(default = "default_notion_api_url")]
    pub api_url: String,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

impl Default for NotionConnectorConfig {
    fn default() -> Self {
        Self {
            page_ids: Vec::new(),
            api_url: default_notion_api_url(),
            max_depth: default_max_depth(),
        }
    }
}

fn default_notion_api_url() -> String {
    "https://api.notion.com".to_string()
}
fn default_max_depth() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct NoSqlConnectorConfig {
    /// Data API base URL, e.g. `https://data.mongodb-api.com/app/<id>/endpoint/data/v1`.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_data_source")]
    pub data_source: String,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub collections: Vec<String>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for NoSqlConnectorConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            data_source: default_data_source(),
            database: None,
            collections: Vec::new(),
            page_size: default_page_size(),
        }
    }
}

fn default_data_source() -> String {
    "Cluster0".to_string()
}
fn default_page_size() -> usize {
    1000
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.index.namespace.trim().is_empty() {
        anyhow::bail!("index.namespace must not be empty");
    }

    // Validate pipeline
    if config.pipeline.batch_count == 0 {
        anyhow::bail!("pipeline.batch_count must be > 0");
    }
    if config.pipeline.fetch_concurrency == 0 || config.pipeline.write_concurrency == 0 {
        anyhow::bail!("pipeline.fetch_concurrency and pipeline.write_concurrency must be > 0");
    }

    if config.chunking.max_chars == 0 {
        anyhow::bail!("chunking.max_chars must be > 0");
    }

    // Validate retrieval
    if config.retrieval.final_limit < 1 {
        anyhow::bail!("retrieval.final_limit must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.retrieval.hybrid_alpha) {
        anyhow::bail!("retrieval.hybrid_alpha must be in [0.0, 1.0]");
    }
    match config.retrieval.mode.as_str() {
        "keyword" | "semantic" | "hybrid" => {}
        other => anyhow::bail!(
            "Unknown retrieval mode: '{}'. Must be keyword, semantic, or hybrid.",
            other
        ),
    }

    // Validate embedding
    match config.embedding.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled or openai.",
            other
        ),
    }
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    // Validate llm
    match config.llm.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown llm provider: '{}'. Must be disabled or openai.",
            other
        ),
    }
    if config.llm.is_enabled() && config.llm.model.is_none() {
        anyhow::bail!(
            "llm.model must be specified when provider is '{}'",
            config.llm.provider
        );
    }
    if let Some(template) = &config.llm.prompt_template {
        if !template.contains("{question}") || !template.contains("{context}") {
            anyhow::bail!("llm.prompt_template must contain {{question}} and {{context}}");
        }
    }

    if config.connectors.nosql.page_size == 0 {
        anyhow::bail!("connectors.nosql.page_size must be > 0");
    }

    Ok(())
}
