
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

use crate::embeddings::chunking::ChunkingConfig;
use crate::embeddings::voyage::{DEFAULT_EMBEDDING_DIMENSION, DEFAULT_VOYAGE_MODEL};

pub const ENV_CONFIG_HOME: &str = "KNOWLEDGE_BASE_HOME";
pub const ENV_VOYAGE_API_KEY: &str = "VOYAGE_API_KEY";
pub const ENV_PINECONE_API_KEY: &str = "PINECONE_API_KEY";
pub const ENV_PINECONE_INDEX_HOST: &str = "PINECONE_INDEX_HOST";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub vector_store: VectorStoreConfig,
    #[serde(skip)]
    pub base_dir: PathBuf,
    /// File values replaced by environment overrides
    #[serde(skip)]
    pub(crate) overridden: OverriddenValues,
}

/// What the config file held before an environment override replaced it.
///
/// `save` writes these back so secrets from the environment never reach disk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct OverriddenValues {
    voyage_api_key: Option<Option<String>>,
    pinecone_api_key: Option<Option<String>>,
    pinecone_index_host: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub base_url: String,
    pub model: String,
    pub dimension: u32,
    pub batch_size: u32,
    pub timeout_seconds: u64,
    pub retry_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.voyageai.com".to_string(),
            model: DEFAULT_VOYAGE_MODEL.to_string(),
            dimension: DEFAULT_EMBEDDING_DIMENSION,
            batch_size: 128,
            timeout_seconds: 30,
            retry_attempts: 3,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VectorBackend {
    #[default]
    Pinecone,
    LanceDb,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VectorStoreConfig {
    pub backend: VectorBackend,
    pub pinecone: PineconeConfig,
    pub lancedb: LanceDbConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PineconeConfig {
    /// Data plane host of the index, e.g. `https://kb-abc123.svc.aped-1234.pinecone.io`
    pub index_host: String,
    pub namespace: String,
    pub api_version: String,
    pub batch_size: u32,
    pub timeout_seconds: u64,
    pub retry_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl Default for PineconeConfig {
    fn default() -> Self {
        Self {
            index_host: String::new(),
            namespace: String::new(),
            api_version: "2024-07".to_string(),
            batch_size: 100,
            timeout_seconds: 30,
            retry_attempts: 3,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LanceDbConfig {
    /// Overrides `<base_dir>/vectors`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    pub table_name: String,
}

impl Default for LanceDbConfig {
    fn default() -> Self {
        Self {
            path: None,
            table_name: "knowledge_chunks".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration directory not found or could not be created")]
    DirectoryError,
    #[error("Invalid URL format: {0}")]
    InvalidUrl(String),
    #[error("Invalid protocol: {0} (must be 'http' or 'https')")]
    InvalidProtocol(String),
    #[error("Invalid model name: {0} (cannot be empty)")]
    InvalidModel(String),
    #[error("Invalid embedding dimension: {0} (must be between 64 and 4096)")]
    InvalidEmbeddingDimension(u32),
    #[error("Invalid embedding batch size: {0} (must be between 1 and 1000)")]
    InvalidBatchSize(u32),
    #[error("Invalid upsert batch size: {0} (must be between 1 and 1000)")]
    InvalidUpsertBatchSize(u32),
    #[error("Invalid request timeout: {0} (must be between 1 and 300 seconds)")]
    InvalidTimeout(u64),
    #[error("Invalid chunk size: {0} (must be between 1 and 8192)")]
    InvalidChunkSize(usize),
    #[error("Chunk overlap ({0}) must be smaller than chunk size ({1})")]
    OverlapTooLarge(usize, usize),
    #[error("Invalid table name: {0:?} (must be non-empty alphanumeric, '_' or '-')")]
    InvalidTableName(String),
    #[error("Missing API key: set {0} or add it to config.toml")]
    MissingApiKey(&'static str),
    #[error("Missing Pinecone index host: set PINECONE_INDEX_HOST or vector_store.pinecone.index_host")]
    MissingIndexHost,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl Config {
    /// Directory holding `config.toml` and the local vector database
    #[inline]
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        std::env::var_os(ENV_CONFIG_HOME)
            .map(PathBuf::from)
            .or_else(|| dirs::config_dir().map(|dir| dir.join("knowledge-base")))
            .ok_or(ConfigError::DirectoryError)
    }

    /// Load from the default config directory and apply environment overrides
    #[inline]
    pub fn load_default() -> Result<Self> {
        let config_dir = Self::config_dir().context("Failed to determine config directory")?;
        let mut config = Self::load(config_dir)?;
        config.apply_env_overrides();
        config
            .validate()
            .context("Configuration validation failed after applying environment overrides")?;
        Ok(config)
    }

    #[inline]
    pub fn load<P: AsRef<Path>>(config_dir: P) -> Result<Self> {
        let config_path = config_dir.as_ref().join("config.toml");

        if !config_path.exists() {
            return Ok(Self {
                base_dir: config_dir.as_ref().to_path_buf(),
                ..Self::default()
            });
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;
        config.base_dir = config_dir.as_ref().to_path_buf();

        config
            .validate()
            .with_context(|| "Configuration validation failed")?;

        Ok(config)
    }

    #[inline]
    pub fn save(&self) -> Result<()> {
        self.validate()
            .context("Configuration validation failed before saving")?;

        let config_dir = self.get_base_dir();

        fs::create_dir_all(config_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                config_dir.display()
            )
        })?;

        let config_path = self.config_file_path();
        let content = toml::to_string_pretty(&self.without_env_overrides())
            .context("Failed to serialize config to TOML")?;

        fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        Ok(())
    }

    /// Credentials and the index host usually live in the environment rather than on disk
    #[inline]
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from `lookup`. Blank values are ignored, and replaced file
    /// values are remembered so `save` does not persist the overrides.
    #[inline]
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(key) = non_empty(ENV_VOYAGE_API_KEY) {
            let previous = self.embedding.api_key.replace(key);
            self.overridden.voyage_api_key.get_or_insert(previous);
        }
        if let Some(key) = non_empty(ENV_PINECONE_API_KEY) {
            let previous = self.vector_store.pinecone.api_key.replace(key);
            self.overridden.pinecone_api_key.get_or_insert(previous);
        }
        if let Some(host) = non_empty(ENV_PINECONE_INDEX_HOST) {
            let previous = std::mem::replace(&mut self.vector_store.pinecone.index_host, host);
            self.overridden.pinecone_index_host.get_or_insert(previous);
        }
    }

    /// This config as the file held it, before environment overrides
    fn without_env_overrides(&self) -> Self {
        let mut config = self.clone();
        if let Some(key) = &self.overridden.voyage_api_key {
            config.embedding.api_key.clone_from(key);
        }
        if let Some(key) = &self.overridden.pinecone_api_key {
            config.vector_store.pinecone.api_key.clone_from(key);
        }
        if let Some(host) = &self.overridden.pinecone_index_host {
            config.vector_store.pinecone.index_host.clone_from(host);
        }
        config.overridden = OverriddenValues::default();
        config
    }

    #[inline]
    pub fn get_base_dir(&self) -> &Path {
        &self.base_dir
    }

    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.embedding.validate()?;
        self.validate_chunking_config()?;
        self.vector_store.validate()?;
        Ok(())
    }

    fn validate_chunking_config(&self) -> Result<(), ConfigError> {
        let config = &self.chunking;

        if !(1..=8192).contains(&config.chunk_size) {
            return Err(ConfigError::InvalidChunkSize(config.chunk_size));
        }

        if config.overlap >= config.chunk_size {
            return Err(ConfigError::OverlapTooLarge(
                config.overlap,
                config.chunk_size,
            ));
        }

        Ok(())
    }

    #[inline]
    pub fn config_file_path(&self) -> PathBuf {
        self.get_base_dir().join("config.toml")
    }

    /// Directory of the embedded LanceDB database
    #[inline]
    pub fn vector_database_path(&self) -> PathBuf {
        self.vector_store
            .lancedb
            .path
            .clone()
            .unwrap_or_else(|| self.get_base_dir().join("vectors"))
    }
}

fn validate_http_url(url: &str) -> Result<Url, ConfigError> {
    let parsed = Url::parse(url).map_err(|_| ConfigError::InvalidUrl(url.to_string()))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(ConfigError::InvalidProtocol(parsed.scheme().to_string()));
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(ConfigError::InvalidUrl(url.to_string()));
    }
    Ok(parsed)
}

fn validate_timeout(timeout_seconds: u64) -> Result<(), ConfigError> {
    if !(1..=300).contains(&timeout_seconds) {
        return Err(ConfigError::InvalidTimeout(timeout_seconds));
    }
    Ok(())
}

impl EmbeddingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_http_url(&self.base_url)?;

        if self.model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(self.model.clone()));
        }

        if !(64..=4096).contains(&self.dimension) {
            return Err(ConfigError::InvalidEmbeddingDimension(self.dimension));
        }

        if self.batch_size == 0 || self.batch_size > 1000 {
            return Err(ConfigError::InvalidBatchSize(self.batch_size));
        }

        validate_timeout(self.timeout_seconds)
    }

    pub fn api_url(&self) -> Result<Url, ConfigError> {
        validate_http_url(&self.base_url)
    }

    pub fn require_api_key(&self) -> Result<&str, ConfigError> {
        self.api_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
            .ok_or(ConfigError::MissingApiKey(ENV_VOYAGE_API_KEY))
    }

    pub fn set_model(&mut self, model: String) -> Result<(), ConfigError> {
        if model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(model));
        }
        self.model = model;
        Ok(())
    }

    pub fn set_dimension(&mut self, dimension: u32) -> Result<(), ConfigError> {
        if !(64..=4096).contains(&dimension) {
            return Err(ConfigError::InvalidEmbeddingDimension(dimension));
        }
        self.dimension = dimension;
        Ok(())
    }
}

impl VectorStoreConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.backend {
            VectorBackend::Pinecone => self.pinecone.validate(),
            VectorBackend::LanceDb => self.lancedb.validate(),
        }
    }
}

impl PineconeConfig {
    /// An empty host is accepted here so a fresh config validates; it is
    /// rejected when a client is actually built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.index_host.is_empty() {
            validate_http_url(&self.index_host)?;
        }

        if self.batch_size == 0 || self.batch_size > 1000 {
            return Err(ConfigError::InvalidUpsertBatchSize(self.batch_size));
        }

        validate_timeout(self.timeout_seconds)
    }

    pub fn index_url(&self) -> Result<Url, ConfigError> {
        if self.index_host.trim().is_empty() {
            return Err(ConfigError::MissingIndexHost);
        }
        validate_http_url(&self.index_host)
    }

    pub fn require_api_key(&self) -> Result<&str, ConfigError> {
        self.api_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
            .ok_or(ConfigError::MissingApiKey(ENV_PINECONE_API_KEY))
    }
}

impl LanceDbConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid = !self.table_name.is_empty()
            && self
                .table_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(ConfigError::InvalidTableName(self.table_name.clone()));
        }
        Ok(())
    }
}
