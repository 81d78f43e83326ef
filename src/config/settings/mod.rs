
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

use crate::classifier::ClassifierConfig;
use crate::embeddings::chunking::ChunkingConfig;
use crate::embeddings::ollama::DEFAULT_EMBEDDING_DIMENSION;

const APP_DIR_NAME: &str = "regulation-rag";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub ollama: OllamaConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OllamaConfig {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub embedding_model: String,
    pub generation_model: String,
    pub batch_size: u32,
    pub embedding_dimension: u32,
    pub timeout_seconds: u64,
    /// Prepended to text embedded for indexing
    pub document_prefix: String,
    /// Prepended to text embedded for searching
    pub query_prefix: String,
    pub temperature: f32,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            protocol: "http".to_string(),
            host: "localhost".to_string(),
            port: 11434,
            embedding_model: "nomic-embed-text:latest".to_string(),
            generation_model: "llama3.1:8b".to_string(),
            batch_size: 16,
            embedding_dimension: DEFAULT_EMBEDDING_DIMENSION,
            timeout_seconds: 30,
            document_prefix: "search_document: ".to_string(),
            query_prefix: "search_query: ".to_string(),
            temperature: 0.2,
        }
    }
}

/// Query-time settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    /// Upper bound on the context block handed to the generation model
    pub max_context_chars: usize,
    /// Language the answer must be written in
    pub answer_language: String,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            max_context_chars: 6000,
            answer_language: "Korean".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IngestionConfig {
    /// Identity of the corpus; also the advisory lock key
    pub corpus: String,
    /// Directories searched for documents, in order. Later entries win on name clashes.
    pub source_dirs: Vec<PathBuf>,
    pub prefix: String,
    /// Concurrent embedding requests per run
    pub workers: usize,
    pub lock_stale_seconds: u64,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            corpus: "regulations".to_string(),
            source_dirs: vec![PathBuf::from("regulations")],
            prefix: String::new(),
            workers: 4,
            lock_stale_seconds: 120,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration directory not found or could not be created")]
    DirectoryError,
    #[error("Invalid URL format: {0}")]
    InvalidUrl(String),
    #[error("Invalid port: {0} (must be between 1 and 65535)")]
    InvalidPort(u16),
    #[error("Invalid batch size: {0} (must be between 1 and 1000)")]
    InvalidBatchSize(u32),
    #[error("Invalid model name: {0} (cannot be empty)")]
    InvalidModel(String),
    #[error("Invalid protocol: {0} (must be 'http' or 'https')")]
    InvalidProtocol(String),
    #[error("Invalid embedding dimension: {0} (must be between 64 and 4096)")]
    InvalidEmbeddingDimension(u32),
    #[error("Invalid timeout: {0} (must be between 1 and 600 seconds)")]
    InvalidTimeout(u64),
    #[error("Invalid temperature: {0} (must be between 0.0 and 2.0)")]
    InvalidTemperature(f32),
    #[error("Invalid max chunk size: {0} (must be between 50 and 8000)")]
    InvalidMaxChunkSize(usize),
    #[error("Invalid min chunk size: {0} (must be at least 1)")]
    InvalidMinChunkSize(usize),
    #[error("Max chunk size ({0}) must be greater than min chunk size ({1})")]
    MaxChunkSizeTooSmall(usize, usize),
    #[error("Invalid top_k: {0} (must be between 1 and 50)")]
    InvalidTopK(usize),
    #[error("Invalid max context size: {0} (must be between 500 and 100000 characters)")]
    InvalidMaxContextChars(usize),
    #[error("Answer language cannot be empty")]
    EmptyAnswerLanguage,
    #[error("Corpus name cannot be empty")]
    EmptyCorpusName,
    #[error("Invalid worker count: {0} (must be between 1 and 32)")]
    InvalidWorkers(usize),
    #[error("Invalid lock staleness: {0} (must be at least 10 seconds)")]
    InvalidLockStaleness(u64),
    #[error("Classifier rule for '{0}' has no keywords")]
    EmptyClassifierRule(String),
    #[error("Classifier category names cannot be empty")]
    EmptyCategory,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl From<ConfigError> for crate::RagError {
    #[inline]
    fn from(err: ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

impl Default for Config {
    #[inline]
    fn default() -> Self {
        Self {
            ollama: OllamaConfig::default(),
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            ingestion: IngestionConfig::default(),
            classifier: ClassifierConfig::default(),
            base_dir: PathBuf::new(),
        }
    }
}

impl Config {
    /// Platform config directory used when no directory is given on the command line
    #[inline]
    pub fn default_dir() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|dir| dir.join(APP_DIR_NAME))
            .ok_or(ConfigError::DirectoryError)
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
        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        Ok(())
    }

    #[inline]
    pub fn get_base_dir(&self) -> &Path {
        &self.base_dir
    }

    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ollama.validate()?;
        self.validate_chunking_config()?;
        self.validate_retrieval_config()?;
        self.validate_ingestion_config()?;
        self.classifier.validate()?;
        Ok(())
    }

    fn validate_chunking_config(&self) -> Result<(), ConfigError> {
        let config = &self.chunking;

        if config.min_chunk_size == 0 {
            return Err(ConfigError::InvalidMinChunkSize(config.min_chunk_size));
        }

        if !(50..=8000).contains(&config.max_chunk_size) {
            return Err(ConfigError::InvalidMaxChunkSize(config.max_chunk_size));
        }

        if config.max_chunk_size <= config.min_chunk_size {
            return Err(ConfigError::MaxChunkSizeTooSmall(
                config.max_chunk_size,
                config.min_chunk_size,
            ));
        }

        Ok(())
    }

    fn validate_retrieval_config(&self) -> Result<(), ConfigError> {
        let config = &self.retrieval;

        if !(1..=50).contains(&config.top_k) {
            return Err(ConfigError::InvalidTopK(config.top_k));
        }

        if !(500..=100_000).contains(&config.max_context_chars) {
            return Err(ConfigError::InvalidMaxContextChars(
                config.max_context_chars,
            ));
        }

        if config.answer_language.trim().is_empty() {
            return Err(ConfigError::EmptyAnswerLanguage);
        }

        Ok(())
    }

    fn validate_ingestion_config(&self) -> Result<(), ConfigError> {
        let config = &self.ingestion;

        if config.corpus.trim().is_empty() {
            return Err(ConfigError::EmptyCorpusName);
        }

        if !(1..=32).contains(&config.workers) {
            return Err(ConfigError::InvalidWorkers(config.workers));
        }

        if config.lock_stale_seconds < 10 {
            return Err(ConfigError::InvalidLockStaleness(config.lock_stale_seconds));
        }

        Ok(())
    }

    #[inline]
    pub fn config_file_path(&self) -> PathBuf {
        self.get_base_dir().join("config.toml")
    }

    /// Get the path for the SQLite corpus database
    #[inline]
    pub fn database_path(&self) -> PathBuf {
        self.get_base_dir().join("corpus.db")
    }

    /// Source directories resolved against the config directory when relative
    #[inline]
    pub fn resolved_source_dirs(&self) -> Vec<PathBuf> {
        self.ingestion
            .source_dirs
            .iter()
            .map(|dir| {
                if dir.is_absolute() {
                    dir.clone()
                } else {
                    self.get_base_dir().join(dir)
                }
            })
            .collect()
    }

    #[inline]
    pub fn ollama_url(&self) -> Result<Url, ConfigError> {
        self.ollama.ollama_url()
    }
}

impl OllamaConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protocol != "http" && self.protocol != "https" {
            return Err(ConfigError::InvalidProtocol(self.protocol.clone()));
        }

        self.ollama_url()?;

        if self.port == 0 {
            return Err(ConfigError::InvalidPort(self.port));
        }

        if self.embedding_model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(self.embedding_model.clone()));
        }

        if self.generation_model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(self.generation_model.clone()));
        }

        if self.batch_size == 0 || self.batch_size > 1000 {
            return Err(ConfigError::InvalidBatchSize(self.batch_size));
        }

        if !(64..=4096).contains(&self.embedding_dimension) {
            return Err(ConfigError::InvalidEmbeddingDimension(
                self.embedding_dimension,
            ));
        }

        if !(1..=600).contains(&self.timeout_seconds) {
            return Err(ConfigError::InvalidTimeout(self.timeout_seconds));
        }

        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::InvalidTemperature(self.temperature));
        }

        Ok(())
    }

    pub fn ollama_url(&self) -> Result<Url, ConfigError> {
        let url_str = format!("{}://{}:{}", self.protocol, self.host, self.port);
        Url::parse(&url_str).map_err(|_| ConfigError::InvalidUrl(url_str))
    }

    pub fn set_protocol(&mut self, protocol: String) -> Result<(), ConfigError> {
        if protocol != "http" && protocol != "https" {
            return Err(ConfigError::InvalidProtocol(protocol));
        }
        self.protocol = protocol;
        Ok(())
    }

    pub fn set_host(&mut self, host: String) -> Result<(), ConfigError> {
        let temp_config = OllamaConfig {
            host: host.clone(),
            ..self.clone()
        };
        temp_config.ollama_url()?;
        self.host = host;
        Ok(())
    }

    pub fn set_port(&mut self, port: u16) -> Result<(), ConfigError> {
        if port == 0 {
            return Err(ConfigError::InvalidPort(port));
        }
        self.port = port;
        Ok(())
    }

    pub fn set_embedding_model(&mut self, model: String) -> Result<(), ConfigError> {
        if model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(model));
        }
        self.embedding_model = model;
        Ok(())
    }

    pub fn set_generation_model(&mut self, model: String) -> Result<(), ConfigError> {
        if model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(model));
        }
        self.generation_model = model;
        Ok(())
    }

    pub fn set_embedding_dimension(&mut self, dimension: u32) -> Result<(), ConfigError> {
        if !(64..=4096).contains(&dimension) {
            return Err(ConfigError::InvalidEmbeddingDimension(dimension));
        }
        self.embedding_dimension = dimension;
        Ok(())
    }
}
