use thiserror::Error;

pub type Result<T> = std::result::Result<T, RagError>;

#[derive(Error, Debug)]
pub enum RagError {
    #[error("Unsupported document format: {0}")]
    UnsupportedFormat(String),

    #[error("Failed to extract text from {file}: {message}")]
    Extraction { file: String, message: String },

    #[error("Embedding provider error: {0}")]
    EmbeddingProvider(String),

    #[error("Generation provider error: {0}")]
    Generation(String),

    #[error("Provider rejected credentials: {0}")]
    ProviderAuth(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("The regulation corpus is empty")]
    NoData,

    #[error("No relevant regulation passages were found")]
    NoRelevantContext,

    #[error("Another ingestion run is in progress for corpus '{0}'")]
    IngestionInProgress(String),

    #[error("Ingestion was cancelled")]
    Cancelled,

    #[error("Ingestion produced no chunks: {0}")]
    NothingIngested(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl RagError {
    /// Message shown to the person who invoked a public operation
    #[inline]
    pub fn user_message(&self) -> String {
        match self {
            Self::NoData => {
                "No regulations have been indexed yet. Run ingestion first.".to_string()
            }
            Self::ProviderAuth(detail) => format!(
                "The AI provider rejected the request credentials ({}). Check the provider API key and model access.",
                detail
            ),
            Self::NoRelevantContext => {
                "No regulation passages relevant to the question were found.".to_string()
            }
            Self::IngestionInProgress(corpus) => format!(
                "Ingestion for '{}' is already running. Wait for it to finish and try again.",
                corpus
            ),
            other => other.to_string(),
        }
    }
}

pub mod answer;
pub mod blob;
pub mod classifier;
pub mod commands;
pub mod config;
pub mod database;
pub mod embeddings;
pub mod extractor;
pub mod indexer;
pub mod search;
pub mod service;
