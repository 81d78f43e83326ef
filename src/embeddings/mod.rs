// Embeddings module
// Chunking, the Ollama provider, and the deterministic local fallback

pub mod chunking;
pub mod fallback;
pub mod ollama;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{RagError, Result};

pub use chunking::{ChunkingConfig, Chunks, TextChunk, chunk_text, has_heading_markers};
pub use fallback::{FallbackEmbedder, PRIMARY_FAILURE_LIMIT, fallback_embed};
pub use ollama::OllamaClient;

/// Why a text is being embedded. Providers may encode the two differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EmbedIntent {
    /// Indexing a passage during ingestion
    Document,
    /// Searching with a user question
    Query,
}

/// Which encoder produced a vector. Vectors from different sources are not comparable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingSource {
    Primary,
    Fallback,
}

impl EmbeddingSource {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match *self {
            Self::Primary => "primary",
            Self::Fallback => "fallback",
        }
    }
}

impl fmt::Display for EmbeddingSource {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmbeddingSource {
    type Err = RagError;

    #[inline]
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "primary" => Ok(Self::Primary),
            "fallback" => Ok(Self::Fallback),
            other => Err(RagError::Persistence(format!(
                "Unknown embedding source '{}'",
                other
            ))),
        }
    }
}

/// A vector together with the encoder that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct EmbedResult {
    pub vector: Vec<f32>,
    pub source: EmbeddingSource,
}

/// Remote (or otherwise fallible) text embedding
pub trait EmbeddingProvider: Send + Sync {
    fn embed(&self, text: &str, intent: EmbedIntent) -> Result<Vec<f32>>;

    /// Dimension every returned vector is expected to have
    fn dimension(&self) -> usize;
}

/// Text generation for the final answer
pub trait GenerationProvider: Send + Sync {
    fn generate(&self, prompt: &str) -> Result<String>;
}
