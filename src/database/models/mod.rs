
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::embeddings::EmbeddingSource;
use crate::{RagError, Result};

/// A chunk ready to be persisted. The store assigns `id` and `created_date`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewChunk {
    pub title: String,
    pub content: String,
    pub section: Option<String>,
    pub category: String,
    pub embedding: Vec<f32>,
    pub embedding_source: EmbeddingSource,
    pub chunk_index: i64,
    pub source_file: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredChunk {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub section: Option<String>,
    pub category: String,
    pub embedding: Vec<f32>,
    pub embedding_source: EmbeddingSource,
    pub chunk_index: i64,
    pub source_file: String,
    pub created_date: NaiveDateTime,
}

impl NewChunk {
    /// Reject chunks that must never reach the store
    #[inline]
    pub fn validate(&self) -> Result<()> {
        if self.content.trim().is_empty() {
            return Err(RagError::Persistence(format!(
                "Chunk {} from {} has empty content",
                self.chunk_index, self.source_file
            )));
        }
        if self.embedding.is_empty() {
            return Err(RagError::Persistence(format!(
                "Chunk {} from {} has no embedding",
                self.chunk_index, self.source_file
            )));
        }
        Ok(())
    }

    #[inline]
    pub fn into_stored(self, id: i64, created_date: NaiveDateTime) -> StoredChunk {
        StoredChunk {
            id,
            title: self.title,
            content: self.content,
            section: self.section,
            category: self.category,
            embedding: self.embedding,
            embedding_source: self.embedding_source,
            chunk_index: self.chunk_index,
            source_file: self.source_file,
            created_date,
        }
    }
}

/// Summary of the active corpus for the `status` command
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CorpusStats {
    pub corpus: String,
    pub active_generation: Option<Uuid>,
    pub activated_date: Option<NaiveDateTime>,
    pub total_chunks: i64,
    pub source_files: i64,
    pub embedding_dimension: Option<i64>,
    pub by_source: BTreeMap<String, i64>,
    pub by_category: BTreeMap<String, i64>,
}

impl CorpusStats {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.total_chunks == 0
    }

    /// True when both primary and fallback vectors are present
    #[inline]
    pub fn has_mixed_sources(&self) -> bool {
        self.by_source.values().filter(|count| **count > 0).count() > 1
    }
}

/// Encode a vector as little-endian f32 bytes
#[inline]
pub fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

#[inline]
pub fn decode_embedding(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(RagError::Persistence(format!(
            "Embedding blob length {} is not a multiple of 4",
            bytes.len()
        )));
    }

    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}
