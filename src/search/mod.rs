// Similarity ranking
// Linear scan over stored vectors; fine for a regulation corpus of a few
// thousand chunks. An ANN index can replace `rank` behind the same contract.


use serde::Serialize;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::debug;

use crate::database::{CorpusStore, StoredChunk};
use crate::embeddings::EmbeddingSource;
use crate::{RagError, Result};

/// A stored chunk together with its similarity to the query
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredChunk {
    pub chunk: StoredChunk,
    pub score: f32,
}

/// Cosine of the angle between two vectors.
///
/// Returns 0 when either vector has zero norm. Vectors of different length
/// are an error rather than a silent truncation.
#[inline]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32> {
    if a.len() != b.len() {
        return Err(RagError::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }

    let (dot, norm_a, norm_b) = a
        .iter()
        .zip(b)
        .fold((0.0f32, 0.0f32, 0.0f32), |(dot, na, nb), (x, y)| {
            (dot + x * y, na + x * x, nb + y * y)
        });

    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }

    Ok(dot / (norm_a.sqrt() * norm_b.sqrt()))
}

/// Score every chunk against `query` and keep the best `k`, highest first.
///
/// An empty `chunks` slice is `NoData`, so callers can tell "nothing
/// indexed" apart from "nothing matched".
#[inline]
pub fn rank(chunks: Vec<StoredChunk>, query: &[f32], k: usize) -> Result<Vec<ScoredChunk>> {
    if chunks.is_empty() {
        return Err(RagError::NoData);
    }

    let total = chunks.len();
    let mut scored = chunks
        .into_iter()
        .map(|chunk| {
            let score = cosine_similarity(query, &chunk.embedding)?;
            Ok(ScoredChunk { chunk, score })
        })
        .collect::<Result<Vec<_>>>()?;

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.chunk.chunk_index.cmp(&b.chunk.chunk_index))
    });
    scored.truncate(k);

    debug!(
        "Ranked {} chunks, kept {} (best score {:?})",
        total,
        scored.len(),
        scored.first().map(|s| s.score)
    );
    Ok(scored)
}

/// Ranks against the active corpus of a store
#[derive(Clone)]
pub struct Ranker {
    store: Arc<dyn CorpusStore>,
}

impl Ranker {
    #[inline]
    pub fn new(store: Arc<dyn CorpusStore>) -> Self {
        Self { store }
    }

    /// Top `k` chunks over the whole active corpus
    #[inline]
    pub async fn search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredChunk>> {
        let chunks = self.store.select_all().await?;
        rank(chunks, query, k)
    }

    /// Top `k` chunks among those embedded by `source`
    #[inline]
    pub async fn search_source(
        &self,
        source: EmbeddingSource,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredChunk>> {
        let chunks = self.store.select_by_source(source).await?;
        rank(chunks, query, k)
    }

    /// Whether the active corpus holds any chunk embedded by `source`
    #[inline]
    pub async fn has_chunks(&self, source: EmbeddingSource) -> Result<bool> {
        Ok(!self.store.select_by_source(source).await?.is_empty())
    }
}
