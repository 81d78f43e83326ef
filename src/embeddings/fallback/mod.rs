
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::{debug, warn};

use super::{EmbedIntent, EmbedResult, EmbeddingProvider, EmbeddingSource};
use crate::RagError;

/// Deterministic bag-of-tokens embedding used when the primary provider is unavailable.
///
/// Tokens are lowercased and split on whitespace. Token `i` adds `1 / (i + 1)`
/// at `hash(token) % dimension`, then the vector is L2-normalized. A text with
/// no tokens yields the zero vector. The hash is blake3, so vectors are stable
/// across processes and platforms.
#[inline]
pub fn fallback_embed(text: &str, dimension: usize) -> Vec<f32> {
    let mut vector = vec![0.0f32; dimension];
    if dimension == 0 {
        return vector;
    }

    for (i, token) in text.to_lowercase().split_whitespace().enumerate() {
        let index = (token_hash(token) % dimension as u64) as usize;
        vector[index] += 1.0 / (i as f32 + 1.0);
    }

    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in &mut vector {
            *value /= norm;
        }
    }

    vector
}

fn token_hash(token: &str) -> u64 {
    let hash = blake3::hash(token.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(bytes)
}

/// Consecutive primary failures after which the primary is skipped until [`FallbackEmbedder::reset`]
pub const PRIMARY_FAILURE_LIMIT: usize = 3;

/// Embeds with the primary provider and degrades to [`fallback_embed`] on failure.
///
/// Failures are never returned to the caller; the [`EmbeddingSource`] on each
/// result records which encoder was used. The primary is skipped once it
/// rejects credentials or after [`PRIMARY_FAILURE_LIMIT`] consecutive
/// failures, until [`FallbackEmbedder::reset`] is called.
pub struct FallbackEmbedder {
    primary: Option<Arc<dyn EmbeddingProvider>>,
    dimension: usize,
    primary_disabled: AtomicBool,
    consecutive_failures: AtomicUsize,
}

impl FallbackEmbedder {
    #[inline]
    pub fn new(primary: Arc<dyn EmbeddingProvider>) -> Self {
        let dimension = primary.dimension();
        Self {
            primary: Some(primary),
            dimension,
            primary_disabled: AtomicBool::new(false),
            consecutive_failures: AtomicUsize::new(0),
        }
    }

    /// An embedder that only ever uses the local fallback
    #[inline]
    pub fn local_only(dimension: usize) -> Self {
        Self {
            primary: None,
            dimension,
            primary_disabled: AtomicBool::new(true),
            consecutive_failures: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    #[inline]
    pub fn primary(&self) -> Option<&Arc<dyn EmbeddingProvider>> {
        self.primary.as_ref()
    }

    /// Whether `embed` currently skips the primary provider
    #[inline]
    pub fn is_primary_disabled(&self) -> bool {
        self.primary_disabled.load(Ordering::Relaxed)
    }

    /// Give the primary provider another chance, e.g. at the start of a run
    #[inline]
    pub fn reset(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.primary_disabled
            .store(self.primary.is_none(), Ordering::Relaxed);
    }

    #[inline]
    pub fn embed(&self, text: &str, intent: EmbedIntent) -> EmbedResult {
        if let Some(primary) = self.active_primary() {
            match primary.embed(text, intent) {
                Ok(vector) if vector.len() == self.dimension => {
                    self.consecutive_failures.store(0, Ordering::Relaxed);
                    return EmbedResult {
                        vector,
                        source: EmbeddingSource::Primary,
                    };
                }
                Ok(vector) => {
                    warn!(
                        "Primary embedding has {} dimensions, expected {}; using fallback",
                        vector.len(),
                        self.dimension
                    );
                    self.record_failure();
                }
                Err(RagError::ProviderAuth(message)) => {
                    warn!(
                        "Embedding provider rejected credentials ({}); using fallback embeddings for the rest of this run",
                        message
                    );
                    self.primary_disabled.store(true, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!("Primary embedding failed, using fallback: {}", e);
                    self.record_failure();
                }
            }
        }

        debug!("Generating fallback embedding ({} dims)", self.dimension);
        EmbedResult {
            vector: fallback_embed(text, self.dimension),
            source: EmbeddingSource::Fallback,
        }
    }

    fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= PRIMARY_FAILURE_LIMIT && !self.primary_disabled.swap(true, Ordering::Relaxed) {
            warn!(
                "Primary embedding failed {} times in a row; using fallback embeddings until reset",
                failures
            );
        }
    }

    fn active_primary(&self) -> Option<&Arc<dyn EmbeddingProvider>> {
        if self.primary_disabled.load(Ordering::Relaxed) {
            None
        } else {
            self.primary.as_ref()
        }
    }
}
