// Database module
// The corpus store: chunks, their vectors, and generation bookkeeping

pub mod memory;
pub mod models;
pub mod sqlite;

use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

use crate::Result;
use crate::embeddings::EmbeddingSource;

pub use memory::MemoryCorpus;
pub use models::{CorpusStats, NewChunk, StoredChunk, decode_embedding, encode_embedding};
pub use sqlite::SqliteCorpus;

/// Durable storage for one named corpus.
///
/// Chunks live in generations. Readers only ever see the active generation;
/// an ingestion run stages a new generation and activates it in one step,
/// which also removes every older generation.
#[async_trait]
pub trait CorpusStore: Send + Sync {
    /// Name of the corpus this store is bound to
    fn corpus(&self) -> &str;

    /// Remove every chunk and the active generation pointer
    async fn delete_all(&self) -> Result<()>;

    /// Insert chunks straight into the active generation, creating one if needed
    async fn insert_many(&self, chunks: &[NewChunk]) -> Result<usize>;

    /// Every chunk of the active generation, ordered by `chunk_index`
    async fn select_all(&self) -> Result<Vec<StoredChunk>>;

    /// Chunks of the active generation whose vectors came from `source`
    async fn select_by_source(&self, source: EmbeddingSource) -> Result<Vec<StoredChunk>> {
        let chunks = self.select_all().await?;
        Ok(chunks
            .into_iter()
            .filter(|c| c.embedding_source == source)
            .collect())
    }

    /// Start a staging generation that readers cannot see yet
    async fn begin_generation(&self) -> Result<Uuid>;

    /// Persist one chunk into a staging generation, returning its id
    async fn insert_chunk(&self, generation: Uuid, chunk: &NewChunk) -> Result<i64>;

    /// Make `generation` active and drop every other generation, atomically
    async fn activate_generation(&self, generation: Uuid) -> Result<()>;

    /// Throw away a staging generation
    async fn discard_generation(&self, generation: Uuid) -> Result<()>;

    async fn stats(&self) -> Result<CorpusStats>;

    /// Take the ingestion lock for this corpus. Fails with
    /// `IngestionInProgress` unless the current holder's heartbeat is older
    /// than `stale_after`.
    async fn acquire_lock(&self, holder: &str, stale_after: Duration) -> Result<()>;

    async fn refresh_lock(&self, holder: &str) -> Result<()>;

    async fn release_lock(&self, holder: &str) -> Result<()>;
}
