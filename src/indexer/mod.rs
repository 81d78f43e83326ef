// Indexer module
// One ingestion run: documents are extracted, chunked, classified, embedded
// and staged under a fresh generation that replaces the corpus on success.


use anyhow::anyhow;
use futures::{StreamExt, stream};
use itertools::Itertools;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::blob::BlobSource;
use crate::classifier::ClassifierConfig;
use crate::config::Config;
use crate::database::{CorpusStore, NewChunk};
use crate::embeddings::{
    ChunkingConfig, EmbedIntent, EmbedResult, EmbeddingSource, FallbackEmbedder, chunk_text,
};
use crate::extractor::{DocumentFormat, extract};
use crate::{RagError, Result};

/// Shared flag an operator can set to stop a running ingestion
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Clear a previous cancellation so the flag can guard a new run
    #[inline]
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(RagError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Tally of one ingestion run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub documents_processed: usize,
    pub documents_skipped: usize,
    pub chunks_stored: usize,
    pub chunks_failed: usize,
    /// Stored chunks whose vector came from the local fallback
    pub fallback_embeddings: usize,
    pub generation: Option<Uuid>,
}

/// A chunk with its run-wide index, waiting for a vector
#[derive(Debug, Clone)]
struct PendingChunk {
    chunk_index: i64,
    title: String,
    content: String,
    section: Option<String>,
    category: String,
    source_file: String,
}

impl PendingChunk {
    fn into_new_chunk(self, embedded: EmbedResult) -> NewChunk {
        NewChunk {
            title: self.title,
            content: self.content,
            section: self.section,
            category: self.category,
            embedding: embedded.vector,
            embedding_source: embedded.source,
            chunk_index: self.chunk_index,
            source_file: self.source_file,
        }
    }
}

/// Runs ingestion against injected collaborators
pub struct Indexer {
    blobs: Arc<dyn BlobSource>,
    store: Arc<dyn CorpusStore>,
    embedder: Arc<FallbackEmbedder>,
    chunking: ChunkingConfig,
    classifier: ClassifierConfig,
    prefix: String,
    workers: usize,
    batch_size: usize,
    lock_stale_after: Duration,
    heartbeat_interval: Duration,
}

impl Indexer {
    #[inline]
    pub fn new(
        blobs: Arc<dyn BlobSource>,
        store: Arc<dyn CorpusStore>,
        embedder: Arc<FallbackEmbedder>,
        config: &Config,
    ) -> Self {
        let lock_stale_after = Duration::from_secs(config.ingestion.lock_stale_seconds);
        Self {
            blobs,
            store,
            embedder,
            chunking: config.chunking,
            classifier: config.classifier.clone(),
            prefix: config.ingestion.prefix.clone(),
            workers: config.ingestion.workers.max(1),
            batch_size: (config.ollama.batch_size as usize).max(1),
            lock_stale_after,
            heartbeat_interval: (lock_stale_after / 4).max(Duration::from_secs(1)),
        }
    }

    #[inline]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Replace the corpus with the given documents, or every listed document
    /// when `files` is `None` or empty.
    ///
    /// Holds the corpus ingestion lock for the whole run. Per-document and
    /// per-chunk failures are counted, not returned. When the run produces
    /// no chunks, is cancelled, or fails, the previous corpus stays active.
    #[inline]
    pub async fn ingest(&self, files: Option<&[String]>, cancel: &CancelFlag) -> Result<IngestStats> {
        let lease = LockLease::acquire(
            Arc::clone(&self.store),
            self.lock_stale_after,
            self.heartbeat_interval,
        )
        .await?;
        info!(
            "Starting ingestion for corpus {} (run {})",
            self.store.corpus(),
            lease.holder
        );

        self.embedder.reset();
        let result = self.run(files, cancel, &lease).await;
        lease.release().await;

        match &result {
            Ok(stats) => info!(
                "Ingestion finished: {} chunks stored, {} failed, {} documents skipped",
                stats.chunks_stored, stats.chunks_failed, stats.documents_skipped
            ),
            Err(e) => warn!("Ingestion did not complete: {}", e),
        }
        result
    }

    async fn run(
        &self,
        files: Option<&[String]>,
        cancel: &CancelFlag,
        lease: &LockLease,
    ) -> Result<IngestStats> {
        let names: Vec<String> = match files {
            Some(files) if !files.is_empty() => files.iter().unique().cloned().collect(),
            _ => self
                .blobs
                .list(&self.prefix)
                .await?
                .into_iter()
                .unique()
                .collect(),
        };

        if names.is_empty() {
            return Err(RagError::NothingIngested(
                "no source documents were found".to_string(),
            ));
        }
        info!("Ingesting {} documents", names.len());

        let generation = self.store.begin_generation().await?;
        let mut stats = IngestStats {
            generation: Some(generation),
            ..IngestStats::default()
        };

        let staged = self.stage(generation, &names, cancel, lease, &mut stats).await;
        let outcome = match staged {
            Ok(()) if stats.chunks_stored > 0 => {
                let activated = match lease.check() {
                    Ok(()) => self.store.activate_generation(generation).await,
                    Err(e) => Err(e),
                };
                match activated {
                    Ok(()) => return Ok(stats),
                    Err(e) => Err(e),
                }
            }
            Ok(()) => Err(RagError::NothingIngested(format!(
                "{} documents skipped, {} chunks failed",
                stats.documents_skipped, stats.chunks_failed
            ))),
            Err(e) => Err(e),
        };

        if let Err(e) = self.store.discard_generation(generation).await {
            error!("Failed to discard staged generation {}: {}", generation, e);
        }
        outcome
    }

    async fn stage(
        &self,
        generation: Uuid,
        names: &[String],
        cancel: &CancelFlag,
        lease: &LockLease,
        stats: &mut IngestStats,
    ) -> Result<()> {
        let mut next_index: i64 = 0;

        for name in names {
            cancel.check()?;
            lease.check()?;

            let Some(pending) = self.prepare_document(name, &mut next_index).await else {
                stats.documents_skipped += 1;
                continue;
            };

            for batch in pending.chunks(self.batch_size) {
                cancel.check()?;
                lease.check()?;
                self.store_batch(generation, batch, stats).await;
            }
            stats.documents_processed += 1;
        }

        if stats.fallback_embeddings > 0 {
            warn!(
                "{} of {} stored chunks use fallback embeddings; retrieval quality is reduced",
                stats.fallback_embeddings, stats.chunks_stored
            );
        }
        Ok(())
    }

    /// Extract, chunk and classify one document. `None` means it was skipped.
    async fn prepare_document(&self, name: &str, next_index: &mut i64) -> Option<Vec<PendingChunk>> {
        let format = match DocumentFormat::from_filename(name) {
            Ok(format) => format,
            Err(e) => {
                warn!("Skipping {}: {}", name, e);
                return None;
            }
        };

        let bytes = match self.blobs.read(name).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Skipping {}: failed to read: {}", name, e);
                return None;
            }
        };

        let file_name = name.to_string();
        let extracted = tokio::task::spawn_blocking(move || extract(&file_name, &bytes, format))
            .await
            .map_err(|e| RagError::Other(anyhow!("Extraction task failed: {}", e)))
            .and_then(|result| result);
        let document = match extracted {
            Ok(document) => document,
            Err(e) => {
                warn!("Skipping {}: {}", name, e);
                return None;
            }
        };

        let pending: Vec<PendingChunk> = chunk_text(&document.text, &document.title, &self.chunking)
            .filter(|chunk| !chunk.content.trim().is_empty())
            .map(|chunk| {
                let chunk_index = *next_index;
                *next_index += 1;
                PendingChunk {
                    chunk_index,
                    category: self.classifier.classify(&chunk.title, &chunk.content),
                    title: chunk.title,
                    content: chunk.content,
                    section: chunk.section,
                    source_file: name.to_string(),
                }
            })
            .collect();

        debug!("{} produced {} chunks", name, pending.len());
        Some(pending)
    }

    /// Embed a batch with at most `workers` requests in flight, then persist
    /// in index order
    async fn store_batch(&self, generation: Uuid, batch: &[PendingChunk], stats: &mut IngestStats) {
        let embedded: Vec<(PendingChunk, Result<EmbedResult>)> = stream::iter(batch.iter().cloned())
            .map(|pending| {
                let embedder = Arc::clone(&self.embedder);
                async move {
                    let text = pending.content.clone();
                    let result = tokio::task::spawn_blocking(move || {
                        embedder.embed(&text, EmbedIntent::Document)
                    })
                    .await
                    .map_err(|e| RagError::Other(anyhow!("Embedding task failed: {}", e)));
                    (pending, result)
                }
            })
            .buffered(self.workers)
            .collect()
            .await;

        for (pending, result) in embedded {
            let embedded = match result {
                Ok(embedded) => embedded,
                Err(e) => {
                    warn!(
                        "Dropping chunk {} of {}: {}",
                        pending.chunk_index, pending.source_file, e
                    );
                    stats.chunks_failed += 1;
                    continue;
                }
            };

            let source = embedded.source;
            let chunk = pending.into_new_chunk(embedded);
            match self.store.insert_chunk(generation, &chunk).await {
                Ok(_) => {
                    stats.chunks_stored += 1;
                    if source == EmbeddingSource::Fallback {
                        stats.fallback_embeddings += 1;
                    }
                }
                Err(e) => {
                    warn!(
                        "Failed to store chunk {} of {}: {}",
                        chunk.chunk_index, chunk.source_file, e
                    );
                    stats.chunks_failed += 1;
                }
            }
        }
    }
}

/// The corpus ingestion lock held by one run.
///
/// A background task refreshes the heartbeat and marks the lease lost when a
/// refresh fails, which means another run took the lock over. Dropping the
/// lease without [`LockLease::release`] stops the heartbeat and releases the
/// lock from a spawned task.
struct LockLease {
    store: Arc<dyn CorpusStore>,
    holder: String,
    lost: Arc<AtomicBool>,
    heartbeat: JoinHandle<()>,
    released: bool,
}

impl LockLease {
    async fn acquire(
        store: Arc<dyn CorpusStore>,
        stale_after: Duration,
        heartbeat_interval: Duration,
    ) -> Result<Self> {
        let holder = Uuid::new_v4().to_string();
        store.acquire_lock(&holder, stale_after).await?;

        let lost = Arc::new(AtomicBool::new(false));
        let heartbeat = tokio::spawn(refresh_until_lost(
            Arc::clone(&store),
            holder.clone(),
            heartbeat_interval,
            Arc::clone(&lost),
        ));

        Ok(Self {
            store,
            holder,
            lost,
            heartbeat,
            released: false,
        })
    }

    fn check(&self) -> Result<()> {
        if self.lost.load(Ordering::SeqCst) {
            Err(RagError::IngestionInProgress(self.store.corpus().to_string()))
        } else {
            Ok(())
        }
    }

    async fn release(mut self) {
        self.heartbeat.abort();
        if let Err(e) = self.store.release_lock(&self.holder).await {
            error!("Failed to release ingestion lock: {}", e);
        }
        self.released = true;
    }
}

impl Drop for LockLease {
    fn drop(&mut self) {
        self.heartbeat.abort();
        if self.released {
            return;
        }

        warn!("Ingestion run {} was dropped before finishing", self.holder);
        let store = Arc::clone(&self.store);
        let holder = std::mem::take(&mut self.holder);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = store.release_lock(&holder).await {
                        error!("Failed to release ingestion lock: {}", e);
                    }
                });
            }
            Err(_) => warn!(
                "No runtime to release the ingestion lock; it expires once stale"
            ),
        }
    }
}

/// Refresh the lock until aborted, or until a refresh fails
async fn refresh_until_lost(
    store: Arc<dyn CorpusStore>,
    holder: String,
    interval: Duration,
    lost: Arc<AtomicBool>,
) {
    loop {
        sleep(interval).await;
        if let Err(e) = store.refresh_lock(&holder).await {
            error!("Lost ingestion lock for {}: {}", store.corpus(), e);
            lost.store(true, Ordering::SeqCst);
            return;
        }
    }
}
