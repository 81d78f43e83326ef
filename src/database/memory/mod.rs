#[cfg(test)]
mod tests;

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

use super::{CorpusStats, CorpusStore, NewChunk, StoredChunk};
use crate::{RagError, Result};

#[derive(Debug)]
struct Lock {
    holder: String,
    heartbeat: Instant,
}

#[derive(Debug, Default)]
struct State {
    generations: HashMap<Uuid, Vec<StoredChunk>>,
    active: Option<(Uuid, NaiveDateTime)>,
    next_id: i64,
    lock: Option<Lock>,
}

/// Corpus store held in process memory
#[derive(Debug)]
pub struct MemoryCorpus {
    corpus: String,
    state: Mutex<State>,
}

impl MemoryCorpus {
    #[inline]
    pub fn new(corpus: impl Into<String>) -> Self {
        Self {
            corpus: corpus.into(),
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| RagError::Persistence("Corpus state lock poisoned".to_string()))
    }

    fn store_chunk(state: &mut State, generation: Uuid, chunk: &NewChunk) -> Result<i64> {
        chunk.validate()?;
        let chunks = state.generations.get_mut(&generation).ok_or_else(|| {
            RagError::Persistence(format!("Unknown generation {}", generation))
        })?;

        state.next_id += 1;
        let id = state.next_id;
        chunks.push(chunk.clone().into_stored(id, Utc::now().naive_utc()));
        Ok(id)
    }
}

impl Default for MemoryCorpus {
    #[inline]
    fn default() -> Self {
        Self::new("default")
    }
}

#[async_trait]
impl CorpusStore for MemoryCorpus {
    fn corpus(&self) -> &str {
        &self.corpus
    }

    async fn delete_all(&self) -> Result<()> {
        let mut state = self.state()?;
        state.generations.clear();
        state.active = None;
        Ok(())
    }

    async fn insert_many(&self, chunks: &[NewChunk]) -> Result<usize> {
        for chunk in chunks {
            chunk.validate()?;
        }

        let mut state = self.state()?;
        let generation = match state.active {
            Some((generation, _)) => generation,
            None => {
                let generation = Uuid::new_v4();
                state.generations.insert(generation, Vec::new());
                state.active = Some((generation, Utc::now().naive_utc()));
                generation
            }
        };

        for chunk in chunks {
            Self::store_chunk(&mut state, generation, chunk)?;
        }
        Ok(chunks.len())
    }

    async fn select_all(&self) -> Result<Vec<StoredChunk>> {
        let state = self.state()?;
        let Some((generation, _)) = state.active else {
            return Ok(Vec::new());
        };

        let mut chunks = state
            .generations
            .get(&generation)
            .cloned()
            .unwrap_or_default();
        chunks.sort_by_key(|c| c.chunk_index);
        Ok(chunks)
    }

    async fn begin_generation(&self) -> Result<Uuid> {
        let generation = Uuid::new_v4();
        self.state()?.generations.insert(generation, Vec::new());
        debug!("Started generation {} for corpus {}", generation, self.corpus);
        Ok(generation)
    }

    async fn insert_chunk(&self, generation: Uuid, chunk: &NewChunk) -> Result<i64> {
        let mut state = self.state()?;
        Self::store_chunk(&mut state, generation, chunk)
    }

    async fn activate_generation(&self, generation: Uuid) -> Result<()> {
        let mut state = self.state()?;
        let chunks = state.generations.remove(&generation).ok_or_else(|| {
            RagError::Persistence(format!("Unknown generation {}", generation))
        })?;

        state.generations.clear();
        state.generations.insert(generation, chunks);
        state.active = Some((generation, Utc::now().naive_utc()));
        Ok(())
    }

    async fn discard_generation(&self, generation: Uuid) -> Result<()> {
        let mut state = self.state()?;
        if state.active.is_some_and(|(active, _)| active == generation) {
            return Err(RagError::Persistence(format!(
                "Refusing to discard the active generation {}",
                generation
            )));
        }
        state.generations.remove(&generation);
        Ok(())
    }

    async fn stats(&self) -> Result<CorpusStats> {
        let state = self.state()?;
        let mut stats = CorpusStats {
            corpus: self.corpus.clone(),
            ..CorpusStats::default()
        };

        let Some((generation, activated)) = state.active else {
            return Ok(stats);
        };
        stats.active_generation = Some(generation);
        stats.activated_date = Some(activated);

        let chunks = state.generations.get(&generation).map(Vec::as_slice).unwrap_or_default();
        let mut files: Vec<&str> = chunks.iter().map(|c| c.source_file.as_str()).collect();
        files.sort_unstable();
        files.dedup();

        stats.total_chunks = chunks.len() as i64;
        stats.source_files = files.len() as i64;
        stats.embedding_dimension = chunks.first().map(|c| c.embedding.len() as i64);
        for chunk in chunks {
            *stats
                .by_source
                .entry(chunk.embedding_source.to_string())
                .or_default() += 1;
            *stats.by_category.entry(chunk.category.clone()).or_default() += 1;
        }

        Ok(stats)
    }

    async fn acquire_lock(&self, holder: &str, stale_after: Duration) -> Result<()> {
        let mut state = self.state()?;
        let held_elsewhere = state
            .lock
            .as_ref()
            .is_some_and(|lock| lock.holder != holder && lock.heartbeat.elapsed() < stale_after);
        if held_elsewhere {
            return Err(RagError::IngestionInProgress(self.corpus.clone()));
        }

        state.lock = Some(Lock {
            holder: holder.to_string(),
            heartbeat: Instant::now(),
        });
        Ok(())
    }

    async fn refresh_lock(&self, holder: &str) -> Result<()> {
        let mut state = self.state()?;
        match state.lock.as_mut() {
            Some(lock) if lock.holder == holder => {
                lock.heartbeat = Instant::now();
                Ok(())
            }
            _ => Err(RagError::Persistence(format!(
                "Ingestion lock for '{}' is no longer held by {}",
                self.corpus, holder
            ))),
        }
    }

    async fn release_lock(&self, holder: &str) -> Result<()> {
        let mut state = self.state()?;
        if state.lock.as_ref().is_some_and(|lock| lock.holder == holder) {
            state.lock = None;
        }
        Ok(())
    }
}
