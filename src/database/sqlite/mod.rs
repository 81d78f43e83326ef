
use anyhow::{Context, anyhow};
use async_trait::async_trait;
use chrono::{NaiveDateTime, TimeDelta, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use super::{CorpusStats, CorpusStore, NewChunk, StoredChunk, decode_embedding, encode_embedding};
use crate::embeddings::EmbeddingSource;
use crate::{RagError, Result};

pub type DbPool = Pool<Sqlite>;

const CHUNK_COLUMNS: &str = "id, title, content, section, category, embedding, embedding_source, chunk_index, source_file, created_date";

/// Corpus store backed by a SQLite database file
#[derive(Debug, Clone)]
pub struct SqliteCorpus {
    pool: DbPool,
    corpus: String,
}

#[derive(Debug, FromRow)]
struct ChunkRow {
    id: i64,
    title: String,
    content: String,
    section: Option<String>,
    category: String,
    embedding: Vec<u8>,
    embedding_source: String,
    chunk_index: i64,
    source_file: String,
    created_date: NaiveDateTime,
}

impl TryFrom<ChunkRow> for StoredChunk {
    type Error = RagError;

    fn try_from(row: ChunkRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            title: row.title,
            content: row.content,
            section: row.section,
            category: row.category,
            embedding: decode_embedding(&row.embedding)?,
            embedding_source: row.embedding_source.parse()?,
            chunk_index: row.chunk_index,
            source_file: row.source_file,
            created_date: row.created_date,
        })
    }
}

fn persistence(error: anyhow::Error) -> RagError {
    RagError::Persistence(format!("{:#}", error))
}

impl SqliteCorpus {
    #[inline]
    pub async fn open<P: AsRef<Path>>(database_path: P, corpus: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await
            .context("Failed to create database connection pool")
            .map_err(persistence)?;

        Self::from_pool(pool, corpus).await
    }

    /// Open `corpus.db` inside a configuration directory, creating it if needed
    #[inline]
    pub async fn initialize_from_config_dir(config_dir: &Path, corpus: &str) -> Result<Self> {
        std::fs::create_dir_all(config_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                config_dir.display()
            )
        })?;

        Self::open(config_dir.join("corpus.db"), corpus).await
    }

    #[inline]
    pub async fn from_pool(pool: DbPool, corpus: &str) -> Result<Self> {
        let store = Self {
            pool,
            corpus: corpus.to_string(),
        };
        store.run_migrations().await.map_err(persistence)?;
        Ok(store)
    }

    #[inline]
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    async fn run_migrations(&self) -> anyhow::Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("src/database/sqlite/migrations")
            .run(&self.pool)
            .await
            .context("Failed to run schema migration")?;

        debug!("Database migrations completed successfully");
        Ok(())
    }

    async fn active_generation(&self) -> anyhow::Result<Option<(Uuid, NaiveDateTime)>> {
        let row: Option<(String, NaiveDateTime)> = sqlx::query_as(
            "SELECT active_generation, activated_date FROM corpus_generations WHERE corpus = ?",
        )
        .bind(&self.corpus)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to read active generation")?;

        row.map(|(generation, activated)| {
            Uuid::parse_str(&generation)
                .map(|id| (id, activated))
                .with_context(|| format!("Invalid generation id '{}'", generation))
        })
        .transpose()
    }

    async fn insert_row<'e, E>(
        &self,
        executor: E,
        generation: Uuid,
        chunk: &NewChunk,
    ) -> anyhow::Result<i64>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        let id = sqlx::query(
            "INSERT INTO chunks (corpus, generation_id, title, content, section, category, embedding, embedding_dim, embedding_source, chunk_index, source_file, created_date)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&self.corpus)
        .bind(generation.to_string())
        .bind(&chunk.title)
        .bind(&chunk.content)
        .bind(&chunk.section)
        .bind(&chunk.category)
        .bind(encode_embedding(&chunk.embedding))
        .bind(chunk.embedding.len() as i64)
        .bind(chunk.embedding_source.as_str())
        .bind(chunk.chunk_index)
        .bind(&chunk.source_file)
        .bind(Utc::now().naive_utc())
        .execute(executor)
        .await
        .with_context(|| {
            format!(
                "Failed to insert chunk {} from {}",
                chunk.chunk_index, chunk.source_file
            )
        })?
        .last_insert_rowid();

        Ok(id)
    }

    async fn fetch_chunks(&self, source: Option<EmbeddingSource>) -> Result<Vec<StoredChunk>> {
        let Some((generation, _)) = self.active_generation().await.map_err(persistence)? else {
            return Ok(Vec::new());
        };

        let rows: Vec<ChunkRow> = match source {
            Some(source) => sqlx::query_as(&format!(
                "SELECT {} FROM chunks WHERE corpus = ? AND generation_id = ? AND embedding_source = ? ORDER BY chunk_index",
                CHUNK_COLUMNS
            ))
            .bind(&self.corpus)
            .bind(generation.to_string())
            .bind(source.as_str())
            .fetch_all(&self.pool)
            .await,
            None => sqlx::query_as(&format!(
                "SELECT {} FROM chunks WHERE corpus = ? AND generation_id = ? ORDER BY chunk_index",
                CHUNK_COLUMNS
            ))
            .bind(&self.corpus)
            .bind(generation.to_string())
            .fetch_all(&self.pool)
            .await,
        }
        .context("Failed to select chunks")
        .map_err(persistence)?;

        rows.into_iter().map(StoredChunk::try_from).collect()
    }

    async fn set_active(&self, generation: Uuid) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let staged: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE corpus = ? AND generation_id = ?")
                .bind(&self.corpus)
                .bind(generation.to_string())
                .fetch_one(&mut *tx)
                .await
                .context("Failed to count staged chunks")?;
        if staged == 0 {
            return Err(anyhow!("Generation {} has no chunks", generation));
        }

        sqlx::query(
            "INSERT INTO corpus_generations (corpus, active_generation, activated_date) VALUES (?, ?, ?)
             ON CONFLICT(corpus) DO UPDATE SET active_generation = excluded.active_generation, activated_date = excluded.activated_date",
        )
        .bind(&self.corpus)
        .bind(generation.to_string())
        .bind(Utc::now().naive_utc())
        .execute(&mut *tx)
        .await
        .context("Failed to swap active generation")?;

        let removed = sqlx::query("DELETE FROM chunks WHERE corpus = ? AND generation_id != ?")
            .bind(&self.corpus)
            .bind(generation.to_string())
            .execute(&mut *tx)
            .await
            .context("Failed to remove old generations")?
            .rows_affected();

        tx.commit().await.context("Failed to commit generation swap")?;

        info!(
            "Activated generation {} for corpus {} ({} old chunks removed)",
            generation, self.corpus, removed
        );
        Ok(())
    }
}

#[async_trait]
impl CorpusStore for SqliteCorpus {
    fn corpus(&self) -> &str {
        &self.corpus
    }

    async fn delete_all(&self) -> Result<()> {
        let result: anyhow::Result<()> = async {
            let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
            sqlx::query("DELETE FROM chunks WHERE corpus = ?")
                .bind(&self.corpus)
                .execute(&mut *tx)
                .await
                .context("Failed to delete chunks")?;
            sqlx::query("DELETE FROM corpus_generations WHERE corpus = ?")
                .bind(&self.corpus)
                .execute(&mut *tx)
                .await
                .context("Failed to clear active generation")?;
            tx.commit().await.context("Failed to commit delete")?;
            Ok(())
        }
        .await;

        result.map_err(persistence)
    }

    async fn insert_many(&self, chunks: &[NewChunk]) -> Result<usize> {
        for chunk in chunks {
            chunk.validate()?;
        }

        let result: anyhow::Result<usize> = async {
            let generation = match self.active_generation().await? {
                Some((generation, _)) => generation,
                None => Uuid::new_v4(),
            };

            let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
            for chunk in chunks {
                self.insert_row(&mut *tx, generation, chunk).await?;
            }
            sqlx::query(
                "INSERT INTO corpus_generations (corpus, active_generation, activated_date) VALUES (?, ?, ?)
                 ON CONFLICT(corpus) DO NOTHING",
            )
            .bind(&self.corpus)
            .bind(generation.to_string())
            .bind(Utc::now().naive_utc())
            .execute(&mut *tx)
            .await
            .context("Failed to record active generation")?;
            tx.commit().await.context("Failed to commit chunk insert")?;

            Ok(chunks.len())
        }
        .await;

        result.map_err(persistence)
    }

    async fn select_all(&self) -> Result<Vec<StoredChunk>> {
        self.fetch_chunks(None).await
    }

    async fn select_by_source(&self, source: EmbeddingSource) -> Result<Vec<StoredChunk>> {
        self.fetch_chunks(Some(source)).await
    }

    async fn begin_generation(&self) -> Result<Uuid> {
        let generation = Uuid::new_v4();
        debug!("Started generation {} for corpus {}", generation, self.corpus);
        Ok(generation)
    }

    async fn insert_chunk(&self, generation: Uuid, chunk: &NewChunk) -> Result<i64> {
        chunk.validate()?;
        self.insert_row(&self.pool, generation, chunk)
            .await
            .map_err(persistence)
    }

    async fn activate_generation(&self, generation: Uuid) -> Result<()> {
        self.set_active(generation).await.map_err(persistence)
    }

    async fn discard_generation(&self, generation: Uuid) -> Result<()> {
        if self
            .active_generation()
            .await
            .map_err(persistence)?
            .is_some_and(|(active, _)| active == generation)
        {
            return Err(RagError::Persistence(format!(
                "Refusing to discard the active generation {}",
                generation
            )));
        }

        let removed = sqlx::query("DELETE FROM chunks WHERE corpus = ? AND generation_id = ?")
            .bind(&self.corpus)
            .bind(generation.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to discard generation")
            .map_err(persistence)?
            .rows_affected();

        debug!("Discarded generation {} ({} chunks)", generation, removed);
        Ok(())
    }

    async fn stats(&self) -> Result<CorpusStats> {
        let mut stats = CorpusStats {
            corpus: self.corpus.clone(),
            ..CorpusStats::default()
        };

        let Some((generation, activated)) = self.active_generation().await.map_err(persistence)?
        else {
            return Ok(stats);
        };
        stats.active_generation = Some(generation);
        stats.activated_date = Some(activated);

        let result: anyhow::Result<()> = async {
            let (total, files, dimension): (i64, i64, Option<i64>) = sqlx::query_as(
                "SELECT COUNT(*), COUNT(DISTINCT source_file), MAX(embedding_dim) FROM chunks WHERE corpus = ? AND generation_id = ?",
            )
            .bind(&self.corpus)
            .bind(generation.to_string())
            .fetch_one(&self.pool)
            .await
            .context("Failed to count chunks")?;
            stats.total_chunks = total;
            stats.source_files = files;
            stats.embedding_dimension = dimension;

            let by_source: Vec<(String, i64)> = sqlx::query_as(
                "SELECT embedding_source, COUNT(*) FROM chunks WHERE corpus = ? AND generation_id = ? GROUP BY embedding_source",
            )
            .bind(&self.corpus)
            .bind(generation.to_string())
            .fetch_all(&self.pool)
            .await
            .context("Failed to count chunks by source")?;
            stats.by_source = by_source.into_iter().collect::<BTreeMap<_, _>>();

            let by_category: Vec<(String, i64)> = sqlx::query_as(
                "SELECT category, COUNT(*) FROM chunks WHERE corpus = ? AND generation_id = ? GROUP BY category",
            )
            .bind(&self.corpus)
            .bind(generation.to_string())
            .fetch_all(&self.pool)
            .await
            .context("Failed to count chunks by category")?;
            stats.by_category = by_category.into_iter().collect::<BTreeMap<_, _>>();

            Ok(())
        }
        .await;

        result.map_err(persistence)?;
        Ok(stats)
    }

    async fn acquire_lock(&self, holder: &str, stale_after: Duration) -> Result<()> {
        let now = Utc::now().naive_utc();
        let stale_before = TimeDelta::from_std(stale_after)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .unwrap_or(NaiveDateTime::MIN);

        // Inserts a fresh row, or takes over one whose heartbeat is stale
        let acquired = sqlx::query(
            "INSERT INTO ingestion_locks (corpus, holder, acquired_date, heartbeat) VALUES (?, ?, ?, ?)
             ON CONFLICT(corpus) DO UPDATE SET holder = excluded.holder, acquired_date = excluded.acquired_date, heartbeat = excluded.heartbeat
             WHERE ingestion_locks.holder = excluded.holder OR ingestion_locks.heartbeat < ?",
        )
        .bind(&self.corpus)
        .bind(holder)
        .bind(now)
        .bind(now)
        .bind(stale_before)
        .execute(&self.pool)
        .await
        .context("Failed to acquire ingestion lock")
        .map_err(persistence)?
        .rows_affected();

        if acquired == 0 {
            return Err(RagError::IngestionInProgress(self.corpus.clone()));
        }

        debug!("Acquired ingestion lock for {} as {}", self.corpus, holder);
        Ok(())
    }

    async fn refresh_lock(&self, holder: &str) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE ingestion_locks SET heartbeat = ? WHERE corpus = ? AND holder = ?",
        )
        .bind(Utc::now().naive_utc())
        .bind(&self.corpus)
        .bind(holder)
        .execute(&self.pool)
        .await
        .context("Failed to update ingestion heartbeat")
        .map_err(persistence)?
        .rows_affected();

        if updated == 0 {
            return Err(RagError::Persistence(format!(
                "Ingestion lock for '{}' is no longer held by {}",
                self.corpus, holder
            )));
        }
        Ok(())
    }

    async fn release_lock(&self, holder: &str) -> Result<()> {
        sqlx::query("DELETE FROM ingestion_locks WHERE corpus = ? AND holder = ?")
            .bind(&self.corpus)
            .bind(holder)
            .execute(&self.pool)
            .await
            .context("Failed to release ingestion lock")
            .map_err(persistence)?;

        debug!("Released ingestion lock for {}", self.corpus);
        Ok(())
    }
}
