// The two operations offered to the surrounding application.
// Both always return a structured response; failures become `success: false`.


use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};

use crate::answer::{AnswerSource, Synthesizer};
use crate::blob::{BlobSource, ChainedBlobSource, FsBlobSource};
use crate::config::Config;
use crate::database::{CorpusStats, CorpusStore, SqliteCorpus};
use crate::embeddings::{EmbeddingProvider, FallbackEmbedder, GenerationProvider, OllamaClient};
use crate::indexer::{CancelFlag, IngestStats, Indexer};
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestResponse {
    pub success: bool,
    pub chunks_stored: usize,
    pub chunks_failed: usize,
    pub documents_skipped: usize,
    pub fallback_embeddings: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IngestResponse {
    fn from_stats(stats: &IngestStats) -> Self {
        Self {
            success: true,
            chunks_stored: stats.chunks_stored,
            chunks_failed: stats.chunks_failed,
            documents_skipped: stats.documents_skipped,
            fallback_embeddings: stats.fallback_embeddings,
            error: None,
        }
    }

    fn failure(message: String) -> Self {
        Self {
            success: false,
            chunks_stored: 0,
            chunks_failed: 0,
            documents_skipped: 0,
            fallback_embeddings: 0,
            error: Some(message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<AnswerSource>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AnswerResponse {
    fn failure(message: String) -> Self {
        Self {
            success: false,
            answer: None,
            sources: None,
            confidence: None,
            error: Some(message),
        }
    }
}

/// Ingestion and question answering over one regulation corpus
pub struct RegulationService {
    store: Arc<dyn CorpusStore>,
    indexer: Indexer,
    synthesizer: Synthesizer,
    cancel: CancelFlag,
}

impl RegulationService {
    #[inline]
    pub fn new(
        blobs: Arc<dyn BlobSource>,
        store: Arc<dyn CorpusStore>,
        embedder: Arc<FallbackEmbedder>,
        generator: Arc<dyn GenerationProvider>,
        config: &Config,
    ) -> Self {
        let indexer = Indexer::new(
            blobs,
            Arc::clone(&store),
            Arc::clone(&embedder),
            config,
        );
        let synthesizer = Synthesizer::new(
            embedder,
            Arc::clone(&store),
            generator,
            config.retrieval.clone(),
        );

        Self {
            store,
            indexer,
            synthesizer,
            cancel: CancelFlag::new(),
        }
    }

    /// Wire up the SQLite corpus, the configured source directories and Ollama
    #[inline]
    pub async fn from_config(config: &Config) -> Result<Self> {
        let store = SqliteCorpus::open(config.database_path(), &config.ingestion.corpus).await?;

        let sources: Vec<Arc<dyn BlobSource>> = config
            .resolved_source_dirs()
            .into_iter()
            .map(|dir| Arc::new(FsBlobSource::new(dir)) as Arc<dyn BlobSource>)
            .collect();

        let client = Arc::new(OllamaClient::new(&config.ollama)?);
        let embedder = Arc::new(FallbackEmbedder::new(
            Arc::clone(&client) as Arc<dyn EmbeddingProvider>
        ));

        Ok(Self::new(
            Arc::new(ChainedBlobSource::new(sources)),
            Arc::new(store),
            embedder,
            client,
            config,
        ))
    }

    /// Flag that stops the ingestion run in progress when set
    #[inline]
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Replace the corpus with the given documents (or every available one)
    #[inline]
    pub async fn ingest_regulations(&self, files: Option<Vec<String>>) -> IngestResponse {
        self.cancel.reset();

        match self.indexer.ingest(files.as_deref(), &self.cancel).await {
            Ok(stats) => IngestResponse::from_stats(&stats),
            Err(e) => {
                error!("Ingestion failed: {}", e);
                IngestResponse::failure(e.user_message())
            }
        }
    }

    #[inline]
    pub async fn answer_question(&self, query: &str) -> AnswerResponse {
        if query.trim().is_empty() {
            return AnswerResponse::failure("The question is empty.".to_string());
        }

        match self.synthesizer.answer(query).await {
            Ok(answer) => {
                info!("Answered question ({} sources)", answer.sources.len());
                AnswerResponse {
                    success: true,
                    answer: Some(answer.text),
                    sources: Some(answer.sources),
                    confidence: Some(answer.confidence),
                    error: None,
                }
            }
            Err(e) => {
                error!("Failed to answer question: {}", e);
                AnswerResponse::failure(e.user_message())
            }
        }
    }

    #[inline]
    pub async fn stats(&self) -> Result<CorpusStats> {
        self.store.stats().await
    }
}
