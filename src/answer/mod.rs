#[cfg(test)]
mod tests;

use anyhow::anyhow;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::RetrievalConfig;
use crate::database::CorpusStore;
use crate::embeddings::{
    EmbedIntent, EmbeddingSource, FallbackEmbedder, GenerationProvider, fallback_embed,
};
use crate::search::{Ranker, ScoredChunk};
use crate::{RagError, Result};

/// A passage the answer was grounded on
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerSource {
    pub title: String,
    pub section: Option<String>,
    pub source_file: String,
    pub category: String,
    pub chunk_index: i64,
    pub score: f32,
    pub embedding_source: EmbeddingSource,
}

impl From<&ScoredChunk> for AnswerSource {
    #[inline]
    fn from(scored: &ScoredChunk) -> Self {
        Self {
            title: scored.chunk.title.clone(),
            section: scored.chunk.section.clone(),
            source_file: scored.chunk.source_file.clone(),
            category: scored.chunk.category.clone(),
            chunk_index: scored.chunk.chunk_index,
            score: scored.score,
            embedding_source: scored.chunk.embedding_source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub text: String,
    pub sources: Vec<AnswerSource>,
    /// Mean similarity over the top-K passages that scored above zero, counting
    /// those trimmed from the prompt context. A heuristic, not a probability.
    pub confidence: f32,
}

/// Retrieves passages for a question and asks the generation provider to answer from them
pub struct Synthesizer {
    embedder: Arc<FallbackEmbedder>,
    ranker: Ranker,
    generator: Arc<dyn GenerationProvider>,
    config: RetrievalConfig,
}

impl Synthesizer {
    #[inline]
    pub fn new(
        embedder: Arc<FallbackEmbedder>,
        store: Arc<dyn CorpusStore>,
        generator: Arc<dyn GenerationProvider>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            embedder,
            ranker: Ranker::new(store),
            generator,
            config,
        }
    }

    #[inline]
    pub async fn answer(&self, query: &str) -> Result<Answer> {
        let query = query.trim();
        let retrieved = self.retrieve(query).await?;

        let usable: Vec<ScoredChunk> = retrieved.into_iter().filter(|s| s.score > 0.0).collect();
        if usable.is_empty() {
            return Err(RagError::NoRelevantContext);
        }

        let confidence = usable.iter().map(|s| s.score).sum::<f32>() / usable.len() as f32;
        let (context, used) = build_context(&usable, self.config.max_context_chars);
        let prompt = build_prompt(query, &context, &self.config.answer_language);

        debug!(
            "Generating answer from {} passages ({} context chars)",
            used,
            context.chars().count()
        );

        let generator = Arc::clone(&self.generator);
        let text = tokio::task::spawn_blocking(move || generator.generate(&prompt))
            .await
            .map_err(|e| RagError::Other(anyhow!("Generation task failed: {}", e)))??;

        if text.trim().is_empty() {
            return Err(RagError::Generation(
                "Provider returned an empty answer".to_string(),
            ));
        }

        info!(
            "Answered question with {} sources (confidence {:.3})",
            used, confidence
        );

        Ok(Answer {
            text,
            sources: usable.iter().take(used).map(AnswerSource::from).collect(),
            confidence,
        })
    }

    /// Rank within a single embedding source.
    ///
    /// The primary index is used when the primary provider embeds the query
    /// and primary chunks exist. Otherwise the fallback index is ranked with
    /// a fallback query vector. A primary failure is only surfaced when the
    /// corpus holds nothing but primary chunks.
    async fn retrieve(&self, query: &str) -> Result<Vec<ScoredChunk>> {
        let top_k = self.config.top_k;
        let dimension = self.embedder.dimension();
        let mut primary_error = None;

        if let Some(primary) = self.embedder.primary() {
            let primary = Arc::clone(primary);
            let text = query.to_string();
            let embedded =
                tokio::task::spawn_blocking(move || primary.embed(&text, EmbedIntent::Query))
                    .await
                    .map_err(|e| RagError::Other(anyhow!("Embedding task failed: {}", e)))?;

            match embedded {
                Ok(vector) if vector.len() == dimension => {
                    match self
                        .ranker
                        .search_source(EmbeddingSource::Primary, &vector, top_k)
                        .await
                    {
                        Err(RagError::NoData) => {
                            debug!("No primary-embedded chunks, trying fallback index");
                        }
                        other => return other,
                    }
                }
                Ok(vector) => {
                    warn!(
                        "Query embedding has {} dimensions, expected {}",
                        vector.len(),
                        dimension
                    );
                    primary_error = Some(RagError::DimensionMismatch {
                        expected: dimension,
                        actual: vector.len(),
                    });
                }
                Err(e) => {
                    warn!("Primary query embedding failed: {}", e);
                    primary_error = Some(e);
                }
            }
        }

        let vector = fallback_embed(query, dimension);
        match self
            .ranker
            .search_source(EmbeddingSource::Fallback, &vector, top_k)
            .await
        {
            Err(RagError::NoData) => match primary_error {
                Some(error) => {
                    if self.ranker.has_chunks(EmbeddingSource::Primary).await? {
                        Err(error)
                    } else {
                        Err(RagError::NoData)
                    }
                }
                None => Err(RagError::NoData),
            },
            other => other,
        }
    }
}

/// Join passages in rank order until `max_chars` is reached. The first
/// passage is always included, cut to fit if needed. Returns the context and
/// how many passages it holds.
#[inline]
pub fn build_context(passages: &[ScoredChunk], max_chars: usize) -> (String, usize) {
    let mut context = String::new();
    let mut used_chars = 0;
    let mut used = 0;

    for (i, scored) in passages.iter().enumerate() {
        let block = format_passage(i + 1, scored);
        let separator = if context.is_empty() { 0 } else { 2 };
        let block_chars = block.chars().count();

        if used_chars + separator + block_chars > max_chars {
            if used == 0 {
                context = block.chars().take(max_chars).collect();
                used = 1;
            }
            break;
        }

        if separator > 0 {
            context.push_str("\n\n");
        }
        context.push_str(&block);
        used_chars += separator + block_chars;
        used += 1;
    }

    (context, used)
}

fn format_passage(number: usize, scored: &ScoredChunk) -> String {
    let chunk = &scored.chunk;
    match &chunk.section {
        Some(section) if section != &chunk.title => format!(
            "[{}] {} ({})\n{}",
            number, chunk.title, section, chunk.content
        ),
        _ => format!("[{}] {}\n{}", number, chunk.title, chunk.content),
    }
}

/// Instruction prompt for the generation provider
#[inline]
pub fn build_prompt(query: &str, context: &str, language: &str) -> String {
    format!(
        "You answer questions about the organization's regulations.\n\
         Use only the regulation excerpts in the context below. Do not rely on outside knowledge.\n\
         If the context does not answer the question, say clearly that the provided regulations do not cover it.\n\
         Write the answer in {language}.\n\
         \n\
         Context:\n\
         {context}\n\
         \n\
         Question: {query}\n\
         \n\
         Answer:"
    )
}
