#![expect(
    clippy::tests_outside_test_module,
    reason = "integration tests are only compiled in test mode"
)]

//! End-to-end behaviour of the retrieval pipeline
//!
//! Every test runs against a temporary SQLite corpus and local documents, so
//! no Ollama server is needed.

use anyhow::Result;
use std::collections::HashSet;
use std::sync::Arc;
use tempfile::TempDir;

use regulation_rag::RagError;
use regulation_rag::blob::FsBlobSource;
use regulation_rag::config::Config;
use regulation_rag::database::{CorpusStore, NewChunk, SqliteCorpus};
use regulation_rag::embeddings::{
    ChunkingConfig, EmbedIntent, EmbeddingProvider, EmbeddingSource, FallbackEmbedder,
    GenerationProvider, chunk_text,
};
use regulation_rag::indexer::{CancelFlag, Indexer};
use regulation_rag::search::Ranker;
use regulation_rag::service::RegulationService;

const DIMENSION: usize = 384;

/// Embeds by regulation concept so that paraphrases land near each other
struct ConceptEmbedder;

impl EmbeddingProvider for ConceptEmbedder {
    fn embed(&self, text: &str, _intent: EmbedIntent) -> regulation_rag::Result<Vec<f32>> {
        let concepts: [&[&str]; 3] = [
            &["rent", "rental", "rentals", "long", "period", "months"],
            &["repair", "repairs", "broken"],
            &["cost", "won", "fee", "cap"],
        ];
        let mut vector = vec![0.0; DIMENSION];
        for word in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            for (i, words) in concepts.iter().enumerate() {
                if words.contains(&word) {
                    vector[i] += 1.0;
                }
            }
        }
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        DIMENSION
    }
}

struct UnreachableEmbedder;

impl EmbeddingProvider for UnreachableEmbedder {
    fn embed(&self, _text: &str, _intent: EmbedIntent) -> regulation_rag::Result<Vec<f32>> {
        Err(RagError::EmbeddingProvider(
            "Request error: Connection refused".to_string(),
        ))
    }

    fn dimension(&self) -> usize {
        DIMENSION
    }
}

struct CannedGenerator;

impl GenerationProvider for CannedGenerator {
    fn generate(&self, _prompt: &str) -> regulation_rag::Result<String> {
        Ok("Devices may be rented for up to 12 months.".to_string())
    }
}

struct Workspace {
    _temp_dir: TempDir,
    docs: std::path::PathBuf,
    store: Arc<SqliteCorpus>,
    config: Config,
}

async fn workspace(documents: &[(&str, &str)]) -> Result<Workspace> {
    let temp_dir = TempDir::new()?;
    let docs = temp_dir.path().join("regulations");
    std::fs::create_dir_all(&docs)?;
    for (name, contents) in documents {
        std::fs::write(docs.join(name), contents)?;
    }

    let store = Arc::new(
        SqliteCorpus::initialize_from_config_dir(temp_dir.path(), "regulations").await?,
    );
    let config = Config {
        base_dir: temp_dir.path().to_path_buf(),
        ..Config::default()
    };

    Ok(Workspace {
        _temp_dir: temp_dir,
        docs,
        store,
        config,
    })
}

fn indexer(workspace: &Workspace, embedder: FallbackEmbedder) -> Indexer {
    Indexer::new(
        Arc::new(FsBlobSource::new(&workspace.docs)),
        workspace.store.clone(),
        Arc::new(embedder),
        &workspace.config,
    )
}

#[tokio::test]
async fn short_document_becomes_single_chunk() -> Result<()> {
    let workspace = workspace(&[("rental.txt", "Rentals may last up to 12 months.")]).await?;

    let stats = indexer(&workspace, FallbackEmbedder::local_only(DIMENSION))
        .ingest(None, &CancelFlag::new())
        .await?;
    assert_eq!(stats.chunks_stored, 1);

    let chunks = workspace.store.select_all().await?;
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].chunk_index, 0);
    assert_eq!(chunks[0].content, "Rentals may last up to 12 months.");
    assert_eq!(chunks[0].title, "rental");

    Ok(())
}

#[tokio::test]
async fn rental_question_prefers_rental_chunk() -> Result<()> {
    let workspace = workspace(&[]).await?;
    let embedder = ConceptEmbedder;

    let passages = ["Rental period is 12 months.", "Repair cost cap is 100,000 won."];
    let chunks: Vec<NewChunk> = passages
        .iter()
        .enumerate()
        .map(|(i, content)| {
            Ok(NewChunk {
                title: "Regulations".to_string(),
                content: (*content).to_string(),
                section: None,
                category: "uncategorized".to_string(),
                embedding: embedder.embed(content, EmbedIntent::Document)?,
                embedding_source: EmbeddingSource::Primary,
                chunk_index: i as i64,
                source_file: "regulations.txt".to_string(),
            })
        })
        .collect::<regulation_rag::Result<_>>()?;
    workspace.store.insert_many(&chunks).await?;

    let query = embedder.embed("How long can I rent a device?", EmbedIntent::Query)?;
    let ranked = Ranker::new(workspace.store.clone()).search(&query, 1).await?;

    assert_eq!(ranked.len(), 1);
    assert_eq!(ranked[0].chunk.content, "Rental period is 12 months.");

    Ok(())
}

#[tokio::test]
async fn unreachable_provider_still_ingests() -> Result<()> {
    let workspace = workspace(&[
        ("rental.txt", "Rentals may last up to 12 months."),
        ("repair.txt", "Repair cost cap is 100,000 won."),
    ])
    .await?;

    let service = RegulationService::new(
        Arc::new(FsBlobSource::new(&workspace.docs)),
        workspace.store.clone(),
        Arc::new(FallbackEmbedder::new(Arc::new(UnreachableEmbedder))),
        Arc::new(CannedGenerator),
        &workspace.config,
    );

    let response = service.ingest_regulations(None).await;
    assert!(response.success, "{:?}", response.error);
    assert!(response.chunks_stored > 0);
    assert_eq!(response.fallback_embeddings, response.chunks_stored);

    let chunks = workspace.store.select_all().await?;
    assert!(
        chunks
            .iter()
            .all(|c| c.embedding_source == EmbeddingSource::Fallback)
    );

    // the fallback index still answers while the provider is down
    let answer = service.answer_question("rentals may last").await;
    assert!(answer.success, "{:?}", answer.error);

    Ok(())
}

#[tokio::test]
async fn markdown_headings_become_sections() -> Result<()> {
    let markdown = "# Rental\n\nDevices may be rented for up to twelve months by registered residents.\n\n# Repair\n\nRepairs are free during the first year of ownership.\n";

    let chunks: Vec<_> = chunk_text(markdown, "policy", &ChunkingConfig::default()).collect();
    assert!(chunks.len() >= 2);
    let sections: HashSet<_> = chunks.iter().filter_map(|c| c.section.as_deref()).collect();
    assert!(sections.contains("Rental"));
    assert!(sections.contains("Repair"));

    let workspace = workspace(&[("policy.md", markdown)]).await?;
    indexer(&workspace, FallbackEmbedder::local_only(DIMENSION))
        .ingest(None, &CancelFlag::new())
        .await?;

    let stored = workspace.store.select_all().await?;
    let stored_sections: Vec<_> = stored.iter().filter_map(|c| c.section.clone()).collect();
    assert_eq!(stored_sections, vec!["Rental".to_string(), "Repair".to_string()]);
    assert_eq!(stored[0].category, "rental");
    assert_eq!(stored[1].category, "repair");

    Ok(())
}

#[tokio::test]
async fn failed_rerun_keeps_previous_corpus() -> Result<()> {
    let workspace = workspace(&[("rental.txt", "Rentals may last up to 12 months.")]).await?;
    indexer(&workspace, FallbackEmbedder::local_only(DIMENSION))
        .ingest(None, &CancelFlag::new())
        .await?;

    std::fs::remove_file(workspace.docs.join("rental.txt"))?;
    std::fs::write(workspace.docs.join("notes.docx"), "unsupported")?;

    let rerun = indexer(&workspace, FallbackEmbedder::local_only(DIMENSION))
        .ingest(None, &CancelFlag::new())
        .await;
    assert!(matches!(rerun, Err(RagError::NothingIngested(_))));

    let chunks = workspace.store.select_all().await?;
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].source_file, "rental.txt");

    Ok(())
}

#[tokio::test]
async fn second_ingestion_waits_for_lock() -> Result<()> {
    let workspace = workspace(&[("rental.txt", "Rentals may last up to 12 months.")]).await?;
    workspace
        .store
        .acquire_lock("other-process", std::time::Duration::from_secs(600))
        .await?;

    let result = indexer(&workspace, FallbackEmbedder::local_only(DIMENSION))
        .ingest(None, &CancelFlag::new())
        .await;

    let error = result.expect_err("lock is held");
    assert!(matches!(error, RagError::IngestionInProgress(_)));
    assert!(error.user_message().contains("already running"));

    Ok(())
}
