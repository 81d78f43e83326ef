use super::*;
use crate::database::{MemoryCorpus, NewChunk};
use crate::embeddings::EmbeddingProvider;
use chrono::Utc;
use std::sync::Mutex;

/// Maps words onto a few regulation concepts so related texts share dimensions
struct ConceptEmbedder;

const DIMENSION: usize = 768;

const CONCEPTS: [&[&str]; 4] = [
    &["rent", "rental", "borrow"],
    &["repair", "fix", "broken"],
    &["cost", "fee", "won"],
    &["long", "period", "months", "duration"],
];

impl EmbeddingProvider for ConceptEmbedder {
    fn embed(&self, text: &str, _intent: EmbedIntent) -> Result<Vec<f32>> {
        let mut vector = vec![0.0; DIMENSION];
        for word in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            for (i, concept) in CONCEPTS.iter().enumerate() {
                if concept.contains(&word) {
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

/// Always embeds onto the first axis
struct FixedEmbedder;

impl EmbeddingProvider for FixedEmbedder {
    fn embed(&self, _text: &str, _intent: EmbedIntent) -> Result<Vec<f32>> {
        Ok(vec![1.0, 0.0, 0.0, 0.0])
    }

    fn dimension(&self) -> usize {
        4
    }
}

struct RejectingEmbedder;

impl EmbeddingProvider for RejectingEmbedder {
    fn embed(&self, _text: &str, _intent: EmbedIntent) -> Result<Vec<f32>> {
        Err(RagError::ProviderAuth("HTTP 401".to_string()))
    }

    fn dimension(&self) -> usize {
        DIMENSION
    }
}

#[derive(Default)]
struct RecordingGenerator {
    prompts: Mutex<Vec<String>>,
}

impl GenerationProvider for RecordingGenerator {
    fn generate(&self, prompt: &str) -> Result<String> {
        self.prompts
            .lock()
            .expect("prompt log lock")
            .push(prompt.to_string());
        Ok("Rentals may last up to 12 months.".to_string())
    }
}

struct FailingGenerator;

impl GenerationProvider for FailingGenerator {
    fn generate(&self, _prompt: &str) -> Result<String> {
        Err(RagError::Generation("model not loaded".to_string()))
    }
}

fn chunk(index: i64, content: &str, embedding: Vec<f32>, source: EmbeddingSource) -> NewChunk {
    NewChunk {
        title: format!("Regulation {}", index),
        content: content.to_string(),
        section: None,
        category: "uncategorized".to_string(),
        embedding,
        embedding_source: source,
        chunk_index: index,
        source_file: "regulations.txt".to_string(),
    }
}

const RENTAL: &str = "Rental period is 12 months.";
const REPAIR: &str = "Repair cost cap is 100,000 won.";
const QUESTION: &str = "How long can I rent a device?";

async fn primary_corpus() -> Arc<MemoryCorpus> {
    let store = Arc::new(MemoryCorpus::default());
    let embedder = ConceptEmbedder;
    store
        .insert_many(&[
            chunk(
                0,
                RENTAL,
                embedder.embed(RENTAL, EmbedIntent::Document).expect("embed"),
                EmbeddingSource::Primary,
            ),
            chunk(
                1,
                REPAIR,
                embedder.embed(REPAIR, EmbedIntent::Document).expect("embed"),
                EmbeddingSource::Primary,
            ),
        ])
        .await
        .expect("insert");
    store
}

async fn fallback_corpus() -> Arc<MemoryCorpus> {
    let store = Arc::new(MemoryCorpus::default());
    store
        .insert_many(&[
            chunk(
                0,
                RENTAL,
                fallback_embed(RENTAL, DIMENSION),
                EmbeddingSource::Fallback,
            ),
            chunk(
                1,
                REPAIR,
                fallback_embed(REPAIR, DIMENSION),
                EmbeddingSource::Fallback,
            ),
        ])
        .await
        .expect("insert");
    store
}

fn synthesizer(
    primary: Arc<dyn EmbeddingProvider>,
    store: Arc<MemoryCorpus>,
    generator: Arc<dyn GenerationProvider>,
) -> Synthesizer {
    Synthesizer::new(
        Arc::new(FallbackEmbedder::new(primary)),
        store,
        generator,
        RetrievalConfig::default(),
    )
}

#[tokio::test]
async fn rental_question_ranks_rental_passage_first() {
    let generator = Arc::new(RecordingGenerator::default());
    let synthesizer = synthesizer(
        Arc::new(ConceptEmbedder),
        primary_corpus().await,
        Arc::clone(&generator) as Arc<dyn GenerationProvider>,
    );

    let answer = synthesizer.answer(QUESTION).await.expect("answers");

    assert_eq!(answer.text, "Rentals may last up to 12 months.");
    assert_eq!(answer.sources[0].chunk_index, 0);
    assert_eq!(answer.sources[0].embedding_source, EmbeddingSource::Primary);
    assert!(answer.sources.iter().all(|s| s.chunk_index != 1));
    assert!(answer.confidence > 0.0 && answer.confidence <= 1.0);

    let prompts = generator.prompts.lock().expect("prompt log lock");
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains(RENTAL));
    assert!(!prompts[0].contains(REPAIR));
}

#[tokio::test]
async fn prompt_restricts_model_to_context() {
    let generator = Arc::new(RecordingGenerator::default());
    let synthesizer = synthesizer(
        Arc::new(ConceptEmbedder),
        primary_corpus().await,
        Arc::clone(&generator) as Arc<dyn GenerationProvider>,
    );
    synthesizer.answer(QUESTION).await.expect("answers");

    let prompts = generator.prompts.lock().expect("prompt log lock");
    let prompt = &prompts[0];
    assert!(prompt.contains("Use only the regulation excerpts"));
    assert!(prompt.contains("do not cover it"));
    assert!(prompt.contains("Write the answer in Korean."));
    assert!(prompt.contains(&format!("Question: {}", QUESTION)));
    assert!(prompt.contains("[1] Regulation 0\nRental period is 12 months."));
}

#[tokio::test]
async fn confidence_is_mean_of_scores() {
    let store = Arc::new(MemoryCorpus::default());
    store
        .insert_many(&[
            chunk(0, "a", vec![1.0, 0.0, 0.0, 0.0], EmbeddingSource::Primary),
            chunk(1, "b", vec![1.0, 1.0, 0.0, 0.0], EmbeddingSource::Primary),
        ])
        .await
        .expect("insert");

    let synthesizer = synthesizer(
        Arc::new(FixedEmbedder),
        store,
        Arc::new(RecordingGenerator::default()),
    );
    let answer = synthesizer.answer("anything").await.expect("answers");

    let expected = (1.0 + std::f32::consts::FRAC_1_SQRT_2) / 2.0;
    assert!((answer.confidence - expected).abs() < 1e-5);
    assert_eq!(answer.sources.len(), 2);
}

#[tokio::test]
async fn confidence_ignores_unrelated_passages() {
    let store = Arc::new(MemoryCorpus::default());
    store
        .insert_many(&[
            chunk(0, "a", vec![1.0, 0.0, 0.0, 0.0], EmbeddingSource::Primary),
            chunk(1, "b", vec![0.0, 1.0, 0.0, 0.0], EmbeddingSource::Primary),
            chunk(2, "c", vec![-1.0, 0.0, 0.0, 0.0], EmbeddingSource::Primary),
        ])
        .await
        .expect("insert");

    let synthesizer = synthesizer(
        Arc::new(FixedEmbedder),
        store,
        Arc::new(RecordingGenerator::default()),
    );
    let answer = synthesizer.answer("anything").await.expect("answers");

    assert!((answer.confidence - 1.0).abs() < 1e-5);
    assert_eq!(answer.sources.len(), 1);
    assert_eq!(answer.sources[0].chunk_index, 0);
}

#[tokio::test]
async fn empty_corpus_is_no_data() {
    let synthesizer = synthesizer(
        Arc::new(ConceptEmbedder),
        Arc::new(MemoryCorpus::default()),
        Arc::new(RecordingGenerator::default()),
    );

    let error = synthesizer.answer(QUESTION).await.expect_err("no data");
    assert!(matches!(error, RagError::NoData));
    assert!(error.user_message().contains("Run ingestion first"));
}

#[tokio::test]
async fn unrelated_question_has_no_relevant_context() {
    let generator = Arc::new(RecordingGenerator::default());
    let synthesizer = synthesizer(
        Arc::new(ConceptEmbedder),
        primary_corpus().await,
        Arc::clone(&generator) as Arc<dyn GenerationProvider>,
    );

    let result = synthesizer.answer("Where is the cafeteria?").await;
    assert!(matches!(result, Err(RagError::NoRelevantContext)));
    assert!(generator.prompts.lock().expect("prompt log lock").is_empty());
}

#[tokio::test]
async fn generation_failure_is_surfaced() {
    let synthesizer = synthesizer(
        Arc::new(ConceptEmbedder),
        primary_corpus().await,
        Arc::new(FailingGenerator),
    );

    assert!(matches!(
        synthesizer.answer(QUESTION).await,
        Err(RagError::Generation(_))
    ));
}

#[tokio::test]
async fn primary_auth_failure_over_primary_corpus_is_surfaced() {
    let synthesizer = synthesizer(
        Arc::new(RejectingEmbedder),
        primary_corpus().await,
        Arc::new(RecordingGenerator::default()),
    );

    let error = synthesizer.answer(QUESTION).await.expect_err("auth failure");
    assert!(matches!(error, RagError::ProviderAuth(_)));
    assert!(error.user_message().contains("credentials"));
}

#[tokio::test]
async fn primary_failure_uses_fallback_index() {
    let synthesizer = synthesizer(
        Arc::new(RejectingEmbedder),
        fallback_corpus().await,
        Arc::new(RecordingGenerator::default()),
    );

    let answer = synthesizer.answer("rental period").await.expect("answers");
    assert_eq!(answer.sources[0].chunk_index, 0);
    assert_eq!(answer.sources[0].embedding_source, EmbeddingSource::Fallback);
}

#[tokio::test]
async fn fallback_only_corpus_is_ranked_with_fallback_vector() {
    let synthesizer = synthesizer(
        Arc::new(ConceptEmbedder),
        fallback_corpus().await,
        Arc::new(RecordingGenerator::default()),
    );

    let answer = synthesizer.answer("repair cost cap").await.expect("answers");
    assert_eq!(answer.sources[0].chunk_index, 1);
}

#[tokio::test]
async fn top_k_bounds_sources() {
    let store = Arc::new(MemoryCorpus::default());
    let chunks: Vec<NewChunk> = (0..8)
        .map(|i| {
            chunk(
                i,
                "Rental period is 12 months.",
                vec![1.0, i as f32 * 0.1, 0.0, 0.0],
                EmbeddingSource::Primary,
            )
        })
        .collect();
    store.insert_many(&chunks).await.expect("insert");

    let synthesizer = Synthesizer::new(
        Arc::new(FallbackEmbedder::new(Arc::new(FixedEmbedder))),
        store,
        Arc::new(RecordingGenerator::default()),
        RetrievalConfig {
            top_k: 3,
            ..RetrievalConfig::default()
        },
    );

    let answer = synthesizer.answer("rental").await.expect("answers");
    assert_eq!(answer.sources.len(), 3);
}

fn scored(index: i64, content: &str, score: f32) -> ScoredChunk {
    ScoredChunk {
        chunk: chunk(index, content, vec![1.0], EmbeddingSource::Primary)
            .into_stored(index, Utc::now().naive_utc()),
        score,
    }
}

#[test]
fn context_is_bounded() {
    let passages = vec![
        scored(0, &"a".repeat(50), 0.9),
        scored(1, &"b".repeat(50), 0.8),
        scored(2, &"c".repeat(50), 0.7),
    ];

    let (context, used) = build_context(&passages, 140);
    assert_eq!(used, 2);
    assert!(context.chars().count() <= 140);
    assert!(context.contains("[2] Regulation 1"));
    assert!(!context.contains('c'));
}

#[test]
fn oversized_first_passage_is_truncated() {
    let passages = vec![scored(0, &"가".repeat(500), 0.9)];

    let (context, used) = build_context(&passages, 100);
    assert_eq!(used, 1);
    assert_eq!(context.chars().count(), 100);
    assert!(context.starts_with("[1] Regulation 0\n"));
}

#[test]
fn section_is_shown_when_it_differs_from_title() {
    let mut passage = scored(0, "Up to 12 months.", 0.9);
    passage.chunk.section = Some("Rental > Period".to_string());

    let (context, _) = build_context(&[passage], 1000);
    assert_eq!(context, "[1] Regulation 0 (Rental > Period)\nUp to 12 months.");
}
