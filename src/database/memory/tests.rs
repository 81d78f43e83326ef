use super::*;
use crate::embeddings::EmbeddingSource;

fn chunk(index: i64, source: EmbeddingSource) -> NewChunk {
    NewChunk {
        title: "Rental".to_string(),
        content: format!("Chunk number {}", index),
        section: None,
        category: "rental".to_string(),
        embedding: vec![1.0, 0.0, 0.0],
        embedding_source: source,
        chunk_index: index,
        source_file: "rental.txt".to_string(),
    }
}

#[tokio::test]
async fn staged_generation_is_invisible_until_activated() {
    let store = MemoryCorpus::new("regulations");
    store
        .insert_many(&[chunk(0, EmbeddingSource::Primary)])
        .await
        .expect("insert");

    let generation = store.begin_generation().await.expect("begin");
    store
        .insert_chunk(generation, &chunk(0, EmbeddingSource::Fallback))
        .await
        .expect("stage");
    store
        .insert_chunk(generation, &chunk(1, EmbeddingSource::Fallback))
        .await
        .expect("stage");

    let visible = store.select_all().await.expect("select");
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].embedding_source, EmbeddingSource::Primary);

    store.activate_generation(generation).await.expect("activate");
    let visible = store.select_all().await.expect("select");
    assert_eq!(visible.len(), 2);
    assert!(
        visible
            .iter()
            .all(|c| c.embedding_source == EmbeddingSource::Fallback)
    );
}

#[tokio::test]
async fn select_all_orders_by_chunk_index() {
    let store = MemoryCorpus::default();
    let generation = store.begin_generation().await.expect("begin");
    for index in [2, 0, 1] {
        store
            .insert_chunk(generation, &chunk(index, EmbeddingSource::Primary))
            .await
            .expect("stage");
    }
    store.activate_generation(generation).await.expect("activate");

    let indices: Vec<i64> = store
        .select_all()
        .await
        .expect("select")
        .iter()
        .map(|c| c.chunk_index)
        .collect();
    assert_eq!(indices, vec![0, 1, 2]);
}

#[tokio::test]
async fn discard_keeps_active_corpus() {
    let store = MemoryCorpus::default();
    store
        .insert_many(&[chunk(0, EmbeddingSource::Primary)])
        .await
        .expect("insert");

    let generation = store.begin_generation().await.expect("begin");
    store
        .insert_chunk(generation, &chunk(0, EmbeddingSource::Primary))
        .await
        .expect("stage");
    store.discard_generation(generation).await.expect("discard");

    assert_eq!(store.select_all().await.expect("select").len(), 1);
    assert!(store.activate_generation(generation).await.is_err());
}

#[tokio::test]
async fn delete_all_empties_corpus() {
    let store = MemoryCorpus::default();
    store
        .insert_many(&[chunk(0, EmbeddingSource::Primary)])
        .await
        .expect("insert");
    store.delete_all().await.expect("delete");

    assert!(store.select_all().await.expect("select").is_empty());
    assert!(store.stats().await.expect("stats").is_empty());
}

#[tokio::test]
async fn empty_content_is_rejected() {
    let store = MemoryCorpus::default();
    let generation = store.begin_generation().await.expect("begin");
    let mut blank = chunk(0, EmbeddingSource::Primary);
    blank.content = "  ".to_string();

    assert!(matches!(
        store.insert_chunk(generation, &blank).await,
        Err(RagError::Persistence(_))
    ));
}

#[tokio::test]
async fn select_by_source_filters() {
    let store = MemoryCorpus::default();
    store
        .insert_many(&[
            chunk(0, EmbeddingSource::Primary),
            chunk(1, EmbeddingSource::Fallback),
            chunk(2, EmbeddingSource::Primary),
        ])
        .await
        .expect("insert");

    let primary = store
        .select_by_source(EmbeddingSource::Primary)
        .await
        .expect("select");
    assert_eq!(primary.len(), 2);

    let stats = store.stats().await.expect("stats");
    assert_eq!(stats.total_chunks, 3);
    assert_eq!(stats.source_files, 1);
    assert_eq!(stats.embedding_dimension, Some(3));
    assert_eq!(stats.by_source.get("primary"), Some(&2));
    assert!(stats.has_mixed_sources());
}

#[tokio::test]
async fn lock_excludes_second_holder() {
    let store = MemoryCorpus::new("regulations");
    let stale_after = Duration::from_secs(60);

    store.acquire_lock("run-a", stale_after).await.expect("first acquire");
    assert!(matches!(
        store.acquire_lock("run-b", stale_after).await,
        Err(RagError::IngestionInProgress(corpus)) if corpus == "regulations"
    ));

    store.refresh_lock("run-a").await.expect("refresh");
    assert!(store.refresh_lock("run-b").await.is_err());

    store.release_lock("run-a").await.expect("release");
    store.acquire_lock("run-b", stale_after).await.expect("after release");
}

#[tokio::test]
async fn stale_lock_is_taken_over() {
    let store = MemoryCorpus::default();
    store
        .acquire_lock("crashed", Duration::from_secs(60))
        .await
        .expect("acquire");

    store
        .acquire_lock("new-run", Duration::ZERO)
        .await
        .expect("stale lock taken over");
    assert!(store.refresh_lock("crashed").await.is_err());
}
