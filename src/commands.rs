use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use tracing::{info, warn};

use crate::config::Config;
use crate::database::{CorpusStore, SqliteCorpus};
use crate::embeddings::OllamaClient;
use crate::service::{AnswerResponse, IngestResponse, RegulationService};

fn spinner(message: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg} [{elapsed}]")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    bar.set_message(message.to_string());
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

/// Run an ingestion pass. Returns whether it succeeded.
#[inline]
pub async fn ingest(config: &Config, files: Vec<String>, json: bool) -> Result<bool> {
    let service = RegulationService::from_config(config)
        .await
        .context("Failed to initialize regulation service")?;

    let cancel = service.cancel_flag();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Cancellation requested, stopping after the current batch");
            cancel.cancel();
        }
    });

    let files = (!files.is_empty()).then_some(files);
    let progress = (!json).then(|| spinner("Ingesting regulation documents"));
    let response = service.ingest_regulations(files).await;
    ctrl_c.abort();

    if let Some(progress) = progress {
        progress.finish_and_clear();
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        print_ingest(&response);
    }
    Ok(response.success)
}

fn print_ingest(response: &IngestResponse) {
    if !response.success {
        println!(
            "{} {}",
            style("✗ Ingestion failed:").red().bold(),
            response.error.as_deref().unwrap_or("unknown error")
        );
        return;
    }

    println!("{}", style("✓ Ingestion completed").green().bold());
    println!("  Chunks stored: {}", style(response.chunks_stored).cyan());
    if response.chunks_failed > 0 {
        println!("  Chunks failed: {}", style(response.chunks_failed).yellow());
    }
    if response.documents_skipped > 0 {
        println!(
            "  Documents skipped: {}",
            style(response.documents_skipped).yellow()
        );
    }
    if response.fallback_embeddings > 0 {
        println!(
            "  {} {} chunks use local fallback embeddings; check the Ollama connection and re-run ingestion",
            style("⚠").yellow(),
            response.fallback_embeddings
        );
    }
}

/// Answer one question. Returns whether an answer was produced.
#[inline]
pub async fn ask(config: &Config, question: &str, json: bool) -> Result<bool> {
    let service = RegulationService::from_config(config)
        .await
        .context("Failed to initialize regulation service")?;

    let progress = (!json).then(|| spinner("Searching regulations"));
    let response = service.answer_question(question).await;
    if let Some(progress) = progress {
        progress.finish_and_clear();
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        print_answer(&response);
    }
    Ok(response.success)
}

fn print_answer(response: &AnswerResponse) {
    if !response.success {
        println!(
            "{} {}",
            style("✗").red().bold(),
            response.error.as_deref().unwrap_or("unknown error")
        );
        return;
    }

    println!("{}", response.answer.as_deref().unwrap_or_default());
    println!();

    if let Some(sources) = &response.sources {
        println!("{}", style("Sources:").bold().yellow());
        for (i, source) in sources.iter().enumerate() {
            let location = source.section.as_deref().unwrap_or(&source.title);
            println!(
                "  [{}] {} - {} {}",
                i + 1,
                style(&source.source_file).cyan(),
                location,
                style(format!("({:.3})", source.score)).dim()
            );
        }
    }
    if let Some(confidence) = response.confidence {
        println!("Confidence: {}", style(format!("{:.3}", confidence)).cyan());
    }
}

/// Show corpus statistics and provider health
#[inline]
pub async fn show_status(config: &Config) -> Result<()> {
    println!("{}", style("📊 Regulation RAG Status").bold().cyan());
    println!("{}", "=".repeat(50));
    println!();

    println!("🗄️  Corpus '{}':", config.ingestion.corpus);
    match SqliteCorpus::open(config.database_path(), &config.ingestion.corpus).await {
        Ok(store) => match store.stats().await {
            Ok(stats) if stats.active_generation.is_some() => {
                if let Some(generation) = stats.active_generation {
                    println!("   Active generation: {}", generation);
                }
                if let Some(activated) = stats.activated_date {
                    println!("   Last ingested: {}", activated);
                }
                println!("   Chunks: {}", stats.total_chunks);
                println!("   Source documents: {}", stats.source_files);
                if let Some(dimension) = stats.embedding_dimension {
                    println!("   Embedding dimension: {}", dimension);
                }
                for (source, count) in &stats.by_source {
                    println!("   {} embeddings: {}", source, count);
                }
                if stats.has_mixed_sources() {
                    println!(
                        "   {} Corpus mixes primary and fallback embeddings; each is searched separately",
                        style("⚠").yellow()
                    );
                }
                println!("   Categories:");
                for (category, count) in &stats.by_category {
                    println!("     {}: {}", category, count);
                }
            }
            Ok(_) => println!("   💤 Empty. Run 'regulation-rag ingest' first."),
            Err(e) => println!("   ❌ Failed to read statistics - {}", e),
        },
        Err(e) => println!("   ❌ SQLite: Failed to open - {}", e),
    }

    println!();
    println!("🤖 Ollama Status:");
    match OllamaClient::new(&config.ollama) {
        Ok(client) => {
            let health = tokio::task::spawn_blocking(move || client.health_check())
                .await
                .context("Health check task failed")?;
            match health {
                Ok(()) => {
                    println!(
                        "   ✅ Ollama: Connected ({}:{})",
                        config.ollama.host, config.ollama.port
                    );
                    println!("   📋 Embedding model: {}", config.ollama.embedding_model);
                    println!("   📋 Generation model: {}", config.ollama.generation_model);
                }
                Err(e) => println!("   ⚠️  Ollama: Unhealthy - {}", e),
            }
        }
        Err(e) => println!("   ❌ Ollama: Invalid configuration - {}", e),
    }

    println!();
    println!("📁 Source directories:");
    for dir in config.resolved_source_dirs() {
        let marker = if dir.is_dir() { "✅" } else { "❌" };
        println!("   {} {}", marker, dir.display());
    }

    info!("Status report complete");
    Ok(())
}
