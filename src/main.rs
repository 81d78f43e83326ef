use anyhow::Result;
use clap::{Parser, Subcommand};
use regulation_rag::commands::{ask, ingest, show_status};
use regulation_rag::config::{Config, get_config_dir, run_interactive_config, show_config};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "regulation-rag")]
#[command(about = "Question answering over an organization's regulation documents")]
#[command(version)]
struct Cli {
    /// Configuration directory (defaults to the platform config dir)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configure Ollama connection and settings
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// Rebuild the corpus from regulation documents
    Ingest {
        /// Documents to ingest; all documents in the source directories when omitted
        files: Vec<String>,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Answer a question from the ingested regulations
    Ask {
        question: String,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show corpus statistics and provider health
    Status,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_dir = get_config_dir(cli.config_dir.as_deref())?;

    let success = match cli.command {
        Commands::Config { show } => {
            if show {
                show_config(&config_dir)?;
            } else {
                run_interactive_config(&config_dir)?;
            }
            true
        }
        Commands::Ingest { files, json } => {
            let config = Config::load(&config_dir)?;
            ingest(&config, files, json).await?
        }
        Commands::Ask { question, json } => {
            let config = Config::load(&config_dir)?;
            ask(&config, &question, json).await?
        }
        Commands::Status => {
            let config = Config::load(&config_dir)?;
            show_status(&config).await?;
            true
        }
    };

    Ok(if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn cli_parsing() {
        let cli = Cli::try_parse_from(["regulation-rag", "status"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            assert!(matches!(parsed.command, Commands::Status));
            assert!(parsed.config_dir.is_none());
        }
    }

    #[test]
    fn ingest_without_files() {
        let parsed = Cli::try_parse_from(["regulation-rag", "ingest"]).expect("parses");
        match parsed.command {
            Commands::Ingest { files, json } => {
                assert!(files.is_empty());
                assert!(!json);
            }
            _ => panic!("expected ingest command"),
        }
    }

    #[test]
    fn ingest_with_files_and_json() {
        let parsed = Cli::try_parse_from([
            "regulation-rag",
            "ingest",
            "rental.pdf",
            "repair.md",
            "--json",
        ])
        .expect("parses");
        match parsed.command {
            Commands::Ingest { files, json } => {
                assert_eq!(files, vec!["rental.pdf", "repair.md"]);
                assert!(json);
            }
            _ => panic!("expected ingest command"),
        }
    }

    #[test]
    fn ask_command() {
        let parsed = Cli::try_parse_from([
            "regulation-rag",
            "ask",
            "How long can I rent a device?",
        ])
        .expect("parses");
        match parsed.command {
            Commands::Ask { question, json } => {
                assert_eq!(question, "How long can I rent a device?");
                assert!(!json);
            }
            _ => panic!("expected ask command"),
        }
    }

    #[test]
    fn ask_requires_question() {
        let result = Cli::try_parse_from(["regulation-rag", "ask"]);
        assert!(result.is_err());
        if let Err(error) = result {
            assert_eq!(error.kind(), ErrorKind::MissingRequiredArgument);
        }
    }

    #[test]
    fn global_config_dir() {
        let parsed = Cli::try_parse_from([
            "regulation-rag",
            "status",
            "--config-dir",
            "/tmp/regulation-rag",
        ])
        .expect("parses");
        assert_eq!(
            parsed.config_dir,
            Some(PathBuf::from("/tmp/regulation-rag"))
        );
    }

    #[test]
    fn config_show_flag() {
        let parsed = Cli::try_parse_from(["regulation-rag", "config", "--show"]).expect("parses");
        assert!(matches!(parsed.command, Commands::Config { show: true }));
    }

    #[test]
    fn unknown_command_fails() {
        let result = Cli::try_parse_from(["regulation-rag", "serve"]);
        assert!(result.is_err());
        if let Err(error) = result {
            assert_eq!(error.kind(), ErrorKind::InvalidSubcommand);
        }
    }
}
