use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use incident_core::autoheal::DEFAULT_TARGET;
use incident_core::data;
use incident_core::{
    build_index, index_info, load_embedder, AppConfig, AutoHealer, DataReport, PatternEngine,
    Retriever, SeverityPredictor,
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "incident")]
#[command(about = "Incident resolution toolkit: index, search, triage and remediation")]
struct Cli {
    /// TOML config file. Missing files fall back to defaults.
    #[arg(long, global = true, env = "INCIDENT_CONFIG", default_value = "incident.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Embed incidents and KB articles and persist the index.
    BuildIndex,
    /// Show whether the index exists and is current.
    IndexStatus,
    /// Semantic search over incidents and KB articles.
    Search {
        #[arg(long)]
        query: String,
        #[arg(long)]
        top_k: Option<usize>,
        #[arg(long)]
        min_score: Option<f32>,
    },
    /// Train the severity classifier from incidents.csv.
    TrainSeverity {
        #[arg(long)]
        retrain: bool,
    },
    /// Predict the severity of an incident description.
    Predict {
        #[arg(long)]
        description: String,
    },
    /// Detect recurring incident patterns.
    Patterns,
    /// Summarise the dataset files and their quality.
    VerifyData,
    /// Simulate a remediation action.
    Heal {
        #[arg(long)]
        action: String,
        #[arg(long, default_value = DEFAULT_TARGET)]
        target: String,
    },
    /// Suggest a remediation action for an incident description.
    SuggestAction {
        #[arg(long)]
        description: String,
    },
}

#[derive(Debug, Serialize)]
struct Suggestion<'a> {
    description: &'a str,
    action: &'static str,
    command: String,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn open_retriever(config: &AppConfig) -> Result<Retriever> {
    let embedder = load_embedder(&config.embedding).context("load embedding model")?;
    Ok(Retriever::open(config.clone(), Arc::from(embedder)))
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(Some(&cli.config))
        .with_context(|| format!("load config {}", cli.config.display()))?;

    match cli.command {
        Commands::BuildIndex => {
            let embedder = load_embedder(&config.embedding).context("load embedding model")?;
            let meta = build_index(&config, embedder.as_ref())?;
            print_json(&meta)?;
        }
        Commands::IndexStatus => {
            print_json(&index_info(&config.paths))?;
        }
        Commands::Search {
            query,
            top_k,
            min_score,
        } => {
            let retriever = open_retriever(&config)?;
            let hits = retriever.search(
                &query,
                top_k.unwrap_or(config.search.top_k),
                min_score.unwrap_or(config.search.min_score),
            )?;
            print_json(&hits)?;
        }
        Commands::TrainSeverity { retrain } => {
            let incidents = data::load_incidents(&config.paths.data_dir)?;
            let predictor = SeverityPredictor::open(&config.paths.model_dir);
            let report = predictor.train(&incidents, retrain)?;
            print_json(&report)?;
        }
        Commands::Predict { description } => {
            let predictor = SeverityPredictor::open(&config.paths.model_dir);
            print_json(&predictor.predict(&description)?)?;
        }
        Commands::Patterns => {
            let retriever = open_retriever(&config)?;
            let incidents = data::load_incidents(&config.paths.data_dir)?;
            let embeddings = retriever.incident_embeddings(&incidents)?;
            let patterns = PatternEngine::new(config.clustering).analyze(&incidents, &embeddings)?;
            print_json(&patterns)?;
        }
        Commands::VerifyData => {
            print_json(&DataReport::collect(&config.paths.data_dir)?)?;
        }
        Commands::Heal { action, target } => {
            let result = AutoHealer::new(&config.heal).execute(&action, &target).await;
            print_json(&result)?;
        }
        Commands::SuggestAction { description } => {
            let action = AutoHealer::determine_action(&description);
            print_json(&Suggestion {
                description: &description,
                action,
                command: AutoHealer::command_for(action, DEFAULT_TARGET),
            })?;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run().await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
