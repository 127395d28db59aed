// src/main.rs
// weave - persona memory engine CLI

use clap::{Parser, Subcommand};
use std::process::ExitCode;
use std::sync::Arc;
use weave::backup::BackupStrategy;
use weave::chronicle::ChronicleConfig;
use weave::config::Settings;
use weave::engine::WeaveEngine;
use weave::llm::{LlmClient, OpenAiCompatClient};
use weave::recall::build_recall_snippet;

#[derive(Parser)]
#[command(name = "weave", about = "Persona-scoped hierarchical memory engine", version)]
struct Cli {
    /// Persona id (e.g. air_city_a)
    #[arg(short, long, env = "MEMORY_WEAVE_PERSONA")]
    persona: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show memory statistics for the persona
    Stats,
    /// Semantic recall over the persona's messages
    Recall {
        query: String,
        #[arg(long, default_value_t = 5)]
        topk: usize,
        #[arg(long, default_value_t = 800)]
        max_chars: usize,
    },
    /// Generate chronicle entries for unprocessed messages
    Generate {
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long)]
        consolidation_size: Option<usize>,
        #[arg(long)]
        max_messages: Option<usize>,
        /// Only report what a run would cost
        #[arg(long)]
        estimate: bool,
    },
    /// Verify and repair message embeddings
    Reembed {
        #[arg(long)]
        force: bool,
    },
    /// Back up the persona database
    Backup {
        /// simple | incremental | auto
        #[arg(long, default_value = "auto")]
        strategy: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> weave::Result<()> {
    let settings = Settings::from_env();
    let llm: Option<Arc<dyn LlmClient>> = Some(Arc::new(OpenAiCompatClient::new(
        settings.llm_base_url.clone(),
        settings.llm_api_key.clone(),
        settings.llm_model.clone(),
    )));
    let engine = WeaveEngine::new(settings.clone(), llm);
    let persona = engine.persona(&cli.persona).await?;

    match cli.command {
        Commands::Stats => {
            let stats = weave::chronicle::get_episode_stats(persona.pool()).await?;
            let threads = persona.thread_summaries().await?;
            println!("persona: {}", cli.persona);
            println!("threads: {}", threads.len());
            for thread in &threads {
                let marker = if thread.is_active { " *" } else { "" };
                println!("  {} ({} messages){marker}", thread.suffix, thread.message_count);
            }
            println!("chronicle max level: {}", stats.max_level);
            println!("messages covered: {}", stats.total_messages_covered);
            for (level, count) in &stats.entries_by_level {
                println!("  level {level}: {count} entries");
            }
        }
        Commands::Recall { query, topk, max_chars } => {
            let mut params = persona.default_recall_params();
            params.topk = topk;
            let groups = persona.recall_groups(&query, &params).await?;
            let snippet = build_recall_snippet(&groups, max_chars);
            if snippet.is_empty() {
                println!("(no recall results)");
            } else {
                println!("{snippet}");
            }
        }
        Commands::Generate { batch_size, consolidation_size, max_messages, estimate } => {
            let mut config = ChronicleConfig {
                include_timestamp: settings.include_timestamp,
                max_messages,
                ..Default::default()
            };
            if let Some(size) = batch_size {
                config.batch_size = size;
            }
            if let Some(size) = consolidation_size {
                config.consolidation_size = size;
            }

            if estimate {
                let report = persona.chronicle_cost_estimate(&config, false).await?;
                println!("unprocessed messages: {}", report.unprocessed_messages);
                println!("qualifying messages:  {}", report.qualifying_messages);
                println!("isolated (deferred):  {}", report.isolated_messages);
                println!("projected LLM calls:  {}", report.projected_llm_calls);
                println!("estimated tokens:     {} in / {} out", report.estimated_input_tokens, report.estimated_output_tokens);
                println!("estimated cost:       ${:.4} ({})", report.estimated_cost_usd, report.model);
            } else {
                let outcome = persona.generate_chronicle(config).await?;
                println!(
                    "created {} level-1 and {} consolidated entries",
                    outcome.level1.len(),
                    outcome.consolidated.len()
                );
            }
        }
        Commands::Reembed { force } => {
            let report = persona.reembed(force, None).await?;
            println!(
                "checked {}, re-embedded {}, skipped {} errors",
                report.checked, report.reembedded, report.skipped_errors
            );
        }
        Commands::Backup { strategy } => {
            let strategy = match strategy.as_str() {
                "simple" => BackupStrategy::Simple,
                "incremental" => BackupStrategy::Incremental,
                "auto" => BackupStrategy::Auto,
                other => {
                    return Err(weave::WeaveError::Invalid(format!(
                        "unknown backup strategy: {other}"
                    )));
                }
            };
            let report = persona.backup(strategy).await?;
            if report.deduplicated {
                println!("unchanged since last backup: {}", report.destination.display());
            } else {
                println!("{} backup at {}", report.strategy, report.destination.display());
            }
        }
    }
    Ok(())
}
