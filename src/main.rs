use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use prettytable::{Cell, Row as PrettyRow, Table};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

use lorelink::checkpoint::{migrate_legacy, CheckpointStore, MigrationOutcome};
use lorelink::config::PipelineConfig;
use lorelink::db::Database;
use lorelink::links::{LatestResults, LinkApplier};
use lorelink::logging::configure_logging;
use lorelink::runner::{shutdown_signal, FollowupSummary, JobRunner, RunSummary};

#[derive(Parser)]
#[clap(
    name = "lorelink",
    about = "Reconcile local historical entities against Wikidata"
)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Match entities, resuming from the last checkpoint
    Run {
        /// Move the existing checkpoint aside and start from the first entity
        #[clap(long)]
        fresh: bool,

        /// Entities resolved concurrently
        #[clap(short, long)]
        workers: Option<usize>,

        /// Stop after this many entities in this run
        #[clap(short, long)]
        limit: Option<usize>,

        /// Entities per checkpoint flush
        #[clap(long)]
        checkpoint_interval: Option<usize>,

        /// Results per chunk file for a new checkpoint
        #[clap(long)]
        chunk_capacity: Option<usize>,

        /// Queue borderline entities instead of calling the LLM
        #[clap(long)]
        skip_adjudication: bool,
    },

    /// Run the LLM over entities queued for adjudication
    Adjudicate {
        #[clap(short, long)]
        limit: Option<usize>,
    },

    /// Reprocess entities whose latest result recorded an error
    RetryFailed {
        #[clap(short, long)]
        limit: Option<usize>,
    },

    /// Write accepted matches to the database
    Apply {
        #[clap(short, long)]
        min_confidence: Option<f64>,

        /// Also link local entities that matched the same external id
        #[clap(long)]
        same_as: bool,
    },

    /// Convert a single-file checkpoint into the chunked layout
    Migrate {
        #[clap(long, required = true)]
        legacy: PathBuf,
    },

    /// Show checkpoint progress and link counts
    Status,
}

fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    shutdown_signal(signal::ctrl_c, || {
        std::process::exit(130);
    })
}

async fn open_database(config: &PipelineConfig) -> Result<Database> {
    Database::new(&config.database_path)
        .await
        .with_context(|| format!("Failed to open database {}", config.database_path))
}

fn build_runner(config: &PipelineConfig) -> Result<JobRunner> {
    // The candidate source and the adjudicator share one limiter.
    let limiter = config.rate_limiter();
    let source = config.candidate_source(Arc::clone(&limiter))?;
    let matcher = config.matcher(limiter)?;
    Ok(JobRunner::new(Arc::new(source), Arc::new(matcher)).with_shutdown(shutdown_on_ctrl_c()))
}

fn report_run(summary: &RunSummary) {
    info!(
        "Processed {} entities in {:.1?}; committed {}/{}",
        summary.processed, summary.elapsed, summary.committed_offset, summary.total
    );
    info!(
        "Matched: {} rule, {} fuzzy, {} embedding, {} llm; {} unmatched, {} ambiguous",
        summary.stats.rule,
        summary.stats.fuzzy,
        summary.stats.embedding,
        summary.stats.llm,
        summary.stats.unmatched,
        summary.stats.ambiguous
    );
    info!(
        "Failures: {} ({:.2}%), {} awaiting adjudication",
        summary.stats.failed,
        summary.failure_rate() * 100.0,
        summary.pending_adjudication
    );
    if summary.interrupted {
        warn!("Run interrupted; rerun to resume from offset {}", summary.committed_offset);
    }
}

fn report_followup(pass: &str, summary: &FollowupSummary) {
    info!(
        "{}: {} attempted, {} matched, {} still pending, {} failed, {} no longer in the database",
        pass, summary.attempted, summary.matched, summary.still_pending, summary.failed, summary.missing
    );
}

async fn status(config: &PipelineConfig) -> Result<()> {
    let mut main = config.checkpoint_store();
    let state = main.load()?;
    let mut followup = config.followup_store();
    let followup_state = followup.load()?;

    let mut table = Table::new();
    table.add_row(PrettyRow::new(vec![Cell::new("Metric"), Cell::new("Value")]));
    let mut add = |name: &str, value: String| {
        table.add_row(PrettyRow::new(vec![Cell::new(name), Cell::new(&value)]));
    };
    add("Checkpoint", config.checkpoint_dir.display().to_string());
    add("Committed offset", state.last_offset.to_string());
    add("Chunks", format!("{} x {}", state.result_chunks, state.chunk_capacity));
    add("Updated", state.updated_at.format("%Y-%m-%d %H:%M:%S").to_string());
    add("Rule", state.stats.rule.to_string());
    add("Fuzzy", state.stats.fuzzy.to_string());
    add("Embedding", state.stats.embedding.to_string());
    add("LLM", state.stats.llm.to_string());
    add("Unmatched", state.stats.unmatched.to_string());
    add("Ambiguous", state.stats.ambiguous.to_string());
    add(
        "Failed",
        format!("{} ({:.2}%)", state.stats.failed, state.failure_rate() * 100.0),
    );
    add("Awaiting adjudication", state.llm_pending.len().to_string());
    add("Follow-up results", followup_state.total_results.to_string());

    match open_database(config).await {
        Ok(db) => {
            let (links, same_as) = db.link_counts().await?;
            add("Links applied", links.to_string());
            add("Same-as edges", same_as.to_string());
        }
        Err(e) => warn!("Link counts unavailable: {:#}", e),
    }

    table.printstd();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    configure_logging();
    let cli = Cli::parse();
    let mut config = PipelineConfig::from_env();

    match cli.command {
        Commands::Run {
            fresh,
            workers,
            limit,
            checkpoint_interval,
            chunk_capacity,
            skip_adjudication,
        } => {
            if let Some(workers) = workers {
                config.concurrency = workers;
            }
            if let Some(interval) = checkpoint_interval {
                config.checkpoint_interval = interval;
            }
            if let Some(capacity) = chunk_capacity {
                config.chunk_capacity = capacity;
            }

            let db = open_database(&config).await?;
            let runner = build_runner(&config)?;
            let mut store = config.checkpoint_store();
            let mut followup = config.followup_store();

            let mut options = config.run_options();
            options.resume = !fresh;
            options.limit = limit;
            options.skip_adjudication = skip_adjudication;

            let summary = runner.run(&db, &mut store, &mut followup, &options).await?;
            report_run(&summary);
        }
        Commands::Adjudicate { limit } => {
            let db = open_database(&config).await?;
            let runner = build_runner(&config)?;
            let mut options = config.run_options();
            options.limit = limit;
            let summary = runner
                .adjudicate_pending(
                    &db,
                    &mut config.checkpoint_store(),
                    &mut config.followup_store(),
                    &options,
                )
                .await?;
            report_followup("Adjudication", &summary);
        }
        Commands::RetryFailed { limit } => {
            let db = open_database(&config).await?;
            let runner = build_runner(&config)?;
            let mut options = config.run_options();
            options.limit = limit;
            let summary = runner
                .retry_failed(
                    &db,
                    &mut config.checkpoint_store(),
                    &mut config.followup_store(),
                    &options,
                )
                .await?;
            report_followup("Retry", &summary);
        }
        Commands::Apply {
            min_confidence,
            same_as,
        } => {
            let min_confidence = min_confidence.unwrap_or(config.min_confidence);
            let db = open_database(&config).await?;

            let mut main = config.checkpoint_store();
            main.load()?;
            let mut followup = config.followup_store();
            followup.load()?;
            let latest = LatestResults::index(&main, &followup)?;
            info!("Applying latest results for {} entities", latest.len());

            let applier = LinkApplier::new(Arc::new(db));
            let (counts, edges) = applier.apply_latest(&latest, min_confidence, same_as).await?;
            info!(
                "Links: {} applied, {} already present, {} below {:.2}",
                counts.applied, counts.already_present, counts.skipped_low_confidence, min_confidence
            );
            if let Some(edges) = edges {
                info!(
                    "Same-as edges: {} applied, {} already present",
                    edges.applied, edges.already_present
                );
            }
        }
        Commands::Migrate { legacy } => {
            let mut store = config.checkpoint_store();
            match migrate_legacy(&legacy, &mut store)? {
                MigrationOutcome::Migrated {
                    results,
                    archived_to,
                } => info!(
                    "Migrated {} results into {}; legacy file archived as {}",
                    results,
                    config.checkpoint_dir.display(),
                    archived_to.display()
                ),
                MigrationOutcome::AlreadyMigrated => {
                    info!("{} was already migrated", legacy.display())
                }
            }
        }
        Commands::Status => status(&config).await?,
    }

    Ok(())
}
