use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fwatch_core::CanonicalRoster;
use fwatch_storage::SqliteRecordStore;
use fwatch_sync::{SyncConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "fwatch-cli")]
#[command(about = "Correctional facility job posting tracker")]
struct Cli {
    /// Overrides DATABASE_URL.
    #[arg(long, global = true)]
    database_url: Option<String>,
    /// Overrides FWATCH_ROSTER_PATH.
    #[arg(long, global = true)]
    roster: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch postings once and enrich descriptions.
    Sync,
    /// Build the canonical roster file from a raw facility list.
    BuildRoster {
        #[arg(long)]
        input: PathBuf,
        #[arg(long, default_value = "clean_prisons.txt")]
        output: PathBuf,
    },
    /// Match stored raw facility names against the roster.
    Crosscheck {
        #[arg(long)]
        threshold: Option<f64>,
    },
    /// Print store statistics and facility lists.
    Report,
    /// Re-normalize stored descriptions.
    CleanDescriptions,
    /// Run sync on the configured cron schedule until interrupted.
    Schedule {
        #[arg(long)]
        cron: Option<String>,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = SyncConfig::from_env()?;
    if let Some(database_url) = cli.database_url {
        config.database_url = database_url;
    }
    if let Some(roster) = cli.roster {
        config.roster_path = roster;
    }

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let pipeline = SyncPipeline::from_config(config).await?;
            let summary = pipeline.run_once().await?;
            println!("{summary}");
        }
        Commands::BuildRoster { input, output } => {
            let count = fwatch_sync::build_roster_file(&input, &output).await?;
            println!("wrote {count} facilities to {}", output.display());
        }
        Commands::Crosscheck { threshold } => {
            let roster = CanonicalRoster::load(&config.roster_path)?;
            let store = SqliteRecordStore::connect(&config.database_url).await?;
            let threshold = threshold.unwrap_or(config.crosscheck_threshold);
            let report = fwatch_sync::crosscheck(&store, &roster, threshold).await?;
            println!("{report}");
        }
        Commands::Report => {
            let store = SqliteRecordStore::connect(&config.database_url).await?;
            println!("{}", fwatch_sync::store_report(&store).await?);
        }
        Commands::CleanDescriptions => {
            let store = SqliteRecordStore::connect(&config.database_url).await?;
            let cleaned = fwatch_sync::clean_descriptions(&store).await?;
            println!("cleaned {cleaned} descriptions");
        }
        Commands::Schedule { cron } => {
            let cron = cron.unwrap_or_else(|| config.scheduler_cron.clone());
            let pipeline = Arc::new(SyncPipeline::from_config(config).await?);
            let mut sched = fwatch_sync::build_scheduler(pipeline, &cron).await?;
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler started; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
