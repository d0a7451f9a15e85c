use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ths_storage::ListingStore;
use ths_sync::{log_run, SyncConfig, SyncPipeline, SyncRunSummary};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ths-cli")]
#[command(about = "House-sit listing reconciler")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation cycle and exit.
    Sync,
    /// Run once, then keep reconciling on THS_SYNC_CRON until interrupted.
    Schedule,
    /// Print row counts for the target table.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let pipeline = SyncPipeline::from_config(config).await?;
            let summary = pipeline.run_once().await?;
            print_summary(&summary);
        }
        Commands::Schedule => {
            let pipeline = Arc::new(SyncPipeline::from_config(config).await?);
            log_run(pipeline.run_guarded().await);

            let mut sched = pipeline.build_scheduler().await?;
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Status => {
            let store = ListingStore::connect(&config.store_config(), config.table_name()?).await?;
            match store.status().await? {
                Some(status) => println!(
                    "table={} total={} active={} inactive={}",
                    store.table().as_str(),
                    status.total,
                    status.active,
                    status.inactive
                ),
                None => println!("table={} does not exist yet", store.table().as_str()),
            }
        }
    }

    Ok(())
}

fn print_summary(summary: &SyncRunSummary) {
    println!(
        "sync complete: run_id={} table={} fetched={} normalized={} duplicates={} outcome={:?}",
        summary.run_id,
        summary.table,
        summary.fetched_records,
        summary.normalized_rows,
        summary.duplicate_keys,
        summary.outcome
    );
}
