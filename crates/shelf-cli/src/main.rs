use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shelf_storage::PgSnapshotStore;
use shelf_sync::{report_markdown, SyncConfig, SyncPipeline, SyncRunSummary};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "shelf-cli")]
#[command(about = "Shelf Watch catalog collection and history tools")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one collection cycle now.
    Collect,
    /// Run one cycle, then keep collecting on the configured cron until Ctrl-C.
    Schedule,
    /// Apply database migrations to the configured Postgres store.
    Migrate,
    /// Serve the read-only JSON API.
    Serve,
    /// Summarize recent run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn print_summary(summary: &SyncRunSummary) {
    println!(
        "collection complete: run_id={} status={} succeeded={}/{} reports={}",
        summary.run.id,
        summary.run.status.as_str(),
        summary.run.succeeded_count,
        summary.run.attempted_count,
        summary.reports_dir
    );
    for failure in &summary.failures {
        println!("  failed {} ({}): {}", failure.url, failure.kind, failure.reason);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Collect) {
        Commands::Collect => {
            let summary = shelf_sync::run_sync_once_from_env().await?;
            print_summary(&summary);
        }
        Commands::Schedule => {
            let mut config = SyncConfig::from_env();
            config.scheduler_enabled = true;
            let pipeline = Arc::new(SyncPipeline::from_config(config).await?);

            match pipeline.run_once().await {
                Ok(summary) => print_summary(&summary),
                Err(err) => warn!(error = %err, "initial collection run failed"),
            }

            let Some(mut sched) = Arc::clone(&pipeline).maybe_build_scheduler().await? else {
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %pipeline.config().sync_cron, "scheduler running; Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            if !config.store_url.starts_with("postgres") {
                println!("store `{}` is not Postgres; nothing to migrate", config.store_url);
                return Ok(());
            }
            let store = PgSnapshotStore::connect(&config.store_url)
                .await
                .context("connecting to snapshot database")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Serve => {
            shelf_web::serve_from_env().await?;
        }
        Commands::Report { runs } => {
            let config = SyncConfig::from_env();
            println!("{}", report_markdown(runs, &config.workspace_root)?);
        }
    }

    Ok(())
}
