use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jobfeed_sync::{connect_store, RunSummary, SyncConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "jobfeed")]
#[command(about = "Poll job boards for active keywords and reconcile listings into the store")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll every active keyword once (default).
    Sync,
    /// Apply database migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = jobfeed_sync::run_sync_once_from_env().await?;
            print_summary(&summary);
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env()?;
            let store = connect_store(&config).await?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
    }

    Ok(())
}

fn print_summary(summary: &RunSummary) {
    for outcome in &summary.outcomes {
        match outcome {
            Ok(report) if report.fetched == 0 => println!("No jobs found for '{}'", report.keyword),
            Ok(report) => println!(
                "Inserted/Updated {} records for '{}' (touched={} unchanged={} skipped={} no_url={} bad_employers={})",
                report.affected(),
                report.keyword,
                report.reconcile.touched,
                report.reconcile.unchanged,
                report.skipped_rows(),
                report.reconcile.missing_url,
                report.rejected_employers,
            ),
            Err(failure) => println!("Error scraping {}: {}", failure.keyword, failure.error),
        }
    }
    println!(
        "sync complete: run_id={} keywords={} ok={} failed={} affected={} skipped={} elapsed={}s",
        summary.run_id,
        summary.outcomes.len(),
        summary.succeeded(),
        summary.failed(),
        summary.total_affected(),
        summary.total_skipped(),
        (summary.finished_at - summary.started_at).num_seconds(),
    );
}
