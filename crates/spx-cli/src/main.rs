use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "spx-cli")]
#[command(about = "Exchange trading results ingestion and query service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Truncate the trade table and re-ingest every published report.
    Sync,
    /// Apply the trade table schema to DATABASE_URL.
    Migrate,
    /// Serve the query API with the daily cache flush and optional scheduled refresh.
    Serve,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()))
    });
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let report = spx_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} pages={} records={} stale={} rejected={} store_failed={} downloads_failed={}",
                report.run_id,
                report.pages_visited,
                report.records_stored,
                report.files_stale,
                report.files_rejected,
                report.files_store_failed,
                report.downloads_failed
            );
        }
        Commands::Migrate => {
            let url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set to migrate")?;
            let store = spx_storage::PgTradeStore::connect(&url)
                .await
                .context("connecting to trade database")?;
            store.migrate().await.context("applying trade schema")?;
            tracing::info!("trade schema is up to date");
        }
        Commands::Serve => {
            spx_web::serve_from_env().await?;
        }
    }

    Ok(())
}
