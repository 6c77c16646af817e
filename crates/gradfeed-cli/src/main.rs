use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gradfeed_sync::{IngestionController, Outcome, SyncConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "gradfeed-cli")]
#[command(about = "Incremental admissions-results ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch new listing pages and load new records.
    Sync {
        /// Replay saved `page_<n>.html` files instead of fetching.
        #[arg(long)]
        fixtures: Option<PathBuf>,
    },
    /// Create the applicants table.
    Migrate,
    /// Drop the applicants table.
    Reset,
    /// Load a saved dataset file (JSON array, `{"rows": [...]}` or JSON lines).
    Load { path: PathBuf },
    /// Print the stored summary as JSON.
    Report,
    /// Serve the run-trigger API.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync { fixtures: None }) {
        Commands::Sync { fixtures } => {
            let controller = match fixtures {
                Some(dir) => IngestionController::from_config_with_fixtures(config, dir)?,
                None => IngestionController::from_config(config)?,
            };
            match controller.start_run().await? {
                Outcome::Completed(summary) => println!(
                    "sync complete: run_id={} pages={} new_keys={} loaded={} updated={} skipped_duplicates={} failures={}",
                    summary.run_id,
                    summary.pages_fetched,
                    summary.new_keys,
                    summary.load.loaded,
                    summary.load.updated,
                    summary.load.skipped_duplicates,
                    summary.extraction_failures,
                ),
                Outcome::Busy(conflict) => eprintln!("{conflict}"),
            }
        }
        Commands::Migrate => {
            let controller = IngestionController::from_config(config)?;
            controller
                .store()
                .create_schema()
                .await
                .context("creating applicants table")?;
            println!("applicants table ready");
        }
        Commands::Reset => {
            let controller = IngestionController::from_config(config)?;
            controller
                .store()
                .drop_schema()
                .await
                .context("dropping applicants table")?;
            println!("applicants table dropped");
        }
        Commands::Load { path } => {
            let controller = IngestionController::from_config(config)?;
            match controller.load_dataset_file(&path).await? {
                Outcome::Completed(result) => println!(
                    "load complete: loaded={} updated={} skipped_duplicates={} skipped_conflicts={} skipped_invalid={} downgraded={}",
                    result.loaded,
                    result.updated,
                    result.skipped_duplicates,
                    result.skipped_conflicts,
                    result.skipped_invalid,
                    result.downgraded,
                ),
                Outcome::Busy(conflict) => eprintln!("{conflict}"),
            }
        }
        Commands::Report => {
            let controller = IngestionController::from_config(config)?;
            let summary = controller.summary().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Serve => gradfeed_web::serve_from_env().await?,
    }

    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
