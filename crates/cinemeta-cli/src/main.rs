use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "cinemeta-cli")]
#[command(about = "TMDB movie discovery and enrichment")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Page through discover results for the configured years.
    Discover,
    /// Fill missing budget/revenue from per-movie lookups, then merge.
    Enrich,
    /// Merge the current checkpoint into the input table without fetching.
    Merge,
}

fn init_tracing(default_filter: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {}", e))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("info")?;
    let cli = Cli::parse();
    tracing::debug!(?cli, "parsed arguments");

    match cli.command.unwrap_or(Commands::Enrich) {
        Commands::Discover => {
            let summary = cinemeta_sync::run_discovery_from_env().await?;
            println!(
                "discover complete: run_id={} years={} pages={} failed_pages={} movies={} output={}",
                summary.run_id,
                summary.years,
                summary.pages_requested,
                summary.pages_failed,
                summary.movies,
                summary.output_path
            );
        }
        Commands::Enrich => {
            let summary = cinemeta_sync::run_enrichment_from_env().await?;
            println!(
                "enrich complete: run_id={} pending={} enriched={} discarded={} resumed={} rows={} output={}",
                summary.run_id,
                summary.pending,
                summary.enriched,
                summary.discarded,
                summary.resumed_records,
                summary.merged_rows,
                summary.output_path
            );
            if let Some(manifest) = summary.parquet_manifest {
                println!("parquet manifest: {manifest}");
            }
        }
        Commands::Merge => {
            let summary = cinemeta_sync::run_merge_from_env().await?;
            println!(
                "merge complete: input_rows={} checkpoint_records={} rows={} output={}",
                summary.input_rows,
                summary.checkpoint_records,
                summary.merged_rows,
                summary.output_path
            );
            if let Some(manifest) = summary.parquet_manifest {
                println!("parquet manifest: {manifest}");
            }
        }
    }

    Ok(())
}
