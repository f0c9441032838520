use std::path::PathBuf;

use anyhow::Result;
use clap::error::ErrorKind;
use clap::{Args, CommandFactory, Parser, Subcommand};
use hot100_core::{FIRST_CHART_YEAR, LAST_CHART_YEAR};
use hot100_sync::{IngestConfig, LoadFailurePolicy};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "hot100")]
#[command(about = "Scrape weekly Hot 100 charts and load them into Postgres")]
struct Cli {
    /// YAML file overriding the environment configuration
    #[arg(long, global = true, env = "HOT100_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, stage and load one year or an inclusive range of years
    Ingest(IngestArgs),
    /// Create the chart table
    Migrate,
}

#[derive(Debug, Args)]
struct IngestArgs {
    /// First year to ingest
    #[arg(value_parser = clap::value_parser!(i32).range(FIRST_CHART_YEAR as i64..=LAST_CHART_YEAR as i64))]
    start: i32,

    /// Last year to ingest (defaults to START)
    #[arg(value_parser = clap::value_parser!(i32).range(FIRST_CHART_YEAR as i64..=LAST_CHART_YEAR as i64))]
    end: Option<i32>,

    /// What to do when a year fails to load: reingest or halt
    #[arg(long)]
    on_load_failure: Option<LoadFailurePolicy>,

    #[arg(long)]
    max_reingest: Option<u32>,

    #[arg(long)]
    html_dir: Option<PathBuf>,

    #[arg(long)]
    jsonl_dir: Option<PathBuf>,
}

impl IngestArgs {
    fn apply(&self, config: &mut IngestConfig) {
        if let Some(v) = self.on_load_failure {
            config.on_load_failure = v;
        }
        if let Some(v) = self.max_reingest {
            config.max_reingest_attempts = v;
        }
        if let Some(v) = &self.html_dir {
            config.html_dir = v.clone();
        }
        if let Some(v) = &self.jsonl_dir {
            config.jsonl_dir = v.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hot100=info,hot100_sync=info,hot100_storage=info,hot100_extract=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = IngestConfig::load(cli.config.as_deref())?;
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }

    match cli.command {
        Commands::Ingest(args) => {
            let end = args.end.unwrap_or(args.start);
            if end < args.start {
                Cli::command()
                    .error(
                        ErrorKind::ValueValidation,
                        format!("END ({end}) must not be before START ({})", args.start),
                    )
                    .exit();
            }
            args.apply(&mut config);
            info!(
                start = args.start,
                end,
                on_load_failure = %config.on_load_failure,
                "starting ingestion"
            );

            let summaries = hot100_sync::ingest_years_from_config(config, args.start..=end).await?;
            for summary in summaries {
                let (fetched, skipped) = summary
                    .ingest
                    .map(|s| (s.fetched, s.skipped))
                    .unwrap_or_default();
                println!(
                    "{}: rows={} fetched={} skipped_weeks={} attempts={} elapsed={:.1}s",
                    summary.year,
                    summary.rows,
                    fetched,
                    skipped,
                    summary.attempts,
                    summary.elapsed.as_secs_f64()
                );
            }
        }
        Commands::Migrate => {
            hot100_sync::run_migrations(&config.database_url).await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
