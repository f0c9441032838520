//! Weekly chart ingestion: configuration, orchestration and database load.

pub mod config;
pub mod ingest;
pub mod loader;

#[cfg(test)]
mod testing;

pub use config::{ConfigFile, IngestConfig, LoadFailurePolicy};
pub use ingest::{ingest_years_from_config, IngestStats, Ingestor, YearState, YearSummary};
pub use loader::{
    load_record_file, run_migrations, ChartDatabase, ChartTransaction, LoadError, LoadSummary,
    PgChartDatabase,
};

pub const CRATE_NAME: &str = "hot100-sync";
