//! Year-at-a-time transactional load of record files into the database.

use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use hot100_core::{ChartEntry, PersistedRow, RecordError};
use hot100_storage::RecordFile;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("{}:{line}: {source}", path.display())]
    Record {
        path: PathBuf,
        line: usize,
        #[source]
        source: RecordError,
    },
    #[error("reading record file: {0:#}")]
    Read(anyhow::Error),
    #[error("database: {0:#}")]
    Database(anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadSummary {
    pub year: i32,
    pub rows: usize,
    pub replaced: u64,
}

/// Opens one transaction per loaded year.
#[async_trait]
pub trait ChartDatabase: Send + Sync {
    async fn begin(&self, year: i32) -> anyhow::Result<Box<dyn ChartTransaction>>;
}

#[async_trait]
pub trait ChartTransaction: Send {
    /// Remove rows a previous load left for `year`; returns how many.
    async fn clear_year(&mut self, year: i32) -> anyhow::Result<u64>;

    async fn insert(&mut self, row: &PersistedRow) -> anyhow::Result<()>;

    async fn commit(self: Box<Self>) -> anyhow::Result<()>;

    async fn rollback(self: Box<Self>) -> anyhow::Result<()>;
}

/// Postgres target. Each year gets its own single-connection pool which
/// is closed once the transaction ends.
#[derive(Debug, Clone)]
pub struct PgChartDatabase {
    database_url: String,
}

impl PgChartDatabase {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
        }
    }
}

#[async_trait]
impl ChartDatabase for PgChartDatabase {
    async fn begin(&self, year: i32) -> anyhow::Result<Box<dyn ChartTransaction>> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(&self.database_url)
            .await
            .context("connecting to database")?;
        let tx = pool
            .begin()
            .await
            .with_context(|| format!("beginning transaction for {year}"))?;
        Ok(Box::new(PgChartTransaction { pool, tx }))
    }
}

struct PgChartTransaction {
    pool: PgPool,
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl ChartTransaction for PgChartTransaction {
    async fn clear_year(&mut self, year: i32) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM hot100 WHERE year = $1")
            .bind(year)
            .execute(&mut *self.tx)
            .await
            .with_context(|| format!("clearing rows for {year}"))?;
        Ok(result.rows_affected())
    }

    async fn insert(&mut self, row: &PersistedRow) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO hot100 (year, week, position, artist, title)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(row.year)
        .bind(row.week)
        .bind(row.position)
        .bind(&row.artist)
        .bind(&row.title)
        .execute(&mut *self.tx)
        .await
        .with_context(|| format!("inserting {}-W{:02} #{}", row.year, row.week, row.position))?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> anyhow::Result<()> {
        let Self { pool, tx } = *self;
        let result = tx.commit().await.context("committing transaction");
        pool.close().await;
        result
    }

    async fn rollback(self: Box<Self>) -> anyhow::Result<()> {
        let Self { pool, tx } = *self;
        let result = tx.rollback().await.context("rolling back transaction");
        pool.close().await;
        result
    }
}

pub async fn run_migrations(database_url: &str) -> anyhow::Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(database_url)
        .await
        .context("connecting to database")?;
    sqlx::migrate!("../../migrations")
        .run(&pool)
        .await
        .context("applying migrations")?;
    pool.close().await;
    Ok(())
}

/// Load a finished record file inside one transaction.
///
/// A missing file is logged and returns `Ok(None)`. Any bad line or failed
/// statement rolls the whole year back and is returned.
pub async fn load_record_file(
    database: &dyn ChartDatabase,
    record: &RecordFile,
) -> Result<Option<LoadSummary>, LoadError> {
    let year = record.year();
    let Some(lines) = record.open_lines().await.map_err(LoadError::Read)? else {
        warn!(year, path = %record.path().display(), "no record file to load");
        return Ok(None);
    };

    let mut tx = database.begin(year).await.map_err(LoadError::Database)?;
    match insert_lines(tx.as_mut(), record, lines).await {
        Ok((rows, replaced)) => {
            tx.commit().await.map_err(LoadError::Database)?;
            info!(year, rows, replaced, "committed chart year");
            Ok(Some(LoadSummary { year, rows, replaced }))
        }
        Err(err) => {
            warn!(year, error = %err, "rolling back chart year");
            if let Err(rollback_err) = tx.rollback().await {
                warn!(year, error = %rollback_err, "rollback failed");
            }
            Err(err)
        }
    }
}

async fn insert_lines(
    tx: &mut dyn ChartTransaction,
    record: &RecordFile,
    mut lines: tokio::io::Lines<tokio::io::BufReader<tokio::fs::File>>,
) -> Result<(usize, u64), LoadError> {
    let replaced = tx
        .clear_year(record.year())
        .await
        .map_err(LoadError::Database)?;

    let mut rows = 0usize;
    let mut line_no = 0usize;
    while let Some(line) = lines
        .next_line()
        .await
        .with_context(|| format!("reading {}", record.path().display()))
        .map_err(LoadError::Read)?
    {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let row = ChartEntry::from_record_line(&line)
            .and_then(PersistedRow::from_entry)
            .map_err(|source| LoadError::Record {
                path: record.path().to_path_buf(),
                line: line_no,
                source,
            })?;
        tx.insert(&row).await.map_err(LoadError::Database)?;
        rows += 1;
    }
    Ok((rows, replaced))
}
