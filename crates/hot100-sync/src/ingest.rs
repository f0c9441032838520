//! Per-year ingestion: fetch, extract, stage, load.

use std::ops::RangeInclusive;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use hot100_core::{chart_dates_for_year, ChartWeek};
use hot100_extract::parse_chart_page;
use hot100_storage::{HttpFetcher, PageCache, PageSource, RecordFile};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::{IngestConfig, LoadFailurePolicy};
use crate::loader::{load_record_file, ChartDatabase, PgChartDatabase};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YearState {
    NotStarted,
    Ingesting,
    Loading,
    Done,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub weeks: usize,
    pub fetched: usize,
    pub skipped: usize,
    pub entries: usize,
}

#[derive(Debug, Clone)]
pub struct YearSummary {
    pub year: i32,
    pub ingest: Option<IngestStats>,
    pub rows: usize,
    pub attempts: u32,
    pub elapsed: Duration,
}

pub struct Ingestor {
    config: IngestConfig,
    source: Box<dyn PageSource>,
    database: Box<dyn ChartDatabase>,
}

impl Ingestor {
    pub fn new(config: IngestConfig) -> Result<Self> {
        let cache = PageCache::new(config.html_dir.clone());
        let source = HttpFetcher::new(config.http_client_config(), cache)?;
        let database = PgChartDatabase::new(config.database_url.clone());
        Ok(Self::with_parts(config, Box::new(source), Box::new(database)))
    }

    pub fn with_parts(
        config: IngestConfig,
        source: Box<dyn PageSource>,
        database: Box<dyn ChartDatabase>,
    ) -> Self {
        Self {
            config,
            source,
            database,
        }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub async fn run_years(&self, years: RangeInclusive<i32>) -> Result<Vec<YearSummary>> {
        let mut summaries = Vec::new();
        for year in years {
            let summary = self
                .run_year(year)
                .instrument(info_span!("year", year))
                .await?;
            summaries.push(summary);
        }
        Ok(summaries)
    }

    /// Drive one year from whatever tier already holds it through to a
    /// committed load.
    pub async fn run_year(&self, year: i32) -> Result<YearSummary> {
        let started = Instant::now();
        let record = RecordFile::new(&self.config.jsonl_dir, year);
        let mut state = YearState::NotStarted;
        let mut ingest = None;
        let mut attempts = 0u32;
        let mut reingests = 0u32;
        let mut rows = 0usize;

        loop {
            let next = match state {
                YearState::NotStarted => {
                    if record
                        .exists()
                        .await
                        .with_context(|| format!("checking {}", record.path().display()))?
                    {
                        info!(path = %record.path().display(), "record file present, skipping ingestion");
                        YearState::Loading
                    } else {
                        YearState::Ingesting
                    }
                }
                YearState::Ingesting => {
                    attempts += 1;
                    ingest = Some(self.ingest_year(year, &record).await?);
                    YearState::Loading
                }
                YearState::Loading => match load_record_file(self.database.as_ref(), &record).await {
                    Ok(summary) => {
                        rows = summary.map(|s| s.rows).unwrap_or_default();
                        YearState::Done
                    }
                    Err(err) => match self.config.on_load_failure {
                        LoadFailurePolicy::Reingest if reingests < self.config.max_reingest_attempts => {
                            reingests += 1;
                            warn!(error = %err, reingests, "load failed, discarding record file and ingesting again");
                            record.discard().await?;
                            YearState::Ingesting
                        }
                        LoadFailurePolicy::Reingest => {
                            return Err(err).with_context(|| {
                                format!("loading {year} failed after {reingests} re-ingestion(s)")
                            });
                        }
                        LoadFailurePolicy::Halt => {
                            return Err(err).with_context(|| format!("loading {year}"));
                        }
                    },
                },
                YearState::Done => break,
            };
            debug!(from = ?state, to = ?next, "year state");
            state = next;
        }

        let elapsed = started.elapsed();
        info!(rows, attempts, elapsed_ms = elapsed.as_millis() as u64, "year done");
        Ok(YearSummary {
            year,
            ingest,
            rows,
            attempts,
            elapsed,
        })
    }

    /// Build the record file for `year` week by week, fetching only the
    /// pages not cached yet.
    async fn ingest_year(&self, year: i32, record: &RecordFile) -> Result<IngestStats> {
        let dates = chart_dates_for_year(year);
        let mut stats = IngestStats {
            weeks: dates.len(),
            ..Default::default()
        };
        let cache = self.source.cache();
        let mut writer = record.create().await?;

        for date in dates {
            let cached = cache
                .contains(date)
                .await
                .with_context(|| format!("checking page cache for {date}"))?;
            if !cached {
                match self
                    .source
                    .fetch(date)
                    .await
                    .with_context(|| format!("fetching chart for {date}"))?
                {
                    Some(_) => stats.fetched += 1,
                    None => {
                        warn!(%date, "no chart page cached, skipping week");
                        stats.skipped += 1;
                        continue;
                    }
                }
            }

            let page_path = cache.path_for(date);
            let html = tokio::fs::read_to_string(&page_path)
                .await
                .with_context(|| format!("reading cached page {}", page_path.display()))?;
            let entries = parse_chart_page(&html, ChartWeek::of(date))
                .with_context(|| format!("extracting chart for {date}"))?
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("chart for {date} is unusable"))?;
            if entries.is_empty() {
                stats.skipped += 1;
                continue;
            }

            writer.append(&entries).await?;
            stats.entries += entries.len();
        }

        let path = writer.finish().await?;
        if stats.skipped > 0 {
            warn!(skipped = stats.skipped, "record file is missing weeks");
        }
        info!(
            path = %path.display(),
            weeks = stats.weeks,
            fetched = stats.fetched,
            entries = stats.entries,
            "record file written"
        );
        Ok(stats)
    }
}

pub async fn ingest_years_from_config(
    config: IngestConfig,
    years: RangeInclusive<i32>,
) -> Result<Vec<YearSummary>> {
    Ingestor::new(config)?.run_years(years).await
}
