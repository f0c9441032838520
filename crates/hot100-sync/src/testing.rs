//! In-memory collaborators for pipeline tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::bail;
use async_trait::async_trait;
use chrono::NaiveDate;
use hot100_core::PersistedRow;
use hot100_storage::{CachedPage, FetchError, PageCache, PageSource};

use crate::loader::{ChartDatabase, ChartTransaction};

#[derive(Debug, Default)]
struct MemoryState {
    rows: Vec<PersistedRow>,
    transactions: usize,
    commits: usize,
    rollbacks: usize,
    fail_at_row: Option<usize>,
    failures_left: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryDatabase {
    /// Make the `row`-th insert of the next `times` transactions fail.
    pub fn failing_at_row(self, row: usize, times: usize) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.fail_at_row = Some(row);
            state.failures_left = times;
        }
        self
    }

    pub fn rows(&self) -> Vec<PersistedRow> {
        self.state.lock().unwrap().rows.clone()
    }

    pub fn transactions(&self) -> usize {
        self.state.lock().unwrap().transactions
    }

    pub fn commits(&self) -> usize {
        self.state.lock().unwrap().commits
    }

    pub fn rollbacks(&self) -> usize {
        self.state.lock().unwrap().rollbacks
    }
}

struct MemoryTransaction {
    state: Arc<Mutex<MemoryState>>,
    cleared: Option<i32>,
    pending: Vec<PersistedRow>,
}

#[async_trait]
impl ChartDatabase for MemoryDatabase {
    async fn begin(&self, _year: i32) -> anyhow::Result<Box<dyn ChartTransaction>> {
        self.state.lock().unwrap().transactions += 1;
        Ok(Box::new(MemoryTransaction {
            state: Arc::clone(&self.state),
            cleared: None,
            pending: Vec::new(),
        }))
    }
}

#[async_trait]
impl ChartTransaction for MemoryTransaction {
    async fn clear_year(&mut self, year: i32) -> anyhow::Result<u64> {
        self.cleared = Some(year);
        let state = self.state.lock().unwrap();
        Ok(state.rows.iter().filter(|r| r.year == year).count() as u64)
    }

    async fn insert(&mut self, row: &PersistedRow) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_at_row == Some(self.pending.len() + 1) && state.failures_left > 0 {
            state.failures_left -= 1;
            bail!("simulated insert failure at row {}", self.pending.len() + 1);
        }
        self.pending.push(row.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> anyhow::Result<()> {
        let Self {
            state,
            cleared,
            pending,
        } = *self;
        let mut state = state.lock().unwrap();
        if let Some(year) = cleared {
            state.rows.retain(|r| r.year != year);
        }
        state.rows.extend(pending);
        state.commits += 1;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> anyhow::Result<()> {
        self.state.lock().unwrap().rollbacks += 1;
        Ok(())
    }
}

/// Serves generated chart pages, recording every fetch.
#[derive(Debug)]
pub struct FixtureSource {
    cache: PageCache,
    fetches: AtomicUsize,
    rejected: HashSet<NaiveDate>,
    untitled_row: Option<(NaiveDate, usize)>,
}

impl FixtureSource {
    pub fn new(cache: PageCache) -> Self {
        Self {
            cache,
            fetches: AtomicUsize::new(0),
            rejected: HashSet::new(),
            untitled_row: None,
        }
    }

    /// Answer `date` as if the server returned a non-200 status.
    pub fn rejecting(mut self, date: NaiveDate) -> Self {
        self.rejected.insert(date);
        self
    }

    /// Serve `date` with one row lacking its title.
    pub fn with_untitled_row(mut self, date: NaiveDate, row: usize) -> Self {
        self.untitled_row = Some((date, row));
        self
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageSource for FixtureSource {
    fn cache(&self) -> &PageCache {
        &self.cache
    }

    async fn fetch(&self, date: NaiveDate) -> Result<Option<CachedPage>, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.rejected.contains(&date) {
            return Ok(None);
        }
        let untitled = self
            .untitled_row
            .filter(|(d, _)| *d == date)
            .map(|(_, row)| row);
        let html = chart_page(date, untitled);
        Ok(Some(self.cache.store_bytes(date, html.as_bytes()).await?))
    }
}

/// A rank-labelled 100-row chart page for `date`.
pub fn chart_page(date: NaiveDate, untitled_row: Option<usize>) -> String {
    let rows = (1..=100)
        .map(|n| {
            let title = if untitled_row == Some(n) {
                String::new()
            } else {
                format!(r#"<h3 id="title-of-a-story">Song {n} of {date}</h3>"#)
            };
            format!(
                r#"<div class="o-chart-results-list-row-container"><ul class="o-chart-results-list-row">
                <li class="o-chart-results-list__item"><span class="c-label a-font-primary-bold-l">{n}</span></li>
                <li class="lrv-u-width-100p"><ul><li class="o-chart-results-list__item">
                  {title}
                  <span class="c-label a-no-trucate">Artist {n}</span>
                </li></ul></li>
                </ul></div>"#
            )
        })
        .collect::<String>();
    format!("<html><body>{rows}</body></html>")
}
