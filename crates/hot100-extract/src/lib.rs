//! Chart page extraction: cached HTML in, ranked chart entries out.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use hot100_core::{position_correction, ChartEntry, ChartWeek, Position, CHART_SIZE};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

pub const CRATE_NAME: &str = "hot100-extract";

const ROW_SELECTOR: &str = "div.o-chart-results-list-row-container";
const TITLE_SELECTOR: &str = "li.o-chart-results-list__item > h3#title-of-a-story";
const RANK_SELECTOR: &str = "li.o-chart-results-list__item > span.c-label.a-font-primary-bold-l";

/// The two row layouts the chart has been published with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageLayout {
    /// Every row prints its own rank label.
    RankLabeled,
    /// Rows carry no label; rank follows document order.
    OrderInferred,
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("reading cached page {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid selector {selector:?}: {message}")]
    Selector { selector: &'static str, message: String },
    #[error("chart {week} row {row}: no {field} found, page structure has changed")]
    MissingField {
        week: ChartWeek,
        row: usize,
        field: &'static str,
    },
    #[error("chart {week} row {row}: rank label {label:?} does not match row order")]
    RankMismatch {
        week: ChartWeek,
        row: usize,
        label: String,
    },
}

#[derive(Debug, Clone)]
struct ChartRow {
    rank: Option<String>,
    title: Option<String>,
    artist: Option<String>,
}

/// Lazily validated entries of one chart page, in document order.
///
/// Yields an error and then stops at the first row missing a required
/// field.
#[derive(Debug)]
pub struct ChartEntries {
    week: ChartWeek,
    layout: Option<PageLayout>,
    rows: std::vec::IntoIter<ChartRow>,
    next_row: usize,
    failed: bool,
}

impl ChartEntries {
    fn rejected(week: ChartWeek) -> Self {
        Self {
            week,
            layout: None,
            rows: Vec::new().into_iter(),
            next_row: 1,
            failed: false,
        }
    }

    pub fn week(&self) -> ChartWeek {
        self.week
    }

    /// `None` when the page was rejected before any row was read.
    pub fn layout(&self) -> Option<PageLayout> {
        self.layout
    }

    fn entry_for(&self, row_no: usize, row: ChartRow) -> Result<ChartEntry, ExtractError> {
        let missing = |field| ExtractError::MissingField {
            week: self.week,
            row: row_no,
            field,
        };
        let title = row.title.ok_or_else(|| missing("title"))?;
        let artist = row.artist.ok_or_else(|| missing("artist"))?;
        let position = match self.layout {
            Some(PageLayout::RankLabeled) => {
                let label = row.rank.ok_or_else(|| missing("rank"))?;
                let in_order = label.parse::<usize>().ok() == Some(row_no);
                let corrected = position_correction(self.week.year, self.week.week, &title).is_some();
                if !in_order && !corrected {
                    return Err(ExtractError::RankMismatch {
                        week: self.week,
                        row: row_no,
                        label,
                    });
                }
                Position::Label(label)
            }
            _ => Position::Number(row_no as u32),
        };
        Ok(ChartEntry::new(self.week, position, artist, title))
    }
}

impl Iterator for ChartEntries {
    type Item = Result<ChartEntry, ExtractError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let row = self.rows.next()?;
        let row_no = self.next_row;
        self.next_row += 1;
        let result = self.entry_for(row_no, row);
        self.failed = result.is_err();
        Some(result)
    }
}

fn selector(css: &'static str) -> Result<Selector, ExtractError> {
    Selector::parse(css).map_err(|e| ExtractError::Selector {
        selector: css,
        message: e.to_string(),
    })
}

fn text_or_none(value: String) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn element_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(element.text().collect::<String>())
}

/// First element following `element` among its siblings, skipping text.
fn next_element_sibling(element: ElementRef<'_>) -> Option<ElementRef<'_>> {
    element.next_siblings().find_map(ElementRef::wrap)
}

pub fn detect_layout(first_row: ElementRef<'_>, rank: &Selector) -> PageLayout {
    if first_row.select(rank).next().is_some() {
        PageLayout::RankLabeled
    } else {
        PageLayout::OrderInferred
    }
}

/// Parse one chart page. A page without exactly [`CHART_SIZE`] rows is
/// logged and produces no entries.
pub fn parse_chart_page(html: &str, week: ChartWeek) -> Result<ChartEntries, ExtractError> {
    let row_sel = selector(ROW_SELECTOR)?;
    let title_sel = selector(TITLE_SELECTOR)?;
    let rank_sel = selector(RANK_SELECTOR)?;

    let document = Html::parse_document(html);
    let row_elements = document.select(&row_sel).collect::<Vec<_>>();
    if row_elements.len() != CHART_SIZE {
        error!(
            %week,
            rows = row_elements.len(),
            expected = CHART_SIZE,
            "rejecting chart page: unexpected row count"
        );
        return Ok(ChartEntries::rejected(week));
    }

    let layout = detect_layout(row_elements[0], &rank_sel);
    debug!(%week, ?layout, "detected chart page layout");

    let rows = row_elements
        .into_iter()
        .map(|row| {
            let title = row.select(&title_sel).next();
            let artist = title.and_then(next_element_sibling);
            ChartRow {
                rank: row.select(&rank_sel).next().and_then(element_text),
                title: title.and_then(element_text),
                artist: artist.and_then(element_text),
            }
        })
        .collect::<Vec<_>>();

    Ok(ChartEntries {
        week,
        layout: Some(layout),
        rows: rows.into_iter(),
        next_row: 1,
        failed: false,
    })
}

/// Extract the entries of the page cached for `date`.
pub fn extract_entries(page_path: impl AsRef<Path>, date: NaiveDate) -> Result<ChartEntries, ExtractError> {
    let page_path = page_path.as_ref();
    let html = fs::read_to_string(page_path).map_err(|source| ExtractError::Io {
        path: page_path.to_path_buf(),
        source,
    })?;
    parse_chart_page(&html, ChartWeek::of(date))
}
