//! Core chart model, record-line codec and chart week arithmetic.

use std::fmt;

use chrono::{Datelike, Days, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "hot100-core";

pub const FIRST_CHART_YEAR: i32 = 1958;
pub const LAST_CHART_YEAR: i32 = 2022;

/// ISO week of the first published chart (week ending 1958-08-09).
pub const FIRST_CHART_WEEK: u32 = 32;

/// Number of rows on every well-formed chart page.
pub const CHART_SIZE: usize = 100;

/// Week-ending dates that were never published as a standalone chart.
pub const SKIPPED_CHART_DATES: &[(i32, u32, u32)] = &[(1977, 1, 1)];

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("malformed record line: {0}")]
    Json(#[from] serde_json::Error),
    #[error("position label {0:?} is not a rank")]
    InvalidPosition(String),
    #[error("{field} {value} does not fit a database column")]
    OutOfRange { field: &'static str, value: u32 },
}

/// ISO week-year and week number a chart belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChartWeek {
    pub year: i32,
    pub week: u32,
}

impl ChartWeek {
    pub fn of(date: NaiveDate) -> Self {
        let iso = date.iso_week();
        Self {
            year: iso.year(),
            week: iso.week(),
        }
    }
}

impl fmt::Display for ChartWeek {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-W{:02}", self.year, self.week)
    }
}

/// Chart position as published: either inferred from row order or the
/// literal rank label printed on the page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Position {
    Number(u32),
    Label(String),
}

impl Position {
    pub fn rank(&self) -> Result<u32, RecordError> {
        match self {
            Self::Number(n) => Ok(*n),
            Self::Label(label) => label
                .trim()
                .parse()
                .map_err(|_| RecordError::InvalidPosition(label.clone())),
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Label(label) => f.write_str(label),
        }
    }
}

/// One ranked row of a weekly chart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartEntry {
    pub year: i32,
    pub week: u32,
    pub position: Position,
    pub artist: String,
    pub title: String,
}

#[derive(Serialize)]
struct RecordLineRef<'a>(i32, u32, &'a Position, &'a str, &'a str);

#[derive(Deserialize)]
struct RecordLine(i32, u32, Position, String, String);

impl ChartEntry {
    pub fn new(
        week: ChartWeek,
        position: Position,
        artist: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            year: week.year,
            week: week.week,
            position,
            artist: artist.into(),
            title: title.into(),
        }
    }

    pub fn chart_week(&self) -> ChartWeek {
        ChartWeek {
            year: self.year,
            week: self.week,
        }
    }

    /// Render as one record-file line: `[year, week, position, artist, title]`.
    pub fn to_record_line(&self) -> Result<String, RecordError> {
        let line = RecordLineRef(
            self.year,
            self.week,
            &self.position,
            &self.artist,
            &self.title,
        );
        Ok(serde_json::to_string(&line)?)
    }

    pub fn from_record_line(line: &str) -> Result<Self, RecordError> {
        let RecordLine(year, week, position, artist, title) = serde_json::from_str(line.trim())?;
        Ok(Self {
            year,
            week,
            position,
            artist,
            title,
        })
    }
}

struct PositionCorrection {
    year: i32,
    week: u32,
    title: &'static str,
    position: i32,
}

/// Upstream publication errors patched at load time.
const POSITION_CORRECTIONS: &[PositionCorrection] = &[PositionCorrection {
    year: 1984,
    week: 7,
    title: "Remember The Nights",
    position: 87,
}];

/// Position a known correction assigns to `title` in the given chart week.
pub fn position_correction(year: i32, week: u32, title: &str) -> Option<i32> {
    POSITION_CORRECTIONS
        .iter()
        .find(|c| c.year == year && c.week == week && c.title == title)
        .map(|c| c.position)
}

/// Database-resident form of a [`ChartEntry`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedRow {
    pub year: i32,
    pub week: i32,
    pub position: i32,
    pub artist: String,
    pub title: String,
}

impl PersistedRow {
    pub fn from_entry(entry: ChartEntry) -> Result<Self, RecordError> {
        let week = i32::try_from(entry.week).map_err(|_| RecordError::OutOfRange {
            field: "week",
            value: entry.week,
        })?;

        // A correction replaces the source value outright, even an unparsable one.
        let position = match position_correction(entry.year, entry.week, &entry.title) {
            Some(position) => position,
            None => {
                let rank = entry.position.rank()?;
                i32::try_from(rank).map_err(|_| RecordError::OutOfRange {
                    field: "position",
                    value: rank,
                })?
            }
        };

        Ok(Self {
            year: entry.year,
            week,
            position,
            artist: entry.artist,
            title: entry.title,
        })
    }
}

pub fn is_skipped_chart_date(date: NaiveDate) -> bool {
    SKIPPED_CHART_DATES
        .iter()
        .any(|&(y, m, d)| date.year() == y && date.month() == m && date.day() == d)
}

/// Week-ending Saturdays of every ISO week belonging to `year`, in order.
///
/// The first chart year starts at [`FIRST_CHART_WEEK`]; every other year
/// starts at ISO week 1. The sequence stops at the following year's week 1
/// and leaves out [`SKIPPED_CHART_DATES`].
pub fn chart_dates_for_year(year: i32) -> Vec<NaiveDate> {
    if year < FIRST_CHART_YEAR {
        return Vec::new();
    }
    let first_week = if year == FIRST_CHART_YEAR {
        FIRST_CHART_WEEK
    } else {
        1
    };
    let Some(mut date) = NaiveDate::from_isoywd_opt(year, first_week, Weekday::Sat) else {
        return Vec::new();
    };

    let mut dates = Vec::with_capacity(53);
    while date.iso_week().year() == year {
        if !is_skipped_chart_date(date) {
            dates.push(date);
        }
        match date.checked_add_days(Days::new(7)) {
            Some(next) => date = next,
            None => break,
        }
    }
    dates
}

pub fn chart_url(base_url: &str, date: NaiveDate) -> String {
    format!(
        "{}/{}/",
        base_url.trim_end_matches('/'),
        date.format("%Y-%m-%d")
    )
}
