//! Source directory catalog
//!
//! Upstream ingestion lands data in directories named `d_YYYYMMDD-HHMM`, one
//! per UTC minute bucket. This module parses those names, works out which
//! directories are new since the last load, holds back directories that may
//! still be receiving writes, and groups the rest into partition-sized chunks.

use chrono::{DateTime, Datelike, Local, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, warn};

use crate::external::{Hdfs, HdfsError};

const DIR_PREFIX: &str = "d_";
const DIR_NAME_LEN: usize = 15;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Invalid chunk granularity '{0}', expected one of hour, day, month")]
    InvalidGranularity(String),
}

/// A timestamped source directory, ordered by its embedded UTC time
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceDirectory {
    name: String,
    timestamp: NaiveDateTime,
}

impl SourceDirectory {
    /// Extract a source directory from a name, path, or listing line.
    ///
    /// The last `d_YYYYMMDD-HHMM` token wins, so full paths and `ls` output
    /// lines parse as well as bare names.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        text.rmatch_indices(DIR_PREFIX)
            .find_map(|(idx, _)| text.get(idx..idx + DIR_NAME_LEN).and_then(Self::from_name))
    }

    fn from_name(name: &str) -> Option<Self> {
        let digits = name.strip_prefix(DIR_PREFIX)?.as_bytes();
        let well_formed = digits.len() == 13
            && digits
                .iter()
                .enumerate()
                .all(|(i, b)| if i == 8 { *b == b'-' } else { b.is_ascii_digit() });
        if !well_formed {
            return None;
        }

        let timestamp = NaiveDateTime::parse_from_str(&name[DIR_PREFIX.len()..], "%Y%m%d-%H%M").ok()?;
        Some(Self {
            name: name.to_string(),
            timestamp,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// UTC timestamp encoded in the name
    pub fn timestamp(&self) -> NaiveDateTime {
        self.timestamp
    }
}

impl Ord for SourceDirectory {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.name.cmp(&other.name))
    }
}

impl PartialOrd for SourceDirectory {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for SourceDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// List the source directories under `root`, oldest first
pub async fn list_directories(fs: &dyn Hdfs, root: &str) -> Result<Vec<SourceDirectory>, HdfsError> {
    let entries = fs.list(root).await?;
    Ok(sorted_directories(entries.iter().map(String::as_str)))
}

/// Parse and sort directory names, dropping anything that does not match
pub fn sorted_directories<'a>(entries: impl IntoIterator<Item = &'a str>) -> Vec<SourceDirectory> {
    let mut dirs: Vec<SourceDirectory> = entries.into_iter().filter_map(SourceDirectory::parse).collect();
    dirs.sort();
    dirs.dedup();
    dirs
}

/// Directories strictly after `last_processed`.
///
/// A marker that is not present in `all` means the directory vanished or was
/// renamed upstream. That is treated as "nothing new", never as an error.
pub fn new_since(all: &[SourceDirectory], last_processed: Option<&str>) -> Vec<SourceDirectory> {
    let Some(last) = last_processed.map(str::trim) else {
        return all.to_vec();
    };

    match all.iter().position(|d| d.name == last) {
        Some(idx) => all[idx + 1..].to_vec(),
        None => {
            warn!(
                last_processed = last,
                available = all.len(),
                "Last processed directory not found in source listing, nothing to load"
            );
            Vec::new()
        },
    }
}

/// Keep directories older than `delay_hours`, measured in `now`'s wall clock.
///
/// Directory timestamps are UTC. Each one is converted into `now`'s zone
/// using the offset in force at that instant, so a DST change between the
/// directory time and `now` is accounted for.
pub fn filter_by_delay<Z: TimeZone>(
    dirs: Vec<SourceDirectory>,
    now: &DateTime<Z>,
    delay_hours: f64,
) -> Vec<SourceDirectory> {
    let zone = now.timezone();
    let now_local = now.naive_local();

    dirs.into_iter()
        .filter(|dir| {
            let dir_local = zone.from_utc_datetime(&dir.timestamp).naive_local();
            let age_hours = (now_local - dir_local).num_seconds() as f64 / 3600.0;
            let eligible = age_hours > delay_hours;
            if !eligible {
                debug!(directory = %dir, age_hours, delay_hours, "Holding back directory");
            }
            eligible
        })
        .collect()
}

/// Wall clock of the scheduler that triggers runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulerClock {
    /// Process-local zone
    #[default]
    Local,
    /// Explicit IANA zone
    Zone(Tz),
}

impl SchedulerClock {
    /// `filter_by_delay` against the current time in this clock's zone
    pub fn filter_by_delay(&self, dirs: Vec<SourceDirectory>, delay_hours: f64) -> Vec<SourceDirectory> {
        match self {
            SchedulerClock::Local => filter_by_delay(dirs, &Local::now(), delay_hours),
            SchedulerClock::Zone(tz) => filter_by_delay(dirs, &Utc::now().with_timezone(tz), delay_hours),
        }
    }

    /// Current wall-clock time
    pub fn now(&self) -> NaiveDateTime {
        match self {
            SchedulerClock::Local => Local::now().naive_local(),
            SchedulerClock::Zone(tz) => Utc::now().with_timezone(tz).naive_local(),
        }
    }
}

/// Size of the time bucket one batch job processes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Hour,
    Day,
    Month,
}

impl FromStr for Granularity {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "hour" => Ok(Granularity::Hour),
            "day" => Ok(Granularity::Day),
            "month" => Ok(Granularity::Month),
            other => Err(CatalogError::InvalidGranularity(other.to_string())),
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Granularity::Hour => write!(f, "hour"),
            Granularity::Day => write!(f, "day"),
            Granularity::Month => write!(f, "month"),
        }
    }
}

/// Truncated time label of a chunk, rendered `YYYY/MM/DD/HH`.
///
/// Field order makes the derived ordering chronological.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkLabel {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
}

impl ChunkLabel {
    fn truncate(ts: NaiveDateTime, granularity: Granularity) -> Self {
        let (day, hour) = match granularity {
            Granularity::Hour => (ts.day(), ts.hour()),
            Granularity::Day => (ts.day(), 0),
            Granularity::Month => (1, 0),
        };
        Self {
            year: ts.year(),
            month: ts.month(),
            day,
            hour,
        }
    }
}

impl fmt::Display for ChunkLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}/{:02}/{:02}/{:02}", self.year, self.month, self.day, self.hour)
    }
}

/// Chunks keyed by label; iteration order is chronological
pub type ChunkMap = BTreeMap<ChunkLabel, Vec<SourceDirectory>>;

/// Group directories by their truncated timestamp
pub fn chunk(dirs: &[SourceDirectory], granularity: Granularity) -> ChunkMap {
    let mut chunks = ChunkMap::new();
    for dir in dirs {
        chunks
            .entry(ChunkLabel::truncate(dir.timestamp, granularity))
            .or_default()
            .push(dir.clone());
    }
    chunks
}
