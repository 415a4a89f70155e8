//! Dates, groups of dates and statistics date bounds
//!
//! Which dates exist and how they are grouped is decided outside this crate. [`Groups`]
//! only holds the result (an ordered list of groups, the dataset-level missing dates and
//! the frequency) and checks that it is internally consistent.

use crate::errors::{DatasetError, Result};
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime};
use std::collections::HashSet;

/// Format used for dates in attributes and partial-store keys
pub const ISO_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

pub fn to_iso(date: &NaiveDateTime) -> String {
    date.format(ISO_FORMAT).to_string()
}

/// Parse an ISO date or datetime (`2020-01-01`, `2020-01-01T06:00:00`, `2020-01-01 06:00`)
pub fn parse_iso(s: &str) -> Result<NaiveDateTime> {
    let s = s.trim();
    for fmt in [ISO_FORMAT, "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(d) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(d);
        }
    }
    Ok(NaiveDate::parse_from_str(s, "%Y-%m-%d")?.and_time(NaiveTime::MIN))
}

/// Seconds since the Unix epoch, used to store the date axis as integers
pub fn to_epoch_seconds(date: &NaiveDateTime) -> i64 {
    date.and_utc().timestamp()
}

pub fn from_epoch_seconds(seconds: i64) -> Result<NaiveDateTime> {
    chrono::DateTime::from_timestamp(seconds, 0)
        .map(|d| d.naive_utc())
        .ok_or_else(|| DatasetError::store(format!("Invalid timestamp {seconds}")))
}

/// Ordered groups of dates to build, with the dataset-level missing dates
#[derive(Debug, Clone)]
pub struct Groups {
    groups: Vec<Vec<NaiveDateTime>>,
    missing: Vec<NaiveDateTime>,
    frequency: i64,
}

impl Groups {
    /// Validate and wrap the output of the date-grouping collaborator
    ///
    /// `frequency` is in hours. Dates must be strictly increasing across the
    /// concatenation of all groups and no group may be empty.
    pub fn new(groups: Vec<Vec<NaiveDateTime>>, missing: Vec<NaiveDateTime>, frequency: i64) -> Result<Self> {
        if frequency <= 0 {
            return Err(DatasetError::config(format!("Frequency must be positive, got {frequency}")));
        }
        if let Some(i) = groups.iter().position(Vec::is_empty) {
            return Err(DatasetError::config(format!("Group {i} is empty")));
        }
        let mut previous: Option<NaiveDateTime> = None;
        for (i, group) in groups.iter().enumerate() {
            let mut seen = HashSet::new();
            for d in group {
                if !seen.insert(*d) {
                    return Err(DatasetError::config(format!("Duplicate date {d} in group {i}")));
                }
                if previous.is_some_and(|p| p >= *d) {
                    return Err(DatasetError::config(format!(
                        "Dates are not strictly increasing at {d} in group {i}"
                    )));
                }
                previous = Some(*d);
            }
        }
        let mut missing = missing;
        missing.sort();
        missing.dedup();
        Ok(Self {
            groups,
            missing,
            frequency,
        })
    }

    /// Split `dates` into consecutive groups of at most `size` dates
    pub fn from_dates(dates: Vec<NaiveDateTime>, size: usize, missing: Vec<NaiveDateTime>, frequency: i64) -> Result<Self> {
        if size == 0 {
            return Err(DatasetError::config("Group size must be positive"));
        }
        let groups = dates.chunks(size).map(<[NaiveDateTime]>::to_vec).collect();
        Self::new(groups, missing, frequency)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &[NaiveDateTime]> {
        self.groups.iter().map(Vec::as_slice)
    }

    pub fn get(&self, i: usize) -> Option<&[NaiveDateTime]> {
        self.groups.get(i).map(Vec::as_slice)
    }

    /// All dates, in order
    pub fn dates(&self) -> Vec<NaiveDateTime> {
        self.groups.iter().flatten().copied().collect()
    }

    pub fn lengths(&self) -> Vec<usize> {
        self.groups.iter().map(Vec::len).collect()
    }

    /// Row of the first date of each group
    pub fn offsets(&self) -> Vec<usize> {
        self.groups
            .iter()
            .scan(0, |row, group| {
                let start = *row;
                *row += group.len();
                Some(start)
            })
            .collect()
    }

    pub fn missing(&self) -> &[NaiveDateTime] {
        &self.missing
    }

    /// Frequency in hours
    pub fn frequency(&self) -> i64 {
        self.frequency
    }
}

/// Check that `dates` run from `start` to `end` every `frequency` hours with no gap
pub fn normalize_and_check_dates(
    dates: &[NaiveDateTime],
    start: NaiveDateTime,
    end: NaiveDateTime,
    frequency: i64,
    length: usize,
) -> Result<()> {
    let mismatch = || DatasetError::DateCountMismatch {
        dates: dates.len(),
        length,
        start,
        end,
        frequency,
    };
    let step = Duration::hours(frequency);
    let expected = ((end - start).num_seconds() / step.num_seconds()) as usize + 1;
    if dates.len() != length || expected != length {
        return Err(mismatch());
    }
    for (i, d) in dates.iter().enumerate() {
        if *d != start + step * i as i32 {
            return Err(mismatch());
        }
    }
    Ok(())
}

/// Default statistics period for a date axis
///
/// Datasets spanning less than ten years use every date. Longer ones stop at the end
/// of the year before the last date, keeping the final year out of the statistics.
pub fn default_statistics_dates(dates: &[NaiveDateTime]) -> Option<(NaiveDateTime, NaiveDateTime)> {
    let (first, last) = (*dates.first()?, *dates.last()?);
    let years = (last - first).num_days() as f64 / 365.25;
    if years < 10.0 {
        return Some((first, last));
    }
    let end = NaiveDate::from_ymd_opt(last.year() - 1, 12, 31)?.and_hms_opt(23, 59, 59)?;
    Some((first, end))
}

/// A user supplied bound, possibly only a year or a month
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateBound {
    first: NaiveDateTime,
    last: NaiveDateTime,
}

impl DateBound {
    /// Parse `YYYY`, `YYYY-MM`, `YYYY-MM-DD` or a full datetime
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = || DatasetError::config(format!("Invalid date bound '{s}'"));
        let parts: Vec<&str> = s.split('-').collect();
        if parts.len() == 1 {
            let year: i32 = s.parse().map_err(|_| invalid())?;
            let first = NaiveDate::from_ymd_opt(year, 1, 1).ok_or_else(invalid)?;
            let last = NaiveDate::from_ymd_opt(year, 12, 31).ok_or_else(invalid)?;
            return Ok(Self::days(first, last));
        }
        if parts.len() == 2 {
            let year: i32 = parts[0].parse().map_err(|_| invalid())?;
            let month: u32 = parts[1].parse().map_err(|_| invalid())?;
            let first = NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(invalid)?;
            let next = if month == 12 {
                NaiveDate::from_ymd_opt(year + 1, 1, 1)
            } else {
                NaiveDate::from_ymd_opt(year, month + 1, 1)
            }
            .ok_or_else(invalid)?;
            return Ok(Self::days(first, next - Duration::days(1)));
        }
        if let Ok(day) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
            return Ok(Self::days(day, day));
        }
        let exact = parse_iso(s).map_err(|_| invalid())?;
        Ok(Self {
            first: exact,
            last: exact,
        })
    }

    fn days(first: NaiveDate, last: NaiveDate) -> Self {
        Self {
            first: first.and_time(NaiveTime::MIN),
            last: last.and_hms_opt(23, 59, 59).unwrap_or(last.and_time(NaiveTime::MIN)),
        }
    }

    pub fn first(&self) -> NaiveDateTime {
        self.first
    }

    pub fn last(&self) -> NaiveDateTime {
        self.last
    }
}

/// First date of `dates` on or after the start of `bound`
pub fn as_first_date(bound: &DateBound, dates: &[NaiveDateTime]) -> Result<NaiveDateTime> {
    dates
        .iter()
        .copied()
        .find(|d| *d >= bound.first)
        .ok_or_else(|| DatasetError::config(format!("No date on or after {}", bound.first)))
}

/// Last date of `dates` on or before the end of `bound`
pub fn as_last_date(bound: &DateBound, dates: &[NaiveDateTime]) -> Result<NaiveDateTime> {
    dates
        .iter()
        .rev()
        .copied()
        .find(|d| *d <= bound.last)
        .ok_or_else(|| DatasetError::config(format!("No date on or before {}", bound.last)))
}
