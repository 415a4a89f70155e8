//! Merge of partial records into one summary
//!
//! Rows of every record are placed by date into `(dates, variables)` buffers, coverage
//! of the target dates is checked, then each variable is reduced over the found dates
//! in date order. The order in which records arrive never changes the result.

use super::operations::PartialRecord;
use super::parallel::{nan_max, nan_min, nan_sum};
use super::summary::Summary;
use crate::dates::to_iso;
use crate::errors::{DatasetError, Result};
use chrono::NaiveDateTime;
use ndarray::{Array1, Array2, Axis};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// How far below zero a variance may fall before it is treated as corrupted input
///
/// A variable fails when `variance < -(atol + rtol * squares / count)`. Anything above
/// that is rounding noise and is clamped to zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VarianceTolerance {
    pub rtol: f64,
    pub atol: f64,
}

impl Default for VarianceTolerance {
    fn default() -> Self {
        Self {
            rtol: 1e-4,
            atol: 1e-12,
        }
    }
}

/// Validate variances and clamp the small negative ones to zero
///
/// A NaN variance fails like a large negative one.
#[allow(clippy::too_many_arguments)]
pub fn check_variance(
    variables: &[String],
    variance: &Array1<f64>,
    minimum: &Array1<f64>,
    maximum: &Array1<f64>,
    mean: &Array1<f64>,
    sums: &Array1<f64>,
    squares: &Array1<f64>,
    count: &Array1<i64>,
    tolerance: VarianceTolerance,
) -> Result<Array1<f64>> {
    let mut failed = Vec::new();
    let mut clamped = variance.clone();
    for (i, name) in variables.iter().enumerate() {
        let v = variance[i];
        if v.is_nan() {
            warn!(
                "Undefined variance for {name}: min={} max={} mean={} sums={} squares={} count={}",
                minimum[i], maximum[i], mean[i], sums[i], squares[i], count[i]
            );
            failed.push(name.clone());
            continue;
        }
        if v >= 0.0 {
            continue;
        }
        let scale = squares[i] / count[i] as f64;
        let threshold = -(tolerance.atol + tolerance.rtol * scale.abs());
        if v < threshold {
            warn!(
                "Negative variance for {name}: variance={v:e} (threshold {threshold:e}) \
                 min={} max={} mean={} sums={} squares={} count={}",
                minimum[i], maximum[i], mean[i], sums[i], squares[i], count[i]
            );
            failed.push(name.clone());
        } else {
            debug!("Clamping variance of {name} from {v:e} to 0");
            clamped[i] = 0.0;
        }
    }
    if failed.is_empty() {
        Ok(clamped)
    } else {
        Err(DatasetError::NegativeVariance { variables: failed })
    }
}

/// Dates statistics are computed over
///
/// The dataset dates without the dataset-level missing ones, restricted to
/// `[start, end]` when bounds are given.
pub fn target_dates(
    dates: &[NaiveDateTime],
    missing: &[NaiveDateTime],
    start: Option<NaiveDateTime>,
    end: Option<NaiveDateTime>,
) -> Vec<NaiveDateTime> {
    let missing: HashSet<&NaiveDateTime> = missing.iter().collect();
    dates
        .iter()
        .filter(|d| !missing.contains(d))
        .filter(|d| start.map_or(true, |s| **d >= s))
        .filter(|d| end.map_or(true, |e| **d <= e))
        .copied()
        .collect()
}

/// Reduces partial records over a fixed list of target dates
#[derive(Debug, Clone)]
pub struct StatAggregator {
    dates: Vec<NaiveDateTime>,
    variables: Vec<String>,
    tolerance: VarianceTolerance,
}

impl StatAggregator {
    pub fn new(dates: Vec<NaiveDateTime>, variables: Vec<String>, tolerance: VarianceTolerance) -> Self {
        Self {
            dates,
            variables,
            tolerance,
        }
    }

    pub fn dates(&self) -> &[NaiveDateTime] {
        &self.dates
    }

    /// Merge `records` into a [`Summary`]
    ///
    /// Every target date must be covered exactly once, either by a row of statistics
    /// or by a missing entry. Dates outside the target are ignored.
    pub fn aggregate<I>(&self, records: I) -> Result<Summary>
    where
        I: IntoIterator<Item = Result<PartialRecord>>,
    {
        let n = self.dates.len();
        let nvars = self.variables.len();
        let index: HashMap<NaiveDateTime, usize> = self.dates.iter().enumerate().map(|(i, d)| (*d, i)).collect();

        let mut minimum = Array2::from_elem((n, nvars), f64::NAN);
        let mut maximum = Array2::from_elem((n, nvars), f64::NAN);
        let mut sums = Array2::from_elem((n, nvars), f64::NAN);
        let mut squares = Array2::from_elem((n, nvars), f64::NAN);
        let mut count = Array2::from_elem((n, nvars), -1_i64);
        let mut has_nans = Array2::from_elem((n, nvars), false);
        let mut found = vec![false; n];
        let mut missing = vec![false; n];

        let mut records_seen = 0usize;
        for record in records {
            let record = record?;
            record.validate(nvars)?;
            records_seen += 1;

            for date in &record.missing_dates {
                if let Some(&i) = index.get(date) {
                    if missing[i] {
                        return Err(DatasetError::Coverage(format!(
                            "duplicate missing date {}",
                            to_iso(date)
                        )));
                    }
                    missing[i] = true;
                }
            }

            let Some(stats) = &record.stats else {
                continue;
            };
            for (row, date) in record.ok_dates.iter().enumerate() {
                let Some(&i) = index.get(date) else {
                    continue;
                };
                if found[i] {
                    return Err(DatasetError::Coverage(format!("duplicate date {}", to_iso(date))));
                }
                found[i] = true;
                minimum.row_mut(i).assign(&stats.minimum.row(row));
                maximum.row_mut(i).assign(&stats.maximum.row(row));
                sums.row_mut(i).assign(&stats.sums.row(row));
                squares.row_mut(i).assign(&stats.squares.row(row));
                count.row_mut(i).assign(&stats.count.row(row));
                has_nans.row_mut(i).assign(&stats.has_nans.row(row));
            }
        }
        debug!("Read {records_seen} partial records");

        for (i, date) in self.dates.iter().enumerate() {
            match (found[i], missing[i]) {
                (true, true) => {
                    return Err(DatasetError::Coverage(format!(
                        "date {} is both found and missing",
                        to_iso(date)
                    )))
                }
                (false, false) => {
                    return Err(DatasetError::Coverage(format!("missing date {}", to_iso(date))));
                }
                _ => {}
            }
        }
        let nfound = found.iter().filter(|&&f| f).count();
        let nmissing = missing.iter().filter(|&&m| m).count();
        if nfound + nmissing != n {
            return Err(DatasetError::Coverage(format!(
                "found {nfound} + missing {nmissing} dates, expected {n}"
            )));
        }
        if nfound == 0 {
            return Err(DatasetError::Coverage("no date with statistics".to_string()));
        }
        info!(
            "Aggregating statistics over {nfound} dates ({nmissing} missing), from {} to {}",
            self.dates.first().map(to_iso).unwrap_or_default(),
            self.dates.last().map(to_iso).unwrap_or_default()
        );

        let rows: Vec<usize> = (0..n).filter(|&i| found[i]).collect();
        let minimum = Array1::from_iter((0..nvars).map(|v| nan_min(column(&minimum, &rows, v))));
        let maximum = Array1::from_iter((0..nvars).map(|v| nan_max(column(&maximum, &rows, v))));
        let sums = Array1::from_iter((0..nvars).map(|v| nan_sum(column(&sums, &rows, v))));
        let squares = Array1::from_iter((0..nvars).map(|v| nan_sum(column(&squares, &rows, v))));
        let count = Array1::from_iter((0..nvars).map(|v| column(&count, &rows, v).sum::<i64>()));
        let has_nans = has_nans.select(Axis(0), &rows).map_axis(Axis(0), |col| col.iter().any(|&b| b));

        let counts = count.mapv(|c| c as f64);
        let mean = &sums / &counts;
        let variance = &squares / &counts - &mean * &mean;
        let variance = check_variance(
            &self.variables,
            &variance,
            &minimum,
            &maximum,
            &mean,
            &sums,
            &squares,
            &count,
            self.tolerance,
        )?;
        let stdev = variance.mapv(f64::sqrt);

        Ok(Summary {
            variables: self.variables.clone(),
            minimum,
            maximum,
            mean,
            stdev,
            sums,
            squares,
            count,
            has_nans,
        })
    }
}

/// Values of variable `v` at the listed rows, in row order
fn column<'a, T: Copy>(a: &'a Array2<T>, rows: &'a [usize], v: usize) -> impl Iterator<Item = T> + 'a {
    rows.iter().map(move |&i| a[[i, v]])
}
