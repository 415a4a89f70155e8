//! Per-unit statistics and the partial records that carry them
//!
//! A worker reduces every staged `(time, variable)` field to six raw statistics and
//! stores them as a [`PartialRecord`]. Raw sums are kept instead of means so that
//! records from any number of workers can be merged exactly later on.

use super::parallel::{parallel_field_stats, FieldStats};
use crate::check::ValuesCheck;
use crate::errors::{DatasetError, Result};
use chrono::NaiveDateTime;
use ndarray::{Array2, ArrayViewD, Axis};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Statistics fields, in the order they are published
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatField {
    Mean,
    Stdev,
    Minimum,
    Maximum,
    Sums,
    Squares,
    Count,
    HasNans,
}

impl StatField {
    pub const ALL: [StatField; 8] = [
        Self::Mean,
        Self::Stdev,
        Self::Minimum,
        Self::Maximum,
        Self::Sums,
        Self::Squares,
        Self::Count,
        Self::HasNans,
    ];

    /// Get the string representation of the field
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Mean => "mean",
            Self::Stdev => "stdev",
            Self::Minimum => "minimum",
            Self::Maximum => "maximum",
            Self::Sums => "sums",
            Self::Squares => "squares",
            Self::Count => "count",
            Self::HasNans => "has_nans",
        }
    }
}

/// Raw statistics of a block, one row per date and one column per variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialStatistics {
    pub minimum: Array2<f64>,
    pub maximum: Array2<f64>,
    pub sums: Array2<f64>,
    pub squares: Array2<f64>,
    pub count: Array2<i64>,
    pub has_nans: Array2<bool>,
}

impl PartialStatistics {
    pub fn rows(&self) -> usize {
        self.minimum.nrows()
    }

    pub fn variables(&self) -> usize {
        self.minimum.ncols()
    }

    fn check_shape(&self) -> Result<()> {
        let expected = self.minimum.shape();
        let shapes = [
            self.maximum.shape(),
            self.sums.shape(),
            self.squares.shape(),
            self.count.shape(),
            self.has_nans.shape(),
        ];
        match shapes.into_iter().find(|s| *s != expected) {
            Some(found) => Err(DatasetError::ShapeMismatch {
                what: "partial statistics fields".to_string(),
                expected: expected.to_vec(),
                found: found.to_vec(),
            }),
            None => Ok(()),
        }
    }
}

/// One worker's contribution for one unit of work
///
/// `stats` has one row per entry of `ok_dates`, and is `None` when every date of the
/// unit is missing. `key` is the full date list of the unit and addresses the record
/// in the partial store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialRecord {
    pub key: Vec<NaiveDateTime>,
    pub ok_dates: Vec<NaiveDateTime>,
    pub missing_dates: Vec<NaiveDateTime>,
    pub unit_index: usize,
    pub stats: Option<PartialStatistics>,
}

impl PartialRecord {
    /// Record for a unit where every date has data
    pub fn complete(unit_index: usize, dates: Vec<NaiveDateTime>, stats: PartialStatistics) -> Self {
        Self {
            key: dates.clone(),
            ok_dates: dates,
            missing_dates: Vec::new(),
            unit_index,
            stats: Some(stats),
        }
    }

    /// Record for a unit where no date has data
    pub fn missing(unit_index: usize, dates: Vec<NaiveDateTime>) -> Self {
        Self {
            key: dates.clone(),
            ok_dates: Vec::new(),
            missing_dates: dates,
            unit_index,
            stats: None,
        }
    }

    /// Split a unit's dates into usable and missing ones and compute statistics of the usable rows
    ///
    /// `compute` receives the row positions (within `dates`) of the usable dates and
    /// is not called when every date is missing.
    pub fn partition(
        unit_index: usize,
        dates: &[NaiveDateTime],
        is_missing: impl Fn(&NaiveDateTime) -> bool,
        compute: impl FnOnce(&[usize]) -> Result<PartialStatistics>,
    ) -> Result<Self> {
        let (ok_rows, missing_rows): (Vec<usize>, Vec<usize>) =
            (0..dates.len()).partition(|&i| !is_missing(&dates[i]));
        let stats = if ok_rows.is_empty() {
            None
        } else {
            Some(compute(&ok_rows)?)
        };
        Ok(Self {
            key: dates.to_vec(),
            ok_dates: ok_rows.iter().map(|&i| dates[i]).collect(),
            missing_dates: missing_rows.iter().map(|&i| dates[i]).collect(),
            unit_index,
            stats,
        })
    }

    /// Check that the statistics agree with the declared dates and variables
    pub fn validate(&self, variables: usize) -> Result<()> {
        match &self.stats {
            None if !self.ok_dates.is_empty() => Err(DatasetError::Coverage(format!(
                "record for unit {} lists {} usable dates but has no statistics",
                self.unit_index,
                self.ok_dates.len()
            ))),
            None => Ok(()),
            Some(stats) => {
                stats.check_shape()?;
                if stats.rows() != self.ok_dates.len() || stats.variables() != variables {
                    return Err(DatasetError::ShapeMismatch {
                        what: format!("statistics of unit {}", self.unit_index),
                        expected: vec![self.ok_dates.len(), variables],
                        found: vec![stats.rows(), stats.variables()],
                    });
                }
                Ok(())
            }
        }
    }
}

/// Compute raw statistics of a `(time, variable, ...)` block
///
/// Every field is checked first: NaN is accepted only for variables allowed to have
/// it, a field made only of NaN is always rejected, and configured value ranges apply.
/// All problems of the block are reported together.
pub fn compute_statistics(
    block: &ArrayViewD<'_, f64>,
    variables: &[String],
    check: &ValuesCheck,
) -> Result<PartialStatistics> {
    if block.ndim() < 2 || block.shape()[1] != variables.len() {
        return Err(DatasetError::ShapeMismatch {
            what: "statistics block variables".to_string(),
            expected: vec![block.shape().first().copied().unwrap_or(0), variables.len()],
            found: block.shape().to_vec(),
        });
    }
    let times = block.shape()[0];
    let nvars = variables.len();

    let mut failures = Vec::new();
    for t in 0..times {
        let row = block.index_axis(Axis(0), t);
        for (v, name) in variables.iter().enumerate() {
            let field = row.index_axis(Axis(0), v);
            failures.extend(check.check(field.view(), name, &format!("date index {t}")));
            if !field.is_empty() && field.iter().all(|x| x.is_nan()) {
                failures.push(format!("{name}: all values are NaN (date index {t})"));
            }
        }
    }
    if !failures.is_empty() {
        return Err(DatasetError::DataValues { failures });
    }

    debug!(
        "Reducing {} fields across {} threads",
        times * nvars,
        rayon::current_num_threads()
    );
    let fields = parallel_field_stats(block);

    let shape = (times, nvars);
    Ok(PartialStatistics {
        minimum: column(&fields, shape, |s| s.minimum)?,
        maximum: column(&fields, shape, |s| s.maximum)?,
        sums: column(&fields, shape, |s| s.sum)?,
        squares: column(&fields, shape, |s| s.squares)?,
        count: Array2::from_shape_vec(shape, fields.iter().map(|s| s.count).collect())?,
        has_nans: Array2::from_shape_vec(shape, fields.iter().map(|s| s.has_nans).collect())?,
    })
}

fn column(fields: &[FieldStats], shape: (usize, usize), f: impl Fn(&FieldStats) -> f64) -> Result<Array2<f64>> {
    Ok(Array2::from_shape_vec(shape, fields.iter().map(f).collect())?)
}
