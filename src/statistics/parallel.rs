//! Parallel reduction kernels
//!
//! Each field (one time step of one variable) is reduced sequentially in `f64`, so the
//! result for a field never depends on how many threads ran. Fields are spread across
//! the rayon pool.

use ndarray::{ArrayViewD, Axis};
use rayon::prelude::*;

/// Reduction of one field
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldStats {
    pub minimum: f64,
    pub maximum: f64,
    pub sum: f64,
    pub squares: f64,
    /// Number of non-NaN values
    pub count: i64,
    pub has_nans: bool,
}

impl FieldStats {
    /// Reduce the values of one field, skipping NaN
    ///
    /// `minimum` and `maximum` are NaN when no value is finite.
    pub fn of<'a>(values: impl IntoIterator<Item = &'a f64>) -> Self {
        let mut minimum = f64::INFINITY;
        let mut maximum = f64::NEG_INFINITY;
        let mut sum = 0.0_f64;
        let mut squares = 0.0_f64;
        let mut count = 0_i64;
        let mut has_nans = false;
        for &v in values {
            if v.is_nan() {
                has_nans = true;
                continue;
            }
            minimum = minimum.min(v);
            maximum = maximum.max(v);
            sum += v;
            squares += v * v;
            count += 1;
        }
        if count == 0 {
            minimum = f64::NAN;
            maximum = f64::NAN;
        }
        Self {
            minimum,
            maximum,
            sum,
            squares,
            count,
            has_nans,
        }
    }
}

/// Reduce every `(time, variable)` field of a `(time, variable, ...)` block
///
/// Returns the fields in row-major order: all variables of time 0, then time 1, ...
pub fn parallel_field_stats(block: &ArrayViewD<'_, f64>) -> Vec<FieldStats> {
    let (times, variables) = (block.shape()[0], block.shape()[1]);
    (0..times * variables)
        .into_par_iter()
        .map(|flat| {
            let (t, v) = (flat / variables, flat % variables);
            let field = block.index_axis(Axis(0), t);
            let field = field.index_axis(Axis(0), v);
            FieldStats::of(field.iter())
        })
        .collect()
}

/// NaN-skipping minimum of a sequence, NaN when every value is NaN
pub fn nan_min(values: impl IntoIterator<Item = f64>) -> f64 {
    values
        .into_iter()
        .filter(|v| !v.is_nan())
        .fold(f64::NAN, |acc, v| if acc.is_nan() || v < acc { v } else { acc })
}

/// NaN-skipping maximum of a sequence, NaN when every value is NaN
pub fn nan_max(values: impl IntoIterator<Item = f64>) -> f64 {
    values
        .into_iter()
        .filter(|v| !v.is_nan())
        .fold(f64::NAN, |acc, v| if acc.is_nan() || v > acc { v } else { acc })
}

/// NaN-skipping sum of a sequence, in iteration order
pub fn nan_sum(values: impl IntoIterator<Item = f64>) -> f64 {
    values.into_iter().filter(|v| !v.is_nan()).sum()
}
