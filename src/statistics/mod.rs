//! Statistics of the built data
//!
//! This module computes per-variable statistics in two stages so that any number of
//! independent workers can contribute.
//!
//! # Organization
//!
//! This module is organized into submodules:
//! - [`operations`]: per-unit reduction into raw partial statistics
//! - [`parallel`]: rayon kernels and NaN-aware folds
//! - [`aggregate`]: merge of partial records with coverage and variance checks
//! - [`summary`]: the final statistics and their export

pub mod aggregate;
pub mod operations;
pub mod parallel;
pub mod summary;

// Re-export the main types and functions for convenience
pub use aggregate::{check_variance, target_dates, StatAggregator, VarianceTolerance};
pub use operations::{compute_statistics, PartialRecord, PartialStatistics, StatField};
pub use summary::Summary;
