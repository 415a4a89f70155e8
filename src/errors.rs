//! Centralized error handling for dataset construction
//!
//! Every fallible operation in the crate returns [`Result`]. Variants are grouped the
//! way callers need to react to them: contract violations and data-quality failures
//! abort the current unit of work, coverage and consistency failures refuse to publish
//! statistics. Conditions that are safe to skip (already built groups, key collisions
//! in the partial store) are logged and never surface as errors.

use chrono::NaiveDateTime;
use thiserror::Error;

/// Main error type for dataset operations
#[derive(Debug, Error)]
pub enum DatasetError {
    /// I/O operation errors
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON (de)serialization of metadata, attributes or configuration
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Binary (de)serialization of partial records
    #[error("Record encoding error: {0}")]
    EncodingError(#[from] bincode::Error),

    /// Array shape or dimension error
    #[error("Array error: {0}")]
    ArrayError(#[from] ndarray::ShapeError),

    /// Unparseable date string
    #[error("Date parse error: {0}")]
    DateParse(#[from] chrono::ParseError),

    /// Array missing from the store
    #[error("Array '{array}' not found in store")]
    ArrayNotFound { array: String },

    /// Store layout or chunk content is not what the metadata describes
    #[error("Store error: {0}")]
    Store(String),

    /// Configuration is missing a value or holds an invalid one
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Partition specification does not describe a valid subset of units
    #[error("Invalid parts '{parts}': {reason}")]
    InvalidParts { parts: String, reason: String },

    /// Dataset name does not follow the naming convention
    #[error("Invalid dataset name '{name}': {}", .reasons.join("; "))]
    InvalidName { name: String, reasons: Vec<String> },

    /// The completion registry was already created for this dataset
    #[error("Completion registry already exists in {path}")]
    RegistryExists { path: String },

    /// The input provider returned other dates than the ones requested
    #[error("Dates in data are not the requested ones: requested {requested} dates starting {first_requested:?}, got {returned} starting {first_returned:?}")]
    DatesMismatch {
        requested: usize,
        returned: usize,
        first_requested: Option<NaiveDateTime>,
        first_returned: Option<NaiveDateTime>,
    },

    /// Two shapes that must agree do not
    #[error("Shape mismatch for {what}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        what: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    /// Computed date axis does not match the computed array length
    #[error("Final date size {dates} (from {start} to {end}, frequency={frequency}h) does not match data shape {length}")]
    DateCountMismatch {
        dates: usize,
        length: usize,
        start: NaiveDateTime,
        end: NaiveDateTime,
        frequency: i64,
    },

    /// Values failed the per-variable sanity checks
    #[error("Data values check failed: {}", .failures.join("; "))]
    DataValues { failures: Vec<String> },

    /// The partial store holds no records where completed work was expected
    #[error("No data found in {path}")]
    NoData { path: String },

    /// Partial records do not cover the target dates exactly once
    #[error("Coverage error: {0}")]
    Coverage(String),

    /// Variance that is NaN or below zero beyond the configured tolerance
    #[error("Negative or undefined variance for {}", .variables.join(", "))]
    NegativeVariance { variables: Vec<String> },

    /// Recomputed statistics disagree with the ones stored in the dataset
    #[error("Statistics mismatch for '{field}' of variable '{variable}': stored {stored}, computed {computed}")]
    StatisticsMismatch {
        field: String,
        variable: String,
        stored: f64,
        computed: f64,
    },

    /// Statistics cannot be published because some groups are not built yet
    #[error("Dataset {path} is not fully built, not writing statistics into dataset")]
    NotFullyBuilt { path: String },

    /// Thread pool configuration error
    #[error("Thread pool error: {0}")]
    ThreadPoolError(String),
}

impl DatasetError {
    /// Build a [`DatasetError::Store`] from anything printable
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    /// Build a [`DatasetError::InvalidConfig`] from anything printable
    pub fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }
}

/// Result type alias for dataset operations
pub type Result<T> = std::result::Result<T, DatasetError>;
