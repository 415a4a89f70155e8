//! Build configuration
//!
//! The configuration is an immutable value: it is loaded once (from a JSON file, a JSON
//! string, or the copy stored inside an existing dataset) and passed by reference to the
//! build and statistics entry points.

use crate::check::ValuesPolicy;
use crate::data_source::{DataReader, Dtype};
use crate::errors::{DatasetError, Result};
use crate::statistics::VarianceTolerance;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::path::Path;

/// Attribute under which the configuration is stored in the dataset
pub const CONFIG_ATTRIBUTE: &str = "_create_config";

/// Top-level configuration of a dataset build
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoaderConfig {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub licence: String,
    #[serde(default)]
    pub attribution: String,
    /// Name checked against the naming convention, defaults to the store directory stem
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub statistics: StatisticsConfig,
    /// Extra metadata written before the computed metadata
    #[serde(default)]
    pub add_metadata: BTreeMap<String, JsonValue>,
    /// Extra metadata written after the computed metadata, overriding it
    #[serde(default)]
    pub force_metadata: BTreeMap<String, JsonValue>,
}

/// Layout of the `data` array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    #[serde(default = "default_dtype")]
    pub dtype: String,
    #[serde(default)]
    pub chunking: Chunking,
}

/// Chunk sizes along the time and ensemble axes; variables and grid are never split
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Chunking {
    #[serde(default = "default_dates_chunk")]
    pub dates: usize,
    #[serde(default)]
    pub ensembles: Option<usize>,
}

/// How statistics are computed and validated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatisticsConfig {
    /// Variables allowed to contain NaN
    #[serde(default)]
    pub allow_nans: Vec<String>,
    /// First date of the statistics period (`YYYY`, `YYYY-MM`, `YYYY-MM-DD` or datetime)
    #[serde(default)]
    pub start: Option<String>,
    /// Last date of the statistics period
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default = "default_variance_rtol")]
    pub variance_rtol: f64,
    #[serde(default = "default_variance_atol")]
    pub variance_atol: f64,
    /// Inclusive `[min, max]` bounds checked for the named variables
    #[serde(default)]
    pub value_ranges: BTreeMap<String, (f64, f64)>,
    #[serde(default)]
    pub values_policy: ValuesPolicy,
}

fn default_dtype() -> String {
    "float32".to_string()
}

fn default_dates_chunk() -> usize {
    1
}

fn default_variance_rtol() -> f64 {
    VarianceTolerance::default().rtol
}

fn default_variance_atol() -> f64 {
    VarianceTolerance::default().atol
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dtype: default_dtype(),
            chunking: Chunking::default(),
        }
    }
}

impl Default for Chunking {
    fn default() -> Self {
        Self {
            dates: default_dates_chunk(),
            ensembles: None,
        }
    }
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            allow_nans: Vec::new(),
            start: None,
            end: None,
            variance_rtol: default_variance_rtol(),
            variance_atol: default_variance_atol(),
            value_ranges: BTreeMap::new(),
            values_policy: ValuesPolicy::default(),
        }
    }
}

impl LoaderConfig {
    /// Parse and validate a JSON document
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON configuration file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    /// Read the configuration stored in an initialised dataset
    pub async fn from_dataset<S: DataReader>(store: &S) -> Result<Self> {
        let value = store.get_attribute(CONFIG_ATTRIBUTE).await?.ok_or_else(|| {
            DatasetError::config(format!("No {CONFIG_ATTRIBUTE} in {}", store.location()))
        })?;
        let config: Self = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.dtype()?;
        if self.output.chunking.dates == 0 || self.output.chunking.ensembles == Some(0) {
            return Err(DatasetError::config("Chunk sizes must be positive"));
        }
        let stats = &self.statistics;
        if !(stats.variance_rtol >= 0.0 && stats.variance_atol >= 0.0) {
            return Err(DatasetError::config("Variance tolerances must be non-negative"));
        }
        for (name, (lo, hi)) in &stats.value_ranges {
            if lo > hi {
                return Err(DatasetError::config(format!(
                    "Value range for '{name}' has minimum {lo} above maximum {hi}"
                )));
            }
        }
        Ok(())
    }

    pub fn dtype(&self) -> Result<Dtype> {
        match Dtype::from_name(&self.output.dtype) {
            Some(d @ (Dtype::Float32 | Dtype::Float64)) => Ok(d),
            _ => Err(DatasetError::config(format!(
                "Unsupported data dtype '{}', use float32 or float64",
                self.output.dtype
            ))),
        }
    }

    pub fn allow_nan(&self, variable: &str) -> bool {
        self.statistics.allow_nans.iter().any(|v| v == variable)
    }

    pub fn variance_tolerance(&self) -> VarianceTolerance {
        VarianceTolerance {
            rtol: self.statistics.variance_rtol,
            atol: self.statistics.variance_atol,
        }
    }

    /// Configuration as stored in the dataset
    pub fn to_json_value(&self) -> Result<JsonValue> {
        Ok(serde_json::to_value(self)?)
    }
}
