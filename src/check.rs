//! Sanity checks on values and on the dataset name

use crate::errors::{DatasetError, Result};
use chrono::{Datelike, NaiveDateTime};
use ndarray::ArrayViewD;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// What to do when staged values fail a check
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValuesPolicy {
    /// Abort the unit on the first failure
    #[default]
    Fail,
    /// Check the whole unit, log every failure, then abort it
    Collect,
}

/// Bounds that hold for some variables whatever the configuration says
fn builtin_range(name: &str) -> Option<(f64, f64)> {
    match name {
        "cos_latitude" | "sin_latitude" | "cos_longitude" | "sin_longitude" => Some((-1.0, 1.0)),
        _ => None,
    }
}

/// Per-variable rules applied to every staged field
#[derive(Debug, Clone, Default)]
pub struct ValuesCheck {
    allow_nans: Vec<String>,
    ranges: BTreeMap<String, (f64, f64)>,
}

impl ValuesCheck {
    pub fn new(allow_nans: Vec<String>, ranges: BTreeMap<String, (f64, f64)>) -> Self {
        Self { allow_nans, ranges }
    }

    pub fn allow_nan(&self, name: &str) -> bool {
        self.allow_nans.iter().any(|n| n == name)
    }

    /// Problems found in `values` of variable `name`, empty when the field is fine
    ///
    /// `context` is appended to every message to locate the field.
    pub fn check(&self, values: ArrayViewD<'_, f64>, name: &str, context: &str) -> Vec<String> {
        let mut failures = Vec::new();
        let allow_nan = self.allow_nan(name);

        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut nans = 0usize;
        let mut infinite = 0usize;
        for &v in values.iter() {
            if v.is_nan() {
                nans += 1;
            } else if v.is_infinite() {
                infinite += 1;
            } else {
                min = min.min(v);
                max = max.max(v);
            }
        }

        if nans > 0 && !allow_nan {
            failures.push(format!("{name}: {nans} NaN values not allowed ({context})"));
        }
        if infinite > 0 {
            failures.push(format!("{name}: {infinite} infinite values ({context})"));
        }
        if min == 9999.0 || max == 9999.0 {
            warn!("Value 9999 found in {name} (min={min}, max={max}), possibly a fill value ({context})");
        }

        let range = self.ranges.get(name).copied().or_else(|| builtin_range(name));
        if let Some((lo, hi)) = range {
            if min < lo || max > hi {
                failures.push(format!(
                    "{name}: values in [{min}, {max}] outside allowed range [{lo}, {hi}] ({context})"
                ));
            }
        }
        failures
    }
}

/// Dataset name parsed against `purpose-labelling-source-resolution-YYYY-YYYY-Nh-vN[-extra]`
#[derive(Debug, Clone)]
pub struct DatasetName {
    name: String,
    parsed: Option<BTreeMap<&'static str, String>>,
    messages: Vec<String>,
}

impl DatasetName {
    pub fn new(
        name: &str,
        resolution: Option<&str>,
        start_date: Option<NaiveDateTime>,
        end_date: Option<NaiveDateTime>,
        frequency: Option<i64>,
    ) -> Self {
        let mut this = Self {
            name: name.to_string(),
            parsed: Self::parse(name),
            messages: Vec::new(),
        };
        if this.parsed.is_none() {
            this.messages.push(format!(
                "the dataset name '{name}' does not follow the naming convention \
                 purpose-labelling-source-resolution-YYYY-YYYY-Nh-vN"
            ));
        }
        if name.chars().any(|c| c.is_ascii_uppercase()) {
            this.messages.push(format!("the dataset name '{name}' must be lowercase"));
        }
        if let Some(resolution) = resolution {
            this.check("resolution", resolution.replace('.', "p").to_lowercase());
        }
        if let Some(frequency) = frequency {
            this.check("frequency", format!("{frequency}h"));
        }
        if let Some(start) = start_date {
            this.check("start_date", start.year().to_string());
        }
        if let Some(end) = end_date {
            this.check("end_date", end.year().to_string());
        }
        this
    }

    fn parse(name: &str) -> Option<BTreeMap<&'static str, String>> {
        let tokens: Vec<&str> = name.split('-').collect();
        if tokens
            .iter()
            .any(|t| t.is_empty() || !t.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'))
        {
            return None;
        }
        let is_year = |t: &str| t.len() == 4 && t.chars().all(|c| c.is_ascii_digit());
        let is_frequency = |t: &str| {
            t.strip_suffix('h')
                .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
        };
        let is_version = |t: &str| {
            t.strip_prefix('v')
                .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
        };
        let p = (6..tokens.len().saturating_sub(1)).find(|&p| {
            is_frequency(tokens[p]) && is_version(tokens[p + 1]) && is_year(tokens[p - 1]) && is_year(tokens[p - 2])
        })?;

        let mut parsed = BTreeMap::new();
        parsed.insert("purpose", tokens[0].to_string());
        parsed.insert("labelling", tokens[1..p - 4].join("-"));
        parsed.insert("source", tokens[p - 4].to_string());
        parsed.insert("resolution", tokens[p - 3].to_string());
        parsed.insert("start_date", tokens[p - 2].to_string());
        parsed.insert("end_date", tokens[p - 1].to_string());
        parsed.insert("frequency", tokens[p].to_string());
        parsed.insert("version", tokens[p + 1][1..].to_string());
        if p + 2 < tokens.len() {
            parsed.insert("additional", tokens[p + 2..].join("-"));
        }
        Some(parsed)
    }

    fn check(&mut self, key: &'static str, value: String) {
        if !self.name.contains(&value) {
            self.messages
                .push(format!("the {key} is {value}, but is missing in {}", self.name));
        }
        if let Some(found) = self.parsed.as_ref().and_then(|p| p.get(key)) {
            if *found != value {
                self.messages
                    .push(format!("the {key} is {value}, but is {found} in {}", self.name));
            }
        }
    }

    pub fn parsed(&self, key: &str) -> Option<&str> {
        self.parsed.as_ref()?.get(key).map(String::as_str)
    }

    pub fn is_valid(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn raise_if_not_valid(&self) -> Result<()> {
        if self.is_valid() {
            return Ok(());
        }
        for message in &self.messages {
            warn!("❗ {message}");
        }
        Err(DatasetError::InvalidName {
            name: self.name.clone(),
            reasons: self.messages.clone(),
        })
    }
}
