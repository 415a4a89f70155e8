//! Final, dataset-wide statistics

use super::operations::StatField;
use crate::data_source::{DataReader, DataWriter, Dtype};
use crate::errors::{DatasetError, Result};
use crate::utils::atomic_write;
use ndarray::Array1;
use serde_json::{json, Value as JsonValue};
use std::fmt;
use std::path::Path;

/// Per-variable statistics of a whole dataset
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub variables: Vec<String>,
    pub minimum: Array1<f64>,
    pub maximum: Array1<f64>,
    pub mean: Array1<f64>,
    pub stdev: Array1<f64>,
    pub sums: Array1<f64>,
    pub squares: Array1<f64>,
    pub count: Array1<i64>,
    pub has_nans: Array1<bool>,
}

impl Summary {
    /// One field as floating point values, in variable order
    pub fn field(&self, field: StatField) -> Array1<f64> {
        match field {
            StatField::Mean => self.mean.clone(),
            StatField::Stdev => self.stdev.clone(),
            StatField::Minimum => self.minimum.clone(),
            StatField::Maximum => self.maximum.clone(),
            StatField::Sums => self.sums.clone(),
            StatField::Squares => self.squares.clone(),
            StatField::Count => self.count.mapv(|c| c as f64),
            StatField::HasNans => self.has_nans.mapv(|b| if b { 1.0 } else { 0.0 }),
        }
    }

    fn dtype(field: StatField) -> Dtype {
        match field {
            StatField::Count => Dtype::Int64,
            StatField::HasNans => Dtype::UInt8,
            _ => Dtype::Float64,
        }
    }

    fn array_name(prefix: Option<&str>, field: StatField) -> String {
        match prefix {
            Some(p) => format!("{p}_{}", field.as_str()),
            None => field.as_str().to_string(),
        }
    }

    /// Self-describing JSON form, non-finite values written as `null`
    pub fn to_json(&self) -> JsonValue {
        let finite = |v: f64| if v.is_finite() { json!(v) } else { JsonValue::Null };
        let variables: serde_json::Map<String, JsonValue> = self
            .variables
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let entry = json!({
                    "mean": finite(self.mean[i]),
                    "stdev": finite(self.stdev[i]),
                    "minimum": finite(self.minimum[i]),
                    "maximum": finite(self.maximum[i]),
                    "sums": finite(self.sums[i]),
                    "squares": finite(self.squares[i]),
                    "count": self.count[i],
                    "has_nans": self.has_nans[i],
                });
                (name.clone(), entry)
            })
            .collect();
        json!({
            "variables_names": self.variables,
            "statistics": variables,
        })
    }

    /// Parse the form written by [`Summary::to_json`]
    pub fn from_json(value: &JsonValue) -> Result<Self> {
        let invalid = |what: &str| DatasetError::store(format!("Invalid summary document: {what}"));
        let variables: Vec<String> = serde_json::from_value(
            value.get("variables_names").cloned().ok_or_else(|| invalid("no variables_names"))?,
        )?;
        let stats = value.get("statistics").ok_or_else(|| invalid("no statistics"))?;
        let float = |name: &str, field: &str| -> Result<f64> {
            Ok(stats[name][field].as_f64().unwrap_or(f64::NAN))
        };
        let n = variables.len();
        let mut summary = Self {
            variables: variables.clone(),
            minimum: Array1::zeros(n),
            maximum: Array1::zeros(n),
            mean: Array1::zeros(n),
            stdev: Array1::zeros(n),
            sums: Array1::zeros(n),
            squares: Array1::zeros(n),
            count: Array1::zeros(n),
            has_nans: Array1::from_elem(n, false),
        };
        for (i, name) in variables.iter().enumerate() {
            if stats.get(name).is_none() {
                return Err(invalid(&format!("no entry for {name}")));
            }
            summary.minimum[i] = float(name, "minimum")?;
            summary.maximum[i] = float(name, "maximum")?;
            summary.mean[i] = float(name, "mean")?;
            summary.stdev[i] = float(name, "stdev")?;
            summary.sums[i] = float(name, "sums")?;
            summary.squares[i] = float(name, "squares")?;
            summary.count[i] = stats[name]["count"].as_i64().ok_or_else(|| invalid("count"))?;
            summary.has_nans[i] = stats[name]["has_nans"].as_bool().unwrap_or(false);
        }
        Ok(summary)
    }

    /// Write the JSON form to a file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = serde_json::to_string_pretty(&self.to_json())?;
        atomic_write(path.as_ref(), text.as_bytes())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let value: JsonValue = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        Self::from_json(&value)
    }

    /// Store the eight fields as arrays, named `<prefix>_<field>` when a prefix is given
    pub async fn write_to_store<S: DataWriter>(&self, store: &S, prefix: Option<&str>) -> Result<()> {
        for field in StatField::ALL {
            let values = self.field(field).into_dyn();
            store
                .write_array(&Self::array_name(prefix, field), values.view(), Self::dtype(field))
                .await?;
        }
        Ok(())
    }

    /// Read fields written by [`Summary::write_to_store`], `None` when absent
    pub async fn read_from_store<S: DataReader>(store: &S, prefix: Option<&str>, variables: &[String]) -> Result<Option<Self>> {
        for field in StatField::ALL {
            if !store.has_array(&Self::array_name(prefix, field)).await {
                return Ok(None);
            }
        }
        let mut read = Vec::with_capacity(StatField::ALL.len());
        for field in StatField::ALL {
            let values = store.read_array(&Self::array_name(prefix, field)).await?;
            let values = values.into_dimensionality::<ndarray::Ix1>()?;
            if values.len() != variables.len() {
                return Err(DatasetError::ShapeMismatch {
                    what: format!("stored statistics '{}'", field.as_str()),
                    expected: vec![variables.len()],
                    found: vec![values.len()],
                });
            }
            read.push(values);
        }
        let mut it = read.into_iter();
        let mut next = || it.next().unwrap_or_else(|| Array1::zeros(variables.len()));
        let (mean, stdev, minimum, maximum) = (next(), next(), next(), next());
        let (sums, squares, count, has_nans) = (next(), next(), next(), next());
        Ok(Some(Self {
            variables: variables.to_vec(),
            minimum,
            maximum,
            mean,
            stdev,
            sums,
            squares,
            count: count.mapv(|c| c as i64),
            has_nans: has_nans.mapv(|b| b != 0.0),
        }))
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:>12} {:>14} {:>14} {:>14} {:>14} {:>10} {:>8}",
            "variable", "mean", "stdev", "minimum", "maximum", "count", "has_nans"
        )?;
        for (i, name) in self.variables.iter().enumerate() {
            writeln!(
                f,
                "{:>12} {:>14.6e} {:>14.6e} {:>14.6e} {:>14.6e} {:>10} {:>8}",
                name,
                self.mean[i],
                self.stdev[i],
                self.minimum[i],
                self.maximum[i],
                self.count[i],
                self.has_nans[i]
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zarr_io::ZarrStore;
    use ndarray::arr1;
    use tempfile::tempdir;

    fn sample() -> Summary {
        Summary {
            variables: vec!["2t".to_string(), "sst".to_string()],
            minimum: arr1(&[250.0, 271.0]),
            maximum: arr1(&[310.0, 305.0]),
            mean: arr1(&[280.5, 288.25]),
            stdev: arr1(&[10.0, f64::NAN]),
            sums: arr1(&[561.0, 576.5]),
            squares: arr1(&[157_560.25, 166_176.125]),
            count: arr1(&[2, 2]),
            has_nans: arr1(&[false, true]),
        }
    }

    #[test]
    fn json_file_round_trip_keeps_non_finite_as_null() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stats.json");
        let summary = sample();
        summary.save(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("null"));
        let back = Summary::load(&path).unwrap();
        assert_eq!(back.mean, summary.mean);
        assert!(back.stdev[1].is_nan());
        assert_eq!(back.has_nans, summary.has_nans);
    }

    #[tokio::test]
    async fn store_round_trip_with_prefix() {
        let dir = tempdir().unwrap();
        let store = ZarrStore::new(dir.path().join("ds.zarr"));
        store.create().await.unwrap();
        let summary = sample();
        let vars = summary.variables.clone();

        assert!(Summary::read_from_store(&store, None, &vars).await.unwrap().is_none());
        summary.write_to_store(&store, Some("statistics")).await.unwrap();
        assert!(store.has_array("statistics_mean").await);

        let back = Summary::read_from_store(&store, Some("statistics"), &vars)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(back.count, summary.count);
        assert_eq!(back.minimum, summary.minimum);
        assert_eq!(back.has_nans, summary.has_nans);
    }

    #[test]
    fn display_lists_every_variable() {
        let text = sample().to_string();
        assert!(text.contains("2t"));
        assert!(text.contains("sst"));
    }
}
