//! Contract with the input provider
//!
//! Fetching and decoding source data is not part of this crate. A provider answers
//! [`InputProvider::select`] with a [`Cube`]: the returned dates, the coordinates, and
//! an iterator of cubelets, each the values of one `(date, variable)` pair.

use crate::errors::{DatasetError, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use ndarray::{ArrayD, Axis, Ix4};
use serde_json::Value as JsonValue;

/// Values of one `(date, variable)` pair, shaped `(ensemble, grid)`
#[derive(Debug, Clone, PartialEq)]
pub struct Cubelet {
    /// Position in the cube: `[date index, variable index]`
    pub coords: Vec<usize>,
    pub data: ArrayD<f32>,
}

impl Cubelet {
    pub fn new(coords: Vec<usize>, data: ArrayD<f32>) -> Self {
        Self { coords, data }
    }

    /// Values widened to `f64`
    pub fn to_array(&self) -> ArrayD<f64> {
        self.data.mapv(f64::from)
    }
}

/// Data returned for a set of requested dates
#[derive(Debug, Clone)]
pub struct Cube {
    dates: Vec<NaiveDateTime>,
    /// Set when the fields' validity times differ from `dates`
    valid_datetimes: Option<Vec<NaiveDateTime>>,
    variables: Vec<String>,
    ensembles: usize,
    latitudes: Vec<f64>,
    longitudes: Vec<f64>,
    resolution: Option<String>,
    data_request: JsonValue,
    cubelets: Vec<Cubelet>,
}

impl Cube {
    pub fn new(
        dates: Vec<NaiveDateTime>,
        variables: Vec<String>,
        ensembles: usize,
        latitudes: Vec<f64>,
        longitudes: Vec<f64>,
    ) -> Self {
        Self {
            dates,
            valid_datetimes: None,
            variables,
            ensembles,
            latitudes,
            longitudes,
            resolution: None,
            data_request: JsonValue::Null,
            cubelets: Vec::new(),
        }
    }

    /// Split a `(date, variable, ensemble, grid)` block into cubelets
    pub fn from_block(
        dates: Vec<NaiveDateTime>,
        variables: Vec<String>,
        latitudes: Vec<f64>,
        longitudes: Vec<f64>,
        block: ArrayD<f32>,
    ) -> Result<Self> {
        let block = block.into_dimensionality::<Ix4>()?;
        let (t, v, e, _) = block.dim();
        if t != dates.len() || v != variables.len() {
            return Err(DatasetError::ShapeMismatch {
                what: "cube block".to_string(),
                expected: vec![dates.len(), variables.len()],
                found: vec![t, v],
            });
        }
        let mut cube = Self::new(dates, variables, e, latitudes, longitudes);
        for (ti, by_date) in block.axis_iter(Axis(0)).enumerate() {
            for (vi, field) in by_date.axis_iter(Axis(0)).enumerate() {
                cube.cubelets
                    .push(Cubelet::new(vec![ti, vi], field.to_owned().into_dyn()));
            }
        }
        Ok(cube)
    }

    #[must_use]
    pub fn with_resolution(mut self, resolution: impl Into<String>) -> Self {
        self.resolution = Some(resolution.into());
        self
    }

    /// Validity times read from the fields, one per date
    #[must_use]
    pub fn with_valid_datetimes(mut self, valid: Vec<NaiveDateTime>) -> Self {
        self.valid_datetimes = Some(valid);
        self
    }

    #[must_use]
    pub fn with_data_request(mut self, request: JsonValue) -> Self {
        self.data_request = request;
        self
    }

    pub fn push_cubelet(&mut self, cubelet: Cubelet) {
        self.cubelets.push(cubelet);
    }

    /// Dates the provider answered for
    pub fn dates(&self) -> &[NaiveDateTime] {
        &self.dates
    }

    /// Valid datetimes of the returned fields, in date order
    ///
    /// Falls back to the answered dates when the provider did not report them.
    pub fn valid_datetimes(&self) -> &[NaiveDateTime] {
        self.valid_datetimes.as_deref().unwrap_or(&self.dates)
    }

    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    pub fn ensembles(&self) -> usize {
        self.ensembles
    }

    pub fn latitudes(&self) -> &[f64] {
        &self.latitudes
    }

    pub fn longitudes(&self) -> &[f64] {
        &self.longitudes
    }

    pub fn grid_points(&self) -> usize {
        self.latitudes.len()
    }

    pub fn resolution(&self) -> Option<&str> {
        self.resolution.as_deref()
    }

    /// Parameters needed to reproduce the fetch
    pub fn data_request(&self) -> &JsonValue {
        &self.data_request
    }

    /// `(dates, variables, ensembles, grid points)`
    pub fn extended_user_shape(&self) -> [usize; 4] {
        [self.dates.len(), self.variables.len(), self.ensembles, self.grid_points()]
    }

    pub fn count(&self) -> usize {
        self.cubelets.len()
    }

    pub fn cubelets(&self) -> impl Iterator<Item = &Cubelet> {
        self.cubelets.iter()
    }
}

/// Source of data for a list of dates
#[async_trait]
pub trait InputProvider: Send + Sync {
    async fn select(&self, dates: &[NaiveDateTime]) -> Result<Cube>;
}
