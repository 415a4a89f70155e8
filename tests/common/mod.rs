//! Shared fixtures: a deterministic input provider and build helpers
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration, NaiveDateTime};
use dataset_builder::dates::parse_iso;
use dataset_builder::prelude::*;
use ndarray::Array4;
use std::collections::BTreeMap;
use std::path::Path;

pub const FREQUENCY: i64 = 6;

pub fn dates(start: &str, n: usize) -> Vec<NaiveDateTime> {
    let start = parse_iso(start).unwrap();
    (0..n).map(|i| start + Duration::hours(FREQUENCY * i as i64)).collect()
}

/// Provider answering any dates with values computed from the date and position
#[derive(Debug, Clone)]
pub struct SyntheticInput {
    pub variables: Vec<String>,
    pub ensembles: usize,
    pub grid: usize,
    /// Dates answered with NaN everywhere
    pub missing: Vec<NaiveDateTime>,
    /// Shift applied to the returned dates, to simulate a misbehaving provider
    pub shift: Option<Duration>,
    /// Shift applied to the reported validity times only
    pub valid_shift: Option<Duration>,
}

impl SyntheticInput {
    pub fn new() -> Self {
        Self {
            variables: vec!["a".to_string(), "b".to_string()],
            ensembles: 2,
            grid: 3,
            missing: Vec::new(),
            shift: None,
            valid_shift: None,
        }
    }

    /// Values are multiples of 0.25, exact in float32
    pub fn value(&self, date: &NaiveDateTime, v: usize, e: usize, g: usize) -> f32 {
        if self.missing.contains(date) {
            return f32::NAN;
        }
        let step = date.and_utc().timestamp() / (FREQUENCY * 3600);
        (step % 7) as f32 + 10.0 * v as f32 + 0.25 * e as f32 + 0.5 * g as f32
    }
}

#[async_trait]
impl InputProvider for SyntheticInput {
    async fn select(&self, dates: &[NaiveDateTime]) -> Result<Cube> {
        let block = Array4::from_shape_fn(
            (dates.len(), self.variables.len(), self.ensembles, self.grid),
            |(t, v, e, g)| self.value(&dates[t], v, e, g),
        );
        let returned = match self.shift {
            Some(shift) => dates.iter().map(|d| *d + shift).collect(),
            None => dates.to_vec(),
        };
        let latitudes = (0..self.grid).map(|g| g as f64).collect();
        let longitudes = (0..self.grid).map(|g| 2.0 * g as f64).collect();
        let cube = Cube::from_block(returned, self.variables.clone(), latitudes, longitudes, block.into_dyn())?
            .with_resolution("o96");
        Ok(match self.valid_shift {
            Some(shift) => cube.with_valid_datetimes(dates.iter().map(|d| *d + shift).collect()),
            None => cube,
        })
    }
}

pub fn dataset_path(dir: &Path, name: &str) -> String {
    dir.join(name).to_str().unwrap().to_string()
}

/// Eight 6-hourly dates in groups of three
pub fn groups() -> Groups {
    Groups::from_dates(dates("2020-01-01", 8), 3, Vec::new(), FREQUENCY).unwrap()
}

pub async fn initialise(
    path: &str,
    config: &LoaderConfig,
    groups: &Groups,
    input: &SyntheticInput,
) -> BuildSession<ZarrStore> {
    let mut session = BuildSession::open(path).unwrap();
    DatasetInitialiser::new(config, groups, input)
        .initialise(&mut session, false)
        .await
        .unwrap();
    session
}

/// Chunk files of an array, by name, skipping its metadata
pub fn chunk_files(path: &str, array: &str) -> BTreeMap<String, Vec<u8>> {
    std::fs::read_dir(Path::new(path).join(array))
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter_map(|file| {
            let name = file.file_name()?.to_str()?.to_string();
            let chunk = !name.starts_with('.') && !name.contains(".tmp-");
            chunk.then(|| (name, std::fs::read(&file).unwrap()))
        })
        .collect()
}

/// Initialise then load every listed part, in order, each with a fresh session
pub async fn build(
    path: &str,
    config: &LoaderConfig,
    groups: &Groups,
    input: &SyntheticInput,
    parts: &[&str],
) -> BuildSession<ZarrStore> {
    initialise(path, config, groups, input).await;
    for part in parts {
        let mut session = BuildSession::open(path).unwrap();
        ContentLoader::new(config, groups, input, part.parse().unwrap())
            .load(&mut session)
            .await
            .unwrap();
    }
    BuildSession::open(path).unwrap()
}
