//! Build driver and statistics passes
//!
//! Every entry point takes the immutable [`LoaderConfig`] by reference and the mutable
//! [`BuildSession`] (array store, completion registry and partial store) explicitly.
//! Workers share nothing but the filesystem, so each entry point re-reads what it
//! needs from the store.

use crate::check::{DatasetName, ValuesCheck, ValuesPolicy};
use crate::chunks::{Parts, PartitionFilter};
use crate::config::{LoaderConfig, CONFIG_ATTRIBUTE};
use crate::data_source::{stream_rows, ArrayMetadata, DataReader, Dtype, FullDataSource};
use crate::dates::{
    as_first_date, as_last_date, default_statistics_dates, from_epoch_seconds, normalize_and_check_dates,
    parse_iso, to_epoch_seconds, to_iso, DateBound, Groups,
};
use crate::errors::{DatasetError, Result};
use crate::input::InputProvider;
use crate::persistent::PartialStore;
use crate::registry::CompletionRegistry;
use crate::statistics::{
    compute_statistics, target_dates, PartialRecord, StatAggregator, StatField, Summary, VarianceTolerance,
};
use crate::writer::CacheBuffer;
use crate::zarr_io::ZarrStore;
use chrono::NaiveDateTime;
use futures::StreamExt;
use ndarray::{Array1, Axis};
use serde::de::DeserializeOwned;
use serde_json::{json, Value as JsonValue};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Format version written in the dataset metadata
pub const VERSION: &str = "0.20";

/// Directory holding temporary build data next to a dataset
pub fn tmp_data_dir(path: &str) -> PathBuf {
    PathBuf::from(format!("{}.tmp_data", path.trim_end_matches('/')))
}

/// Handles shared by every phase of a build
#[derive(Debug)]
pub struct BuildSession<S: FullDataSource> {
    pub store: S,
    pub registry: CompletionRegistry<S>,
    pub statistics: PartialStore,
}

impl<S: FullDataSource> BuildSession<S> {
    pub fn new(store: S, statistics_dir: impl Into<PathBuf>) -> Self {
        Self {
            registry: CompletionRegistry::new(store.clone()),
            statistics: PartialStore::new(statistics_dir),
            store,
        }
    }
}

impl BuildSession<ZarrStore> {
    /// Session for a dataset on the local filesystem, partial records in `<path>.tmp_data/statistics`
    pub fn open(path: &str) -> Result<Self> {
        let store = ZarrStore::from_path_str(path)?;
        Ok(Self::new(store, tmp_data_dir(path).join("statistics")))
    }
}

/// Where a build stands, derived from the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Uninitialized,
    Initialized,
    Loading,
    Loaded,
}

pub async fn build_state<S: FullDataSource>(session: &mut BuildSession<S>) -> Result<BuildState> {
    if !session.registry.exists().await {
        return Ok(BuildState::Uninitialized);
    }
    if session.registry.ready(true).await? {
        return Ok(BuildState::Loaded);
    }
    if session.registry.has_event("loading_data_start").await? {
        Ok(BuildState::Loading)
    } else {
        Ok(BuildState::Initialized)
    }
}

/// Metadata of an initialised dataset, as stored
#[derive(Debug, Clone)]
pub struct DatasetMetadata {
    pub shape: Vec<usize>,
    pub variables: Vec<String>,
    pub dates: Vec<NaiveDateTime>,
    pub missing_dates: Vec<NaiveDateTime>,
    pub statistics_start: Option<NaiveDateTime>,
    pub statistics_end: Option<NaiveDateTime>,
    pub variables_with_nans: Option<Vec<String>>,
}

fn attribute<T: DeserializeOwned>(attrs: &BTreeMap<String, JsonValue>, key: &str) -> Result<Option<T>> {
    match attrs.get(key) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
    }
}

fn optional_date(attrs: &BTreeMap<String, JsonValue>, key: &str) -> Result<Option<NaiveDateTime>> {
    attribute::<String>(attrs, key)?.map(|s| parse_iso(&s)).transpose()
}

impl DatasetMetadata {
    pub async fn read<S: DataReader>(store: &S) -> Result<Self> {
        let attrs = store.attributes("").await?;
        let variables: Vec<String> = attribute(&attrs, "variables")?
            .ok_or_else(|| DatasetError::store(format!("No 'variables' attribute in {}", store.location())))?;
        let shape = store.get_metadata("data").await?.shape;
        let dates = store
            .read_array("dates")
            .await?
            .iter()
            .map(|&s| from_epoch_seconds(s as i64))
            .collect::<Result<Vec<_>>>()?;
        let missing_dates = attribute::<Vec<String>>(&attrs, "missing_dates")?
            .unwrap_or_default()
            .iter()
            .map(|s| parse_iso(s))
            .collect::<Result<Vec<_>>>()?;

        if shape.len() < 2 || shape[0] != dates.len() || shape[1] != variables.len() {
            return Err(DatasetError::ShapeMismatch {
                what: "data array against dates and variables".to_string(),
                expected: vec![dates.len(), variables.len()],
                found: shape,
            });
        }
        Ok(Self {
            variables,
            dates,
            missing_dates,
            statistics_start: optional_date(&attrs, "statistics_start_date")?,
            statistics_end: optional_date(&attrs, "statistics_end_date")?,
            variables_with_nans: attribute(&attrs, "variables_with_nans")?,
            shape,
        })
    }

    /// NaN policy recorded at initialisation; every variable may have NaN when unknown
    pub fn values_check(&self, location: &str) -> ValuesCheck {
        match &self.variables_with_nans {
            Some(names) => ValuesCheck::new(names.clone(), BTreeMap::new()),
            None => {
                warn!("Cannot find 'variables_with_nans' in {location}, assuming NaN allowed for every variable");
                ValuesCheck::new(self.variables.clone(), BTreeMap::new())
            }
        }
    }
}

/// Variance tolerance from the stored configuration, or the default
async fn dataset_tolerance<S: DataReader>(store: &S) -> VarianceTolerance {
    match LoaderConfig::from_dataset(store).await {
        Ok(config) => config.variance_tolerance(),
        Err(e) => {
            debug!("Using default variance tolerance: {e}");
            VarianceTolerance::default()
        }
    }
}

/// Creates an empty dataset from a sample of the input
pub struct DatasetInitialiser<'a, I: InputProvider> {
    config: &'a LoaderConfig,
    groups: &'a Groups,
    input: &'a I,
}

impl<'a, I: InputProvider> DatasetInitialiser<'a, I> {
    pub fn new(config: &'a LoaderConfig, groups: &'a Groups, input: &'a I) -> Self {
        Self { config, groups, input }
    }

    /// Create the arrays, metadata, registry and an empty partial store
    ///
    /// Anything already at the store location is replaced.
    pub async fn initialise<S: FullDataSource>(&self, session: &mut BuildSession<S>, check_name: bool) -> Result<()> {
        let config = self.config;
        config.validate()?;
        let dates = self.groups.dates();
        let (first, last) = match (dates.first(), dates.last()) {
            (Some(f), Some(l)) => (*f, *l),
            _ => return Err(DatasetError::config("No dates to build")),
        };
        let frequency = self.groups.frequency();
        let lengths = self.groups.lengths();
        info!(
            "Found {} datetimes in {} groups ({}), {} missing",
            dates.len(),
            self.groups.len(),
            lengths.iter().map(usize::to_string).collect::<Vec<_>>().join("+"),
            self.groups.missing().len()
        );

        let sample = self.input.select(&[first]).await?;
        let variables = sample.variables().to_vec();
        let ensembles = sample.ensembles();
        let grid = sample.grid_points();
        if variables.is_empty() || ensembles == 0 || grid == 0 {
            return Err(DatasetError::config(format!(
                "Input has {} variables, {ensembles} ensembles and {grid} grid points",
                variables.len()
            )));
        }
        if sample.longitudes().len() != grid {
            return Err(DatasetError::ShapeMismatch {
                what: "longitudes against latitudes".to_string(),
                expected: vec![grid],
                found: vec![sample.longitudes().len()],
            });
        }
        let sample_shape = sample.extended_user_shape();
        if sample_shape[0] != 1 {
            return Err(DatasetError::ShapeMismatch {
                what: "sample dates".to_string(),
                expected: vec![1],
                found: vec![sample_shape[0]],
            });
        }
        info!("Found {} variables: {}", variables.len(), variables.join(","));
        info!("Found {ensembles} ensembles, {grid} grid points, resolution {:?}", sample.resolution());

        let total_shape = vec![dates.len(), variables.len(), ensembles, grid];
        let chunking = &config.output.chunking;
        let chunks = vec![
            chunking.dates,
            variables.len(),
            chunking.ensembles.unwrap_or(ensembles),
            grid,
        ];
        // A date chunk written by two groups would be rewritten concurrently
        if chunking.dates > 1 {
            let offsets = self.groups.offsets();
            if let Some(i) = offsets.iter().position(|row| row % chunking.dates != 0) {
                return Err(DatasetError::config(format!(
                    "Group {i} starts at row {}, which is not a multiple of the date chunking {}",
                    offsets[i], chunking.dates
                )));
            }
        }
        let dtype = config.dtype()?;

        if check_name {
            let name = match &config.name {
                Some(name) => name.clone(),
                None => Path::new(&session.store.location())
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_default(),
            };
            DatasetName::new(&name, sample.resolution(), Some(first), Some(last), Some(frequency))
                .raise_if_not_valid()?;
        }
        normalize_and_check_dates(&dates, first, last, frequency, total_shape[0])?;

        let mut metadata: BTreeMap<String, JsonValue> = config.add_metadata.clone();
        metadata.insert("uuid".to_string(), json!(uuid::Uuid::new_v4().to_string()));
        metadata.insert(CONFIG_ATTRIBUTE.to_string(), config.to_json_value()?);
        metadata.insert("description".to_string(), json!(config.description));
        metadata.insert("version".to_string(), json!(VERSION));
        metadata.insert("data_request".to_string(), sample.data_request().clone());
        metadata.insert("ensemble_dimension".to_string(), json!(ensembles));
        metadata.insert("variables".to_string(), json!(variables));
        metadata.insert("variables_with_nans".to_string(), json!(config.statistics.allow_nans));
        metadata.insert("resolution".to_string(), json!(sample.resolution()));
        metadata.insert("licence".to_string(), json!(config.licence));
        metadata.insert("attribution".to_string(), json!(config.attribution));
        metadata.insert("frequency".to_string(), json!(frequency));
        metadata.insert("start_date".to_string(), json!(to_iso(&first)));
        metadata.insert("end_date".to_string(), json!(to_iso(&last)));
        metadata.insert(
            "missing_dates".to_string(),
            json!(self.groups.missing().iter().map(to_iso).collect::<Vec<_>>()),
        );
        metadata.extend(config.force_metadata.clone());

        info!(
            "Creating dataset {} with shape {total_shape:?}, chunks {chunks:?} and dtype {dtype:?}",
            session.store.location()
        );
        if session.store.exists().await {
            warn!("Replacing existing dataset at {}", session.store.location());
        }
        let store = &session.store;
        store.create().await?;
        store.update_attributes("", metadata).await?;
        store
            .create_array("data", ArrayMetadata::new(total_shape, chunks, dtype), false)
            .await?;
        let epochs = Array1::from_iter(dates.iter().map(|d| to_epoch_seconds(d) as f64)).into_dyn();
        store.write_array("dates", epochs.view(), Dtype::Int64).await?;
        let latitudes = Array1::from_vec(sample.latitudes().to_vec()).into_dyn();
        store.write_array("latitudes", latitudes.view(), Dtype::Float64).await?;
        let longitudes = Array1::from_vec(sample.longitudes().to_vec()).into_dyn();
        store.write_array("longitudes", longitudes.view(), Dtype::Float64).await?;

        session.registry = CompletionRegistry::new(store.clone());
        session.registry.create(&lengths).await?;
        session.statistics.delete()?;
        session.statistics.create(false)?;
        session
            .registry
            .add_to_history(
                "tmp_statistics_initialised",
                json!({"version": session.statistics.version()}),
            )
            .await?;

        let (statistics_start, statistics_end) = self.statistics_dates(&dates)?;
        let mut bounds = BTreeMap::new();
        bounds.insert("statistics_start_date".to_string(), json!(to_iso(&statistics_start)));
        bounds.insert("statistics_end_date".to_string(), json!(to_iso(&statistics_end)));
        session.store.update_attributes("", bounds).await?;
        info!(
            "Will compute statistics from {} to {}",
            to_iso(&statistics_start),
            to_iso(&statistics_end)
        );

        session.registry.add_to_history("init_finished", JsonValue::Null).await?;
        Ok(())
    }

    /// Statistics period: configured bounds, or the default for the date axis
    fn statistics_dates(&self, dates: &[NaiveDateTime]) -> Result<(NaiveDateTime, NaiveDateTime)> {
        let (default_start, default_end) =
            default_statistics_dates(dates).ok_or_else(|| DatasetError::config("No dates for statistics"))?;
        let stats = &self.config.statistics;
        let start = match &stats.start {
            Some(s) => DateBound::parse(s)?,
            None => DateBound::parse(&to_iso(&default_start))?,
        };
        let end = match &stats.end {
            Some(s) => DateBound::parse(s)?,
            None => DateBound::parse(&to_iso(&default_end))?,
        };
        Ok((as_first_date(&start, dates)?, as_last_date(&end, dates)?))
    }
}

/// Units a worker built or skipped
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub built: Vec<usize>,
    pub skipped: Vec<usize>,
}

/// Fills the groups owned by one worker
pub struct ContentLoader<'a, I: InputProvider> {
    config: &'a LoaderConfig,
    groups: &'a Groups,
    input: &'a I,
    parts: Parts,
}

impl<'a, I: InputProvider> ContentLoader<'a, I> {
    pub fn new(config: &'a LoaderConfig, groups: &'a Groups, input: &'a I, parts: Parts) -> Self {
        Self {
            config,
            groups,
            input,
            parts,
        }
    }

    /// Build every owned group not flagged yet
    pub async fn load<S: FullDataSource>(&self, session: &mut BuildSession<S>) -> Result<LoadReport> {
        let meta = DatasetMetadata::read(&session.store).await?;
        let lengths = session.registry.get_lengths().await?;
        if lengths != self.groups.lengths() {
            return Err(DatasetError::ShapeMismatch {
                what: "group lengths against registry".to_string(),
                expected: lengths,
                found: self.groups.lengths(),
            });
        }
        let total = session.registry.get_flags(true).await?.len();
        let filter = PartitionFilter::new(&self.parts, total)?;
        let check = ValuesCheck::new(
            self.config.statistics.allow_nans.clone(),
            self.config.statistics.value_ranges.clone(),
        );
        let rows: HashMap<NaiveDateTime, usize> = meta.dates.iter().enumerate().map(|(i, d)| (*d, i)).collect();
        let missing: HashSet<NaiveDateTime> = meta.missing_dates.iter().copied().collect();

        session
            .registry
            .add_to_history("loading_data_start", json!({"parts": self.parts.to_string()}))
            .await?;

        let mut report = LoadReport::default();
        for (igroup, group) in self.groups.iter().enumerate() {
            if !filter.contains(igroup) {
                continue;
            }
            if session.registry.get_flag(igroup).await? {
                info!(" -> Skipping {igroup} total={total} (already done)");
                report.skipped.push(igroup);
                continue;
            }
            info!("Building data for group {igroup}/{total}");
            self.load_group(session, &meta, &check, &rows, &missing, igroup, group)
                .await?;
            session.registry.set_flag(igroup).await?;
            report.built.push(igroup);
        }

        session
            .registry
            .add_to_history("loading_data_end", json!({"parts": self.parts.to_string()}))
            .await?;
        session.registry.add_provenance("provenance_load").await?;
        session
            .statistics
            .add_provenance("provenance_load", json!({"config": self.config.to_json_value()?}))?;
        info!(
            "Loaded {} groups, skipped {} (data shape {:?})",
            report.built.len(),
            report.skipped.len(),
            meta.shape
        );
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    async fn load_group<S: FullDataSource>(
        &self,
        session: &mut BuildSession<S>,
        meta: &DatasetMetadata,
        check: &ValuesCheck,
        rows: &HashMap<NaiveDateTime, usize>,
        missing: &HashSet<NaiveDateTime>,
        igroup: usize,
        group: &[NaiveDateTime],
    ) -> Result<()> {
        let start = Instant::now();
        let cube = self.input.select(group).await?;
        for returned in [cube.dates(), cube.valid_datetimes()] {
            if returned != group {
                return Err(DatasetError::DatesMismatch {
                    requested: group.len(),
                    returned: returned.len(),
                    first_requested: group.first().copied(),
                    first_returned: returned.first().copied(),
                });
            }
        }
        let shape = cube.extended_user_shape();
        if shape[0] != group.len() || shape[1..] != meta.shape[1..] {
            return Err(DatasetError::ShapeMismatch {
                what: format!("data of group {igroup}"),
                expected: [&[group.len()][..], &meta.shape[1..]].concat(),
                found: shape.to_vec(),
            });
        }
        let indexes = group
            .iter()
            .map(|d| {
                rows.get(d)
                    .copied()
                    .ok_or_else(|| DatasetError::store(format!("Date {} is not in the dataset", to_iso(d))))
            })
            .collect::<Result<Vec<_>>>()?;
        debug!("Loading shape {shape:?} into rows {indexes:?}");

        let mut buffer = CacheBuffer::new(&shape, indexes)?;
        let mut failures = Vec::new();
        for (i, cubelet) in cube.cubelets().enumerate() {
            let (t, v) = match cubelet.coords.as_slice() {
                [t, v, ..] if *t < group.len() && *v < meta.variables.len() => (*t, *v),
                _ => {
                    return Err(DatasetError::ShapeMismatch {
                        what: format!("cubelet {i} coordinates"),
                        expected: vec![group.len(), meta.variables.len()],
                        found: cubelet.coords.clone(),
                    })
                }
            };
            let values = cubelet.to_array();
            if !missing.contains(&group[t]) {
                let context = format!("cubelet {i}, date {}", to_iso(&group[t]));
                let found = check.check(values.view(), &meta.variables[v], &context);
                if !found.is_empty() {
                    match self.config.statistics.values_policy {
                        ValuesPolicy::Fail => return Err(DatasetError::DataValues { failures: found }),
                        ValuesPolicy::Collect => {
                            for failure in &found {
                                warn!("{failure}");
                            }
                            failures.extend(found);
                        }
                    }
                }
            }
            buffer.assign(&cubelet.coords, values.view())?;
        }
        if !failures.is_empty() {
            return Err(DatasetError::DataValues { failures });
        }
        let load_time = start.elapsed();

        let cache = buffer.cache();
        let record = PartialRecord::partition(
            igroup,
            group,
            |d| missing.contains(d),
            |ok_rows| compute_statistics(&cache.select(Axis(0), ok_rows).view(), &meta.variables, check),
        )?;
        session.statistics.put(&record.key, &record)?;

        buffer.flush(&session.store, "data").await?;
        info!(
            "Group {igroup}: {} cubelets, load {:.2?}, total {:.2?}",
            cube.count(),
            load_time,
            start.elapsed()
        );
        Ok(())
    }
}

/// Which user value bounds the end of the statistics period
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EndBoundSource {
    /// The user end date
    #[default]
    End,
    /// The user start date, as older releases did
    Start,
}

/// Destination of the final statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatisticsOutput {
    /// Arrays inside the dataset
    Dataset,
    /// JSON file
    File(PathBuf),
    /// Log output only
    Log,
}

impl StatisticsOutput {
    /// `None` writes into the dataset, `-` to the log, anything else to a file
    pub fn from_arg(arg: Option<&str>) -> Self {
        match arg {
            None => Self::Dataset,
            Some("-") => Self::Log,
            Some(path) => Self::File(PathBuf::from(path)),
        }
    }
}

/// Merges the partial records of a build into the dataset statistics
#[derive(Debug, Clone)]
pub struct StatisticsAdder {
    output: StatisticsOutput,
    start: Option<String>,
    end: Option<String>,
    end_bound_source: EndBoundSource,
}

impl StatisticsAdder {
    pub fn new(output: StatisticsOutput) -> Self {
        Self {
            output,
            start: None,
            end: None,
            end_bound_source: EndBoundSource::default(),
        }
    }

    /// Restrict the statistics to `[start, end]` on top of the dataset bounds
    #[must_use]
    pub fn with_bounds(mut self, start: Option<String>, end: Option<String>) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    #[must_use]
    pub fn with_end_bound_source(mut self, source: EndBoundSource) -> Self {
        self.end_bound_source = source;
        self
    }

    /// Dates the statistics are computed over
    pub fn statistics_dates(&self, meta: &DatasetMetadata) -> Result<Vec<NaiveDateTime>> {
        let mut dates = target_dates(
            &meta.dates,
            &meta.missing_dates,
            meta.statistics_start,
            meta.statistics_end,
        );
        if let Some(start) = &self.start {
            let limit = as_first_date(&DateBound::parse(start)?, &dates)?;
            dates.retain(|d| *d >= limit);
        }
        if let Some(end) = &self.end {
            let bound = match self.end_bound_source {
                EndBoundSource::End => end,
                EndBoundSource::Start => self.start.as_ref().unwrap_or(end),
            };
            let limit = as_last_date(&DateBound::parse(bound)?, &dates)?;
            dates.retain(|d| *d <= limit);
        }
        Ok(dates)
    }

    /// Aggregate every partial record and send the summary to the output
    ///
    /// Writing into the dataset needs every group built and no user bounds; both are
    /// checked before any record is read.
    pub async fn run<S: FullDataSource>(&self, session: &mut BuildSession<S>) -> Result<Summary> {
        if self.output == StatisticsOutput::Dataset {
            self.check_dataset_output(session).await?;
        }
        let meta = DatasetMetadata::read(&session.store).await?;
        let dates = self.statistics_dates(&meta)?;
        let tolerance = dataset_tolerance(&session.store).await;
        let aggregator = StatAggregator::new(dates, meta.variables.clone(), tolerance);
        let records = session
            .statistics
            .items::<PartialRecord>()?
            .map(|item| item.map(|(_, record)| record));
        let summary = aggregator.aggregate(records)?;

        match &self.output {
            StatisticsOutput::Dataset => self.write_to_dataset(session, &summary).await?,
            StatisticsOutput::File(path) => {
                summary.save(path)?;
                info!("Statistics written in {}", path.display());
            }
            StatisticsOutput::Log => info!("Statistics:\n{summary}"),
        }
        Ok(summary)
    }

    async fn check_dataset_output<S: FullDataSource>(&self, session: &mut BuildSession<S>) -> Result<()> {
        if self.start.is_some() || self.end.is_some() {
            return Err(DatasetError::config(
                "Cannot write statistics in dataset with user specified dates, \
                 this would conflict with the dataset metadata",
            ));
        }
        if !session.registry.ready(true).await? {
            return Err(DatasetError::NotFullyBuilt {
                path: session.store.location(),
            });
        }
        Ok(())
    }

    async fn write_to_dataset<S: FullDataSource>(&self, session: &mut BuildSession<S>, summary: &Summary) -> Result<()> {
        summary.write_to_store(&session.store, None).await?;
        session
            .registry
            .add_to_history("compute_statistics_end", JsonValue::Null)
            .await?;
        info!("Wrote statistics in {}", session.store.location());
        Ok(())
    }
}

/// Recomputes statistics per date from the finished data
pub struct AdditionsLoader<S: FullDataSource> {
    store: S,
    name: String,
    storage: PartialStore,
}

impl AdditionsLoader<ZarrStore> {
    /// Loader for a local dataset, partial records in `<path>.tmp_data/<name>`
    pub fn open(path: &str, name: &str) -> Result<Self> {
        let store = ZarrStore::from_path_str(path)?;
        Self::new(store, tmp_data_dir(path).join(name), name)
    }
}

impl<S: FullDataSource + 'static> AdditionsLoader<S> {
    pub fn new(store: S, storage_dir: impl Into<PathBuf>, name: &str) -> Result<Self> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(DatasetError::config(format!("Invalid additions name '{name}'")));
        }
        Ok(Self {
            store,
            name: name.to_string(),
            storage: PartialStore::new(storage_dir),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dates inside the dataset statistics period, missing ones included
    fn dates(meta: &DatasetMetadata) -> Vec<NaiveDateTime> {
        target_dates(&meta.dates, &[], meta.statistics_start, meta.statistics_end)
    }

    /// Start from an empty partial store
    pub async fn initialise(&self) -> Result<()> {
        self.storage.delete()?;
        self.storage.create(false)?;
        info!("Dataset {} additions '{}' initialised", self.store.location(), self.name);
        Ok(())
    }

    /// Compute and store statistics of every owned date
    pub async fn run(&self, parts: &Parts) -> Result<LoadReport> {
        let meta = DatasetMetadata::read(&self.store).await?;
        let dates = Self::dates(&meta);
        let filter = PartitionFilter::new(parts, dates.len())?;
        let check = meta.values_check(&self.store.location());
        let missing: HashSet<NaiveDateTime> = meta.missing_dates.iter().copied().collect();
        let row_of: HashMap<NaiveDateTime, usize> = meta.dates.iter().enumerate().map(|(i, d)| (*d, i)).collect();

        let mut report = LoadReport::default();
        let mut unit_of_row = HashMap::new();
        let mut rows = Vec::new();
        for unit in filter.owned() {
            let date = dates[unit];
            if missing.contains(&date) {
                self.storage.put(&[date], &PartialRecord::missing(unit, vec![date]))?;
                report.built.push(unit);
                continue;
            }
            let row = *row_of
                .get(&date)
                .ok_or_else(|| DatasetError::store(format!("Date {} is not in the dataset", to_iso(&date))))?;
            unit_of_row.insert(row, unit);
            rows.push(row);
        }

        let mut stream = stream_rows(&self.store, "data", rows);
        while let Some(item) = stream.next().await {
            let (row, data) = item?;
            let unit = unit_of_row[&row];
            let date = dates[unit];
            let stats = compute_statistics(&data.view(), &meta.variables, &check)?;
            self.storage
                .put(&[date], &PartialRecord::complete(unit, vec![date], stats))?;
            report.built.push(unit);
        }
        report.built.sort_unstable();
        info!(
            "Dataset {} additions '{}' run for {} dates",
            self.store.location(),
            self.name,
            report.built.len()
        );
        Ok(report)
    }

    /// Aggregate, check against the dataset statistics, write `<name>_<field>` arrays
    pub async fn finalise(&self) -> Result<Summary> {
        let meta = DatasetMetadata::read(&self.store).await?;
        let dates = Self::dates(&meta);
        info!(
            "Aggregating '{}' statistics over {} dates and {} variables",
            self.name,
            dates.len(),
            meta.variables.len()
        );
        let tolerance = dataset_tolerance(&self.store).await;
        let aggregator = StatAggregator::new(dates, meta.variables.clone(), tolerance);
        let records = self
            .storage
            .items::<PartialRecord>()?
            .map(|item| item.map(|(_, record)| record));
        let summary = aggregator.aggregate(records)?;

        self.check_statistics(&summary).await?;
        summary.write_to_store(&self.store, Some(&self.name)).await?;
        CompletionRegistry::new(self.store.clone())
            .add_to_history("compute_statistics_end", json!({"additions": self.name}))
            .await?;
        self.storage.delete()?;
        info!("Wrote '{}' additions in {}", self.name, self.store.location());
        Ok(summary)
    }

    /// Compare with the statistics already in the dataset, when there are any
    async fn check_statistics(&self, summary: &Summary) -> Result<()> {
        let Some(reference) = Summary::read_from_store(&self.store, None, &summary.variables).await? else {
            debug!("No statistics in {} to compare with", self.store.location());
            return Ok(());
        };
        for field in [StatField::Mean, StatField::Stdev, StatField::Minimum, StatField::Maximum] {
            let stored = reference.field(field);
            let computed = summary.field(field);
            for (i, variable) in summary.variables.iter().enumerate() {
                let (a, b) = (stored[i], computed[i]);
                if !is_close(a, b, 1e-4, 1e-4) {
                    return Err(DatasetError::StatisticsMismatch {
                        field: field.as_str().to_string(),
                        variable: variable.clone(),
                        stored: a,
                        computed: b,
                    });
                }
            }
        }
        Ok(())
    }
}

/// NaN is close to NaN, so a variable with no finite values compares equal
fn is_close(a: f64, b: f64, rtol: f64, atol: f64) -> bool {
    if a.is_nan() || b.is_nan() {
        return a.is_nan() && b.is_nan();
    }
    a == b || (a - b).abs() <= atol + rtol * b.abs()
}
