//! Completion registry of a dataset build
//!
//! One flag per group records that its data is durably in the store. Flags live in
//! their own array, one element per chunk file, so concurrent workers writing
//! different groups never rewrite each other's flags. History and provenance are
//! attributes of the `_build` group.

use crate::data_source::{ArrayMetadata, DataReader, DataWriter, Dtype, FullDataSource};
use crate::errors::{DatasetError, Result};
use crate::provenance::gather_provenance_info;
use chrono::{NaiveDateTime, Utc};
use ndarray::{arr1, Array1};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Group holding the registry arrays and attributes
pub const BUILD_GROUP: &str = "_build";
const FLAGS: &str = "_build/flags";
const LENGTHS: &str = "_build/lengths";
const HISTORY: &str = "history";

/// One entry of the build history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub action: String,
    pub timestamp: NaiveDateTime,
    #[serde(flatten)]
    pub payload: Map<String, JsonValue>,
}

/// Registry handle bound to one dataset store
///
/// The flags are read from the store on first use and cached. The cache only
/// changes through this handle's own [`CompletionRegistry::set_flag`]; pass
/// `sync = true` to see other workers' progress.
#[derive(Debug, Clone)]
pub struct CompletionRegistry<S: FullDataSource> {
    store: S,
    flags: Option<Vec<bool>>,
}

impl<S: FullDataSource> CompletionRegistry<S> {
    pub fn new(store: S) -> Self {
        Self { store, flags: None }
    }

    pub async fn exists(&self) -> bool {
        self.store.has_array(FLAGS).await
    }

    /// Create the flags (all false) and record the group lengths
    pub async fn create(&mut self, lengths: &[usize]) -> Result<()> {
        if self.exists().await {
            return Err(DatasetError::RegistryExists {
                path: self.store.location(),
            });
        }
        if lengths.is_empty() {
            return Err(DatasetError::config("Cannot create a registry for zero groups"));
        }
        self.store
            .create_array(FLAGS, ArrayMetadata::new(vec![lengths.len()], vec![1], Dtype::UInt8), false)
            .await?;
        let values = Array1::from_iter(lengths.iter().map(|&l| l as f64)).into_dyn();
        self.store.write_array(LENGTHS, values.view(), Dtype::Int64).await?;
        self.flags = Some(vec![false; lengths.len()]);
        info!("Created completion registry for {} groups", lengths.len());
        Ok(())
    }

    /// Number of dates in each group
    pub async fn get_lengths(&self) -> Result<Vec<usize>> {
        if !self.store.has_array(LENGTHS).await {
            return Ok(Vec::new());
        }
        let lengths = self.store.read_array(LENGTHS).await?;
        Ok(lengths.iter().map(|&l| l as usize).collect())
    }

    async fn load_flags(&self) -> Result<Vec<bool>> {
        let flags = self.store.read_array(FLAGS).await?;
        Ok(flags.iter().map(|&f| f != 0.0).collect())
    }

    /// All flags, re-read from the store when `sync` is set or nothing is cached
    pub async fn get_flags(&mut self, sync: bool) -> Result<Vec<bool>> {
        if sync || self.flags.is_none() {
            self.flags = Some(self.load_flags().await?);
        }
        Ok(self.flags.clone().unwrap_or_default())
    }

    pub async fn get_flag(&mut self, unit: usize) -> Result<bool> {
        let flags = self.get_flags(false).await?;
        flags.get(unit).copied().ok_or_else(|| {
            DatasetError::store(format!("Group {unit} out of range for {} groups", flags.len()))
        })
    }

    /// Mark a group as durably written
    pub async fn set_flag(&mut self, unit: usize) -> Result<()> {
        let one = arr1(&[1.0]).into_dyn();
        self.store.write_rows(FLAGS, &[unit], one.view()).await?;
        if let Some(flags) = self.flags.as_mut() {
            if let Some(flag) = flags.get_mut(unit) {
                *flag = true;
            }
        }
        self.store
            .set_attribute("latest_write_timestamp", JsonValue::from(now_iso()))
            .await?;
        debug!("Group {unit} flagged as built");
        Ok(())
    }

    /// Whether every group is built
    pub async fn ready(&mut self, sync: bool) -> Result<bool> {
        Ok(self.get_flags(sync).await?.iter().all(|&f| f))
    }

    pub async fn history(&self) -> Result<Vec<HistoryEvent>> {
        let attrs = self.store.attributes(BUILD_GROUP).await?;
        match attrs.get(HISTORY) {
            Some(history) => Ok(serde_json::from_value(history.clone())?),
            None => Ok(Vec::new()),
        }
    }

    pub async fn has_event(&self, action: &str) -> Result<bool> {
        Ok(self.history().await?.iter().any(|e| e.action == action))
    }

    /// Append an event; `payload` must be a JSON object (or null)
    pub async fn add_to_history(&self, action: &str, payload: JsonValue) -> Result<()> {
        let payload = match payload {
            JsonValue::Object(map) => map,
            JsonValue::Null => Map::new(),
            other => {
                return Err(DatasetError::store(format!(
                    "History payload for '{action}' must be an object, got {other}"
                )))
            }
        };
        let mut history = self.history().await?;
        history.push(HistoryEvent {
            action: action.to_string(),
            timestamp: Utc::now().naive_utc(),
            payload,
        });
        let mut values = BTreeMap::new();
        values.insert(HISTORY.to_string(), serde_json::to_value(history)?);
        self.store.update_attributes(BUILD_GROUP, values).await
    }

    /// Record the environment fingerprint under `name`, once
    pub async fn add_provenance(&self, name: &str) -> Result<()> {
        let attrs = self.store.attributes(BUILD_GROUP).await?;
        if attrs.contains_key(name) {
            return Ok(());
        }
        let mut values = BTreeMap::new();
        values.insert(name.to_string(), gather_provenance_info());
        self.store.update_attributes(BUILD_GROUP, values).await
    }
}

fn now_iso() -> String {
    crate::dates::to_iso(&Utc::now().naive_utc())
}
