//! Array store abstraction
//!
//! The builder never talks to a concrete storage engine. It needs a chunked,
//! attribute-bearing store where whole arrays and rows along the leading axis can be
//! read and written, and these traits are that contract. [`crate::zarr_io::ZarrStore`]
//! is the implementation shipped with the crate.

use crate::errors::Result;
use async_trait::async_trait;
use futures::Stream;
use ndarray::{ArrayD, ArrayViewD};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::pin::Pin;

/// On-disk element type of an array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dtype {
    #[serde(rename = "<f4")]
    Float32,
    #[serde(rename = "<f8")]
    Float64,
    #[serde(rename = "<i8")]
    Int64,
    #[serde(rename = "|u1")]
    UInt8,
}

impl Dtype {
    /// Size of one element in bytes
    #[must_use]
    pub const fn size(self) -> usize {
        match self {
            Self::Float32 => 4,
            Self::Float64 | Self::Int64 => 8,
            Self::UInt8 => 1,
        }
    }

    /// Parse the short names accepted in configuration files
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "float32" | "<f4" => Some(Self::Float32),
            "float64" | "<f8" => Some(Self::Float64),
            "int64" | "<i8" => Some(Self::Int64),
            "uint8" | "bool" | "|u1" => Some(Self::UInt8),
            _ => None,
        }
    }
}

/// Shape, chunking and type of a stored array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayMetadata {
    pub shape: Vec<usize>,
    pub chunks: Vec<usize>,
    pub dtype: Dtype,
}

impl ArrayMetadata {
    pub fn new(shape: Vec<usize>, chunks: Vec<usize>, dtype: Dtype) -> Self {
        Self {
            shape,
            chunks,
            dtype,
        }
    }

    /// Number of chunks along each axis
    #[must_use]
    pub fn chunk_grid(&self) -> Vec<usize> {
        self.shape
            .iter()
            .zip(&self.chunks)
            .map(|(&s, &c)| s.div_ceil(c.max(1)))
            .collect()
    }
}

/// Read access to a dataset store
#[async_trait]
pub trait DataReader: Send + Sync {
    /// Human readable location of the store, used in messages
    fn location(&self) -> String;

    /// Whether the store has been created
    async fn exists(&self) -> bool;

    /// List arrays directly under `group` ("" for the root)
    async fn list_arrays(&self, group: &str) -> Result<Vec<String>>;

    /// Whether an array exists
    async fn has_array(&self, name: &str) -> bool;

    /// Shape, chunks and dtype of an array
    async fn get_metadata(&self, name: &str) -> Result<ArrayMetadata>;

    /// Read an entire array
    async fn read_array(&self, name: &str) -> Result<ArrayD<f64>>;

    /// Read the listed rows (indices along axis 0), full extent on the other axes
    async fn read_rows(&self, name: &str, rows: &[usize]) -> Result<ArrayD<f64>>;

    /// All attributes of a group
    async fn attributes(&self, group: &str) -> Result<BTreeMap<String, JsonValue>>;

    /// One attribute of the root group
    async fn get_attribute(&self, key: &str) -> Result<Option<JsonValue>> {
        Ok(self.attributes("").await?.remove(key))
    }
}

/// Write access to a dataset store
#[async_trait]
pub trait DataWriter: Send + Sync {
    /// Create the store root, wiping whatever was there
    async fn create(&self) -> Result<()>;

    /// Create an empty array filled with the fill value
    async fn create_array(&self, name: &str, metadata: ArrayMetadata, overwrite: bool) -> Result<()>;

    /// Create an array holding `data`, chunked as a single chunk
    async fn write_array(&self, name: &str, data: ArrayViewD<'_, f64>, dtype: Dtype) -> Result<()>;

    /// Write `data` into the listed rows of an existing array in one bulk operation
    async fn write_rows(&self, name: &str, rows: &[usize], data: ArrayViewD<'_, f64>) -> Result<()>;

    /// Set attributes of a group, keeping the ones not mentioned
    async fn update_attributes(&self, group: &str, values: BTreeMap<String, JsonValue>) -> Result<()>;

    /// Set one attribute of the root group
    async fn set_attribute(&self, key: &str, value: JsonValue) -> Result<()> {
        let mut values = BTreeMap::new();
        values.insert(key.to_string(), value);
        self.update_attributes("", values).await
    }
}

/// Interface segregation: stores that can be both read and written
pub trait FullDataSource: DataReader + DataWriter + Clone {}

impl<T: DataReader + DataWriter + Clone> FullDataSource for T {}

/// Rows of an array yielded one at a time
pub type RowStream = Pin<Box<dyn Stream<Item = Result<(usize, ArrayD<f64>)>> + Send + 'static>>;

/// Stream the listed rows of an array, each with a leading axis of length one
///
/// Rows are read lazily, one per poll; the stream ends after the first error.
pub fn stream_rows<S>(store: &S, name: &str, rows: Vec<usize>) -> RowStream
where
    S: DataReader + Clone + 'static,
{
    let store = store.clone();
    let name = name.to_string();
    Box::pin(async_stream::stream! {
        for row in rows {
            match store.read_rows(&name, &[row]).await {
                Ok(data) => yield Ok((row, data)),
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }
    })
}
