//! Zarr-like chunked array store on the local filesystem
//!
//! Layout follows Zarr v2: every group is a directory with `.zgroup` and `.zattrs`,
//! every array a directory with a `.zarray` document and one file per chunk named by
//! its chunk coordinates joined with `.`. Chunks are stored uncompressed in C order as
//! little-endian values of the array dtype, always at full chunk size. Every chunk and
//! attribute write goes through a temporary file and a rename.

use crate::data_source::{ArrayMetadata, DataReader, DataWriter, Dtype};
use crate::errors::{DatasetError, Result};
use crate::utils::atomic_write;
use async_trait::async_trait;
use ndarray::{ArrayD, ArrayViewD, IxDyn, Slice};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// A chunked array store rooted at a directory
#[derive(Debug, Clone)]
pub struct ZarrStore {
    path: PathBuf,
}

impl ZarrStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Create a store handle from a path string
    pub fn from_path_str(s: &str) -> Result<Self> {
        // Only the local filesystem gives us atomic renames
        if s.starts_with("s3://") || s.starts_with("gs://") || s.starts_with("https://") {
            return Err(DatasetError::store(format!(
                "Remote stores are not supported, use a local path: {s}"
            )));
        }
        Ok(Self::new(s))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn group_dir(&self, group: &str) -> PathBuf {
        if group.is_empty() {
            self.path.clone()
        } else {
            self.path.join(group)
        }
    }

    fn read_meta(&self, name: &str) -> Result<ArrayMetadata> {
        let zarray = self.path.join(name).join(".zarray");
        if !zarray.exists() {
            return Err(DatasetError::ArrayNotFound {
                array: name.to_string(),
            });
        }
        let doc: JsonValue = serde_json::from_str(&fs::read_to_string(&zarray)?)?;
        let field = |key: &str| {
            doc.get(key)
                .cloned()
                .ok_or_else(|| DatasetError::store(format!("Missing {key} in {}", zarray.display())))
        };
        Ok(ArrayMetadata {
            shape: serde_json::from_value(field("shape")?)?,
            chunks: serde_json::from_value(field("chunks")?)?,
            dtype: serde_json::from_value(field("dtype")?)?,
        })
    }

    fn chunk_path(&self, name: &str, index: &[usize]) -> PathBuf {
        let key = if index.is_empty() {
            "0".to_string()
        } else {
            index
                .iter()
                .map(usize::to_string)
                .collect::<Vec<_>>()
                .join(".")
        };
        self.path.join(name).join(key)
    }

    fn load_chunk(&self, name: &str, meta: &ArrayMetadata, index: &[usize]) -> Result<ArrayD<f64>> {
        let path = self.chunk_path(name, index);
        let shape = IxDyn(&meta.chunks);
        if !path.exists() {
            return Ok(ArrayD::from_elem(shape, fill_value(meta.dtype)));
        }
        let bytes = fs::read(&path)?;
        let expected = meta.chunks.iter().product::<usize>() * meta.dtype.size();
        if bytes.len() != expected {
            return Err(DatasetError::store(format!(
                "Chunk {} has {} bytes, expected {expected}",
                path.display(),
                bytes.len()
            )));
        }
        Ok(ArrayD::from_shape_vec(shape, decode(&bytes, meta.dtype))?)
    }

    fn store_chunk(&self, name: &str, meta: &ArrayMetadata, index: &[usize], chunk: &ArrayD<f64>) -> Result<()> {
        let bytes = encode(chunk.iter().copied(), meta.dtype);
        atomic_write(&self.chunk_path(name, index), &bytes)
    }

    fn check_rows(name: &str, meta: &ArrayMetadata, rows: &[usize]) -> Result<()> {
        let len = meta.shape.first().copied().unwrap_or(0);
        match rows.iter().find(|&&r| r >= len) {
            Some(r) => Err(DatasetError::store(format!(
                "Row {r} out of bounds for array '{name}' of length {len}"
            ))),
            None => Ok(()),
        }
    }

    fn read_rows_sync(&self, name: &str, rows: &[usize]) -> Result<ArrayD<f64>> {
        let meta = self.read_meta(name)?;
        Self::check_rows(name, &meta, rows)?;

        let mut out_shape = meta.shape.clone();
        out_shape[0] = rows.len();
        let mut out = ArrayD::from_elem(IxDyn(&out_shape), fill_value(meta.dtype));

        for (chunk0, members) in rows_by_chunk(rows, meta.chunks[0]) {
            for rest in odometer(&meta.chunk_grid()[1..]) {
                let index = prepend(chunk0, &rest);
                let chunk = self.load_chunk(name, &meta, &index)?;
                for &(k, r) in &members {
                    let (origin, extent) = window(&meta, &index);
                    let src = chunk.slice_each_axis(|ad| {
                        let axis = ad.axis.index();
                        if axis == 0 {
                            Slice::from(r - origin[0]..r - origin[0] + 1)
                        } else {
                            Slice::from(0..extent[axis])
                        }
                    });
                    let mut dst = out.slice_each_axis_mut(|ad| {
                        let axis = ad.axis.index();
                        if axis == 0 {
                            Slice::from(k..k + 1)
                        } else {
                            Slice::from(origin[axis]..origin[axis] + extent[axis])
                        }
                    });
                    dst.assign(&src);
                }
            }
        }
        Ok(out)
    }

    fn write_rows_sync(&self, name: &str, rows: &[usize], data: ArrayViewD<'_, f64>) -> Result<()> {
        let meta = self.read_meta(name)?;
        Self::check_rows(name, &meta, rows)?;

        let mut expected = meta.shape.clone();
        expected[0] = rows.len();
        if data.shape() != expected.as_slice() {
            return Err(DatasetError::ShapeMismatch {
                what: format!("rows written to '{name}'"),
                expected,
                found: data.shape().to_vec(),
            });
        }

        let mut written = 0;
        for (chunk0, members) in rows_by_chunk(rows, meta.chunks[0]) {
            for rest in odometer(&meta.chunk_grid()[1..]) {
                let index = prepend(chunk0, &rest);
                let mut chunk = self.load_chunk(name, &meta, &index)?;
                let (origin, extent) = window(&meta, &index);
                for &(k, r) in &members {
                    let src = data.slice_each_axis(|ad| {
                        let axis = ad.axis.index();
                        if axis == 0 {
                            Slice::from(k..k + 1)
                        } else {
                            Slice::from(origin[axis]..origin[axis] + extent[axis])
                        }
                    });
                    let mut dst = chunk.slice_each_axis_mut(|ad| {
                        let axis = ad.axis.index();
                        if axis == 0 {
                            Slice::from(r - origin[0]..r - origin[0] + 1)
                        } else {
                            Slice::from(0..extent[axis])
                        }
                    });
                    dst.assign(&src);
                }
                self.store_chunk(name, &meta, &index, &chunk)?;
                written += 1;
            }
        }
        debug!("Wrote {} rows into {written} chunks of '{name}'", rows.len());
        Ok(())
    }

    fn ensure_group(&self, group: &str) -> Result<()> {
        let dir = self.group_dir(group);
        fs::create_dir_all(&dir)?;
        let zgroup = dir.join(".zgroup");
        if !zgroup.exists() {
            atomic_write(&zgroup, br#"{"zarr_format": 2}"#)?;
        }
        Ok(())
    }
}

#[async_trait]
impl DataReader for ZarrStore {
    fn location(&self) -> String {
        self.path.display().to_string()
    }

    async fn exists(&self) -> bool {
        self.path.join(".zgroup").exists()
    }

    async fn list_arrays(&self, group: &str) -> Result<Vec<String>> {
        let mut arrays = Vec::new();
        for entry in fs::read_dir(self.group_dir(group))? {
            let path = entry?.path();
            if path.join(".zarray").exists() {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    arrays.push(name.to_string());
                }
            }
        }
        arrays.sort();
        Ok(arrays)
    }

    async fn has_array(&self, name: &str) -> bool {
        self.path.join(name).join(".zarray").exists()
    }

    async fn get_metadata(&self, name: &str) -> Result<ArrayMetadata> {
        self.read_meta(name)
    }

    async fn read_array(&self, name: &str) -> Result<ArrayD<f64>> {
        let meta = self.read_meta(name)?;
        let rows: Vec<usize> = (0..meta.shape.first().copied().unwrap_or(0)).collect();
        self.read_rows_sync(name, &rows)
    }

    async fn read_rows(&self, name: &str, rows: &[usize]) -> Result<ArrayD<f64>> {
        self.read_rows_sync(name, rows)
    }

    async fn attributes(&self, group: &str) -> Result<BTreeMap<String, JsonValue>> {
        let path = self.group_dir(group).join(".zattrs");
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }
}

#[async_trait]
impl DataWriter for ZarrStore {
    async fn create(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_dir_all(&self.path)?;
        }
        self.ensure_group("")?;
        atomic_write(&self.path.join(".zattrs"), b"{}")
    }

    async fn create_array(&self, name: &str, metadata: ArrayMetadata, overwrite: bool) -> Result<()> {
        if metadata.shape.is_empty() || metadata.shape.len() != metadata.chunks.len() {
            return Err(DatasetError::store(format!(
                "Array '{name}' needs a non-empty shape and one chunk size per axis"
            )));
        }
        if metadata.chunks.contains(&0) {
            return Err(DatasetError::store(format!("Array '{name}' has a zero chunk size")));
        }
        let dir = self.path.join(name);
        if dir.exists() {
            if !overwrite {
                return Err(DatasetError::store(format!("Array '{name}' already exists")));
            }
            fs::remove_dir_all(&dir)?;
        }
        if let Some((group, _)) = name.rsplit_once('/') {
            self.ensure_group(group)?;
        }
        fs::create_dir_all(&dir)?;

        let fill = match metadata.dtype {
            Dtype::Float32 | Dtype::Float64 => JsonValue::String("NaN".to_string()),
            Dtype::Int64 | Dtype::UInt8 => JsonValue::from(0),
        };
        let zarray = serde_json::json!({
            "chunks": metadata.chunks,
            "compressor": null,
            "dtype": metadata.dtype,
            "fill_value": fill,
            "filters": null,
            "order": "C",
            "shape": metadata.shape,
            "zarr_format": 2
        });
        atomic_write(&dir.join(".zarray"), serde_json::to_string_pretty(&zarray)?.as_bytes())?;
        debug!("Created array '{name}' with shape {:?}", metadata.shape);
        Ok(())
    }

    async fn write_array(&self, name: &str, data: ArrayViewD<'_, f64>, dtype: Dtype) -> Result<()> {
        let shape = data.shape().to_vec();
        let chunks = shape.iter().map(|&s| s.max(1)).collect();
        self.create_array(name, ArrayMetadata::new(shape.clone(), chunks, dtype), true)
            .await?;
        let rows: Vec<usize> = (0..shape[0]).collect();
        self.write_rows_sync(name, &rows, data)
    }

    async fn write_rows(&self, name: &str, rows: &[usize], data: ArrayViewD<'_, f64>) -> Result<()> {
        self.write_rows_sync(name, rows, data)
    }

    async fn update_attributes(&self, group: &str, values: BTreeMap<String, JsonValue>) -> Result<()> {
        self.ensure_group(group)?;
        let mut attrs = self.attributes(group).await?;
        attrs.extend(values);
        let path = self.group_dir(group).join(".zattrs");
        atomic_write(&path, serde_json::to_string_pretty(&attrs)?.as_bytes())
    }
}

fn fill_value(dtype: Dtype) -> f64 {
    match dtype {
        Dtype::Float32 | Dtype::Float64 => f64::NAN,
        Dtype::Int64 | Dtype::UInt8 => 0.0,
    }
}

fn encode(values: impl Iterator<Item = f64>, dtype: Dtype) -> Vec<u8> {
    let mut out = Vec::new();
    for v in values {
        match dtype {
            Dtype::Float32 => out.extend_from_slice(&(v as f32).to_le_bytes()),
            Dtype::Float64 => out.extend_from_slice(&v.to_le_bytes()),
            Dtype::Int64 => out.extend_from_slice(&(v as i64).to_le_bytes()),
            Dtype::UInt8 => out.push(v as u8),
        }
    }
    out
}

fn decode(bytes: &[u8], dtype: Dtype) -> Vec<f64> {
    match dtype {
        Dtype::Float32 => bytes
            .chunks_exact(4)
            .map(|b| f64::from(f32::from_le_bytes([b[0], b[1], b[2], b[3]])))
            .collect(),
        Dtype::Float64 => bytes
            .chunks_exact(8)
            .map(|b| f64::from_le_bytes(b.try_into().unwrap_or([0; 8])))
            .collect(),
        Dtype::Int64 => bytes
            .chunks_exact(8)
            .map(|b| i64::from_le_bytes(b.try_into().unwrap_or([0; 8])) as f64)
            .collect(),
        Dtype::UInt8 => bytes.iter().map(|&b| f64::from(b)).collect(),
    }
}

/// Group `(position in rows, row)` pairs by the chunk index of the row along axis 0
fn rows_by_chunk(rows: &[usize], chunk: usize) -> BTreeMap<usize, Vec<(usize, usize)>> {
    let mut groups: BTreeMap<usize, Vec<(usize, usize)>> = BTreeMap::new();
    for (k, &r) in rows.iter().enumerate() {
        groups.entry(r / chunk).or_default().push((k, r));
    }
    groups
}

/// Origin and in-bounds extent of the chunk at `index`
fn window(meta: &ArrayMetadata, index: &[usize]) -> (Vec<usize>, Vec<usize>) {
    let origin: Vec<usize> = index.iter().zip(&meta.chunks).map(|(i, c)| i * c).collect();
    let extent = origin
        .iter()
        .zip(&meta.chunks)
        .zip(&meta.shape)
        .map(|((o, c), s)| (*c).min(s - o))
        .collect();
    (origin, extent)
}

fn prepend(first: usize, rest: &[usize]) -> Vec<usize> {
    let mut index = Vec::with_capacity(rest.len() + 1);
    index.push(first);
    index.extend_from_slice(rest);
    index
}

/// Every index of a grid in C order; a zero-dimensional grid has one empty index
fn odometer(grid: &[usize]) -> Vec<Vec<usize>> {
    if grid.contains(&0) {
        return Vec::new();
    }
    let mut all = Vec::new();
    let mut current = vec![0; grid.len()];
    loop {
        all.push(current.clone());
        let mut axis = grid.len();
        loop {
            if axis == 0 {
                return all;
            }
            axis -= 1;
            current[axis] += 1;
            if current[axis] < grid[axis] {
                break;
            }
            current[axis] = 0;
        }
    }
}
