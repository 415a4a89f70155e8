//! In-memory staging of one group before a single bulk write

use crate::data_source::DataWriter;
use crate::errors::{DatasetError, Result};
use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn};
use tracing::debug;

/// Buffer holding every row of one group
///
/// Row `k` of the buffer is written to row `indexes[k]` of the target array. Cells
/// never assigned stay NaN.
#[derive(Debug)]
pub struct CacheBuffer {
    cache: ArrayD<f64>,
    indexes: Vec<usize>,
}

impl CacheBuffer {
    pub fn new(shape: &[usize], indexes: Vec<usize>) -> Result<Self> {
        if shape.first().copied() != Some(indexes.len()) {
            return Err(DatasetError::ShapeMismatch {
                what: "cache buffer rows".to_string(),
                expected: vec![indexes.len()],
                found: shape.to_vec(),
            });
        }
        Ok(Self {
            cache: ArrayD::from_elem(IxDyn(shape), f64::NAN),
            indexes,
        })
    }

    /// Assign `values` at the leading-axis position `index` (e.g. `[t, v]`)
    pub fn assign(&mut self, index: &[usize], values: ArrayViewD<'_, f64>) -> Result<()> {
        let shape = self.cache.shape().to_vec();
        if index.len() > shape.len() || index.iter().zip(&shape).any(|(i, s)| i >= s) {
            return Err(DatasetError::ShapeMismatch {
                what: format!("cache buffer index {index:?}"),
                expected: shape,
                found: index.to_vec(),
            });
        }
        let mut target = self.cache.view_mut();
        for &i in index {
            target = target.index_axis_move(Axis(0), i);
        }
        if target.shape() != values.shape() {
            return Err(DatasetError::ShapeMismatch {
                what: format!("values assigned at {index:?}"),
                expected: target.shape().to_vec(),
                found: values.shape().to_vec(),
            });
        }
        target.assign(&values);
        Ok(())
    }

    /// The staged values
    pub fn cache(&self) -> ArrayViewD<'_, f64> {
        self.cache.view()
    }

    pub fn indexes(&self) -> &[usize] {
        &self.indexes
    }

    /// Write every staged row to `array` in one call, consuming the buffer
    pub async fn flush<W: DataWriter>(self, store: &W, array: &str) -> Result<()> {
        debug!(
            "Flushing {} rows into '{array}' starting at row {:?}",
            self.indexes.len(),
            self.indexes.first()
        );
        store.write_rows(array, &self.indexes, self.cache.view()).await
    }
}
