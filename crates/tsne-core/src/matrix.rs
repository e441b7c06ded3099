use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::InputError;

/// Dense N×D matrix of input points, one point per row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Matrix {
    data: Array2<f64>,
}

impl Matrix {
    pub fn from_flat(rows: usize, cols: usize, data: Vec<f64>) -> Result<Self, InputError> {
        if cols == 0 {
            return Err(InputError::EmptyDimensions);
        }
        if data.len() != rows * cols {
            return Err(InputError::InvalidParameter {
                name: "data",
                reason: format!("expected {} values, got {}", rows * cols, data.len()),
            });
        }
        let data = Array2::from_shape_vec((rows, cols), data).map_err(|e| {
            InputError::InvalidParameter {
                name: "data",
                reason: e.to_string(),
            }
        })?;
        Ok(Self { data })
    }

    /// Build from per-point vectors. The first row fixes the dimensionality.
    pub fn from_rows<R: AsRef<[f64]>>(rows: &[R]) -> Result<Self, InputError> {
        let cols = rows.first().map(|r| r.as_ref().len()).unwrap_or(0);
        if cols == 0 {
            return Err(InputError::EmptyDimensions);
        }
        let mut data = Vec::with_capacity(rows.len() * cols);
        for (i, row) in rows.iter().enumerate() {
            let row = row.as_ref();
            if row.len() != cols {
                return Err(InputError::RaggedRow {
                    row: i,
                    expected: cols,
                    found: row.len(),
                });
            }
            data.extend_from_slice(row);
        }
        Self::from_flat(rows.len(), cols, data)
    }

    pub fn rows(&self) -> usize {
        self.data.nrows()
    }

    pub fn cols(&self) -> usize {
        self.data.ncols()
    }

    pub fn row(&self, i: usize) -> ArrayView1<'_, f64> {
        self.data.row(i)
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = ArrayView1<'_, f64>> {
        self.data.outer_iter()
    }

    /// All values in row-major order.
    pub fn values(&self) -> impl Iterator<Item = &f64> {
        self.data.iter()
    }

    pub fn view(&self) -> ArrayView2<'_, f64> {
        self.data.view()
    }

    /// Indices of rows containing NaN or infinite values.
    pub fn non_finite_rows(&self) -> Vec<usize> {
        self.iter_rows()
            .enumerate()
            .filter(|(_, row)| row.iter().any(|v| !v.is_finite()))
            .map(|(i, _)| i)
            .collect()
    }

    /// Zero-mean every column, then divide everything by the largest
    /// absolute value.
    pub fn normalize(&mut self) {
        let Some(mean) = self.data.mean_axis(Axis(0)) else {
            return;
        };
        self.data -= &mean;
        let max_abs = self.data.fold(0.0f64, |acc, v| acc.max(v.abs()));
        if max_abs > 0.0 {
            self.data /= max_abs;
        }
    }
}

pub fn squared_distance(a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}
