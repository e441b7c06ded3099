use petal_decomposition::Pca;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::constants::{INIT_STD_DEV, MAX_EMBED_DIMS};
use crate::error::InputError;
use crate::matrix::Matrix;

/// N points in 2 or 3 dimensions, row-major.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    n: usize,
    dims: usize,
    coords: Vec<f64>,
}

impl Embedding {
    pub fn from_flat(n: usize, dims: usize, coords: Vec<f64>) -> Result<Self, InputError> {
        check_dims(dims)?;
        if coords.len() != n * dims {
            return Err(InputError::InvalidParameter {
                name: "coords",
                reason: format!("expected {} values, got {}", n * dims, coords.len()),
            });
        }
        Ok(Self { n, dims, coords })
    }

    /// Small isotropic Gaussian noise around the origin.
    pub fn random(n: usize, dims: usize, rng: &mut impl Rng) -> Result<Self, InputError> {
        check_dims(dims)?;
        let coords = (0..n * dims)
            .map(|_| gauss_random(rng) * INIT_STD_DEV)
            .collect();
        Ok(Self { n, dims, coords })
    }

    /// Projection onto the leading principal components of `data`, scaled
    /// so the first component has the same spread as the random init.
    /// Output axes beyond the input's dimensionality get random-init noise.
    pub fn pca(data: &Matrix, dims: usize, rng: &mut impl Rng) -> Result<Self, InputError> {
        check_dims(dims)?;
        let n = data.rows();
        let components = dims.min(data.cols()).min(n);
        if components == 0 {
            return Err(InputError::TooFewPoints { n });
        }

        let mut pca = Pca::new(components);
        let projected = pca
            .fit_transform(&data.view())
            .map_err(|e| InputError::InvalidParameter {
                name: "init",
                reason: format!("PCA failed: {e}"),
            })?;

        let first_std = (projected.column(0).iter().map(|v| v * v).sum::<f64>()
            / n.max(1) as f64)
            .sqrt();
        let scale = if first_std > 0.0 {
            INIT_STD_DEV / first_std
        } else {
            1.0
        };

        let mut coords = Vec::with_capacity(n * dims);
        for row in projected.outer_iter() {
            coords.extend(row.iter().map(|v| v * scale));
            for _ in components..dims {
                coords.push(gauss_random(rng) * INIT_STD_DEV);
            }
        }
        Ok(Self { n, dims, coords })
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn point(&self, i: usize) -> &[f64] {
        &self.coords[i * self.dims..(i + 1) * self.dims]
    }

    pub fn iter_points(&self) -> impl Iterator<Item = &[f64]> {
        self.coords.chunks_exact(self.dims)
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.coords
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.coords
    }

    pub fn into_vec(self) -> Vec<f64> {
        self.coords
    }

    /// Indices of points with a NaN or infinite coordinate.
    pub fn non_finite_points(&self) -> Vec<usize> {
        self.iter_points()
            .enumerate()
            .filter(|(_, p)| p.iter().any(|v| !v.is_finite()))
            .map(|(i, _)| i)
            .collect()
    }

    pub fn centroid(&self) -> Vec<f64> {
        let mut mean = vec![0.0; self.dims];
        for p in self.iter_points() {
            for (m, v) in mean.iter_mut().zip(p) {
                *m += v;
            }
        }
        if self.n > 0 {
            mean.iter_mut().for_each(|m| *m /= self.n as f64);
        }
        mean
    }

    /// Shift so the centroid sits at the origin.
    pub fn recenter(&mut self) {
        let mean = self.centroid();
        for p in self.coords.chunks_exact_mut(self.dims) {
            for (v, m) in p.iter_mut().zip(&mean) {
                *v -= m;
            }
        }
    }

    /// Per-dimension (min, max).
    pub fn bounds(&self) -> Vec<(f64, f64)> {
        let mut bounds = vec![(f64::INFINITY, f64::NEG_INFINITY); self.dims];
        for p in self.iter_points() {
            for (b, &v) in bounds.iter_mut().zip(p) {
                b.0 = b.0.min(v);
                b.1 = b.1.max(v);
            }
        }
        bounds
    }

    /// Min-max scale every dimension into [0, 1]. Flat dimensions map to 0.
    pub fn scale_to_unit_box(&mut self) {
        let bounds = self.bounds();
        for p in self.coords.chunks_exact_mut(self.dims) {
            for (v, (lo, hi)) in p.iter_mut().zip(&bounds) {
                let span = hi - lo;
                *v = if span > 0.0 { (*v - lo) / span } else { 0.0 };
            }
        }
    }
}

fn check_dims(dims: usize) -> Result<(), InputError> {
    if !(2..=MAX_EMBED_DIMS).contains(&dims) {
        return Err(InputError::InvalidParameter {
            name: "no_dims",
            reason: format!("must be 2 or 3, got {dims}"),
        });
    }
    Ok(())
}

/// Box-Muller standard normal sample.
pub(crate) fn gauss_random(rng: &mut impl Rng) -> f64 {
    // Clamp u1 away from 0 to avoid ln(0) = -inf
    let u1: f64 = rng.random::<f64>().max(f64::MIN_POSITIVE);
    let u2: f64 = rng.random();
    (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}
